//! A minimal tagged-value codec used for the metadata layer of the container.
//! Values are self-describing: each one starts with a type byte, followed by a
//! big-endian payload. Dictionaries nest as dict(pair(name_a, a), dict(pair(name_b, b), ...)),
//! terminated by a null.
//!
//! An empty dictionary serializes to a bare null byte; `parse` therefore returns
//! [`Tag::Null`] for it, and the extras codec treats null as an empty dict.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use thiserror::Error;

/// String-keyed dictionary which preserves insertion order.
///
/// Order matters: extras entries are replayed as annotations in the order the
/// writer inserted them. Lookups are linear, which is fine for the handful of
/// keys a header carries.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct Dict(Vec<(String, Tag)>);

impl Dict {
    pub fn new() -> Dict {
        Dict(Vec::new())
    }

    /// Inserts or replaces. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: Tag) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Tag> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[(String, Tag)] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum Tag {
    Bool(bool),
    Symbol(String),
    Int32(i32),
    Double(f64),
    Null(),
    Pair(Box<Tag>, Box<Tag>),
    Dict(Dict),
    UInt64(u64),
    Tuple(Vec<Tag>),
}

impl Tag {
    pub fn get_bool(&self) -> Option<bool> {
        match self {
            Tag::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i32(&self) -> Option<i32> {
        match self {
            Tag::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self) -> Option<f64> {
        match self {
            Tag::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self) -> Option<u64> {
        match self {
            Tag::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_symbol(&self) -> Option<&str> {
        match self {
            Tag::Symbol(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_dict(&self) -> Option<&Dict> {
        match self {
            Tag::Dict(v) => Some(v),
            _ => None,
        }
    }
}

// Wire type bytes.
const TAG_TRUE: u8 = 0x0;
const TAG_FALSE: u8 = 0x1;
const TAG_SYMBOL: u8 = 0x2;
const TAG_INT32: u8 = 0x3;
const TAG_DOUBLE: u8 = 0x4;
const TAG_NULL: u8 = 0x6;
const TAG_PAIR: u8 = 0x7;
const TAG_DICT: u8 = 0x9;
const TAG_UINT64: u8 = 0xb;
const TAG_TUPLE: u8 = 0xc;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unexpected EOF while parsing")]
    UnexpectedEOF(),
    #[error("Dict entry didn't follow dict(pair(name_a, a), ...) structure")]
    MalformedDict(),
    #[error("Unknown type byte {0:#x}")]
    UnknownTypeTag(u8),
    #[error("Reader I/O error while parsing")]
    IoError(#[from] std::io::Error),
    #[error("Symbol was not UTF-8 encoded, likely corrupt file")]
    Utf8Error(#[from] std::string::FromUtf8Error),
}

fn parse_symbol<T: Read>(reader: &mut T) -> Result<Tag, ParseError> {
    let len = reader.read_u16::<BigEndian>()?;
    let mut bytes = vec![0u8; len as usize];

    reader.read_exact(&mut bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ParseError::UnexpectedEOF()
        } else {
            ParseError::IoError(e)
        }
    })?;

    Ok(Tag::Symbol(String::from_utf8(bytes)?))
}

fn parse_pair_inner<T: Read>(reader: &mut T) -> Result<(Tag, Tag), ParseError> {
    let first = parse(reader)?;
    let second = parse(reader)?;
    Ok((first, second))
}

fn parse_pair<T: Read>(reader: &mut T) -> Result<Tag, ParseError> {
    let ab = parse_pair_inner(reader)?;
    Ok(Tag::Pair(Box::new(ab.0), Box::new(ab.1)))
}

fn expect_byte<T: Read>(reader: &mut T) -> Result<u8, ParseError> {
    let mut byte_buf: [u8; 1] = Default::default();
    let num_read = reader.read(&mut byte_buf)?;
    if num_read != 1 {
        // EOF or similar
        return Err(ParseError::UnexpectedEOF());
    }

    Ok(byte_buf[0])
}

fn parse_dict_inner<T: Read>(rdr: &mut T, tgt: &mut Dict) -> Result<(), ParseError> {
    // The "pair" byte
    if expect_byte(rdr)? != TAG_PAIR {
        return Err(ParseError::MalformedDict());
    }

    let pair = parse_pair_inner(rdr)?;

    if let Tag::Symbol(name) = pair.0 {
        tgt.insert(name, pair.1);
    } else {
        return Err(ParseError::MalformedDict());
    }

    let next_byte = expect_byte(rdr)?;

    match next_byte {
        TAG_NULL => Ok(()),
        TAG_DICT => parse_dict_inner(rdr, tgt),
        _ => Err(ParseError::MalformedDict()),
    }
}

fn parse_dict<T: Read>(reader: &mut T) -> Result<Tag, ParseError> {
    // A dict is formed as dict(pair(name_a, a), dict(pair(name_b, b), ...))
    let mut dict = Dict::new();
    parse_dict_inner(reader, &mut dict)?;
    Ok(Tag::Dict(dict))
}

fn parse_tuple<T: Read>(reader: &mut T) -> Result<Tag, ParseError> {
    let num = reader.read_u32::<BigEndian>()?;
    let mut vec = Vec::with_capacity(num.min(1024) as usize);
    for _ in 0..num {
        vec.push(parse(reader)?)
    }
    Ok(Tag::Tuple(vec))
}

fn parse_tag<T: Read>(reader: &mut T, kind: u8) -> Result<Tag, ParseError> {
    match kind {
        TAG_TRUE => Ok(Tag::Bool(true)),
        TAG_FALSE => Ok(Tag::Bool(false)),
        TAG_SYMBOL => parse_symbol(reader),
        TAG_INT32 => Ok(Tag::Int32(reader.read_i32::<BigEndian>()?)),
        TAG_DOUBLE => Ok(Tag::Double(reader.read_f64::<BigEndian>()?)),
        TAG_NULL => Ok(Tag::Null()),
        TAG_PAIR => parse_pair(reader),
        TAG_DICT => parse_dict(reader),
        TAG_UINT64 => Ok(Tag::UInt64(reader.read_u64::<BigEndian>()?)),
        TAG_TUPLE => parse_tuple(reader),
        x => Err(ParseError::UnknownTypeTag(x)),
    }
}

/// The reader must be positioned at the start of a Tag
pub fn parse<T: Read>(reader: &mut T) -> Result<Tag, ParseError> {
    let byte = expect_byte(reader)?;
    parse_tag(reader, byte)
}

/// Tries to read a tag, but if EOF is found on the first read, None is returned
/// instead of an error.
/// The reader must be positioned at the start of a Tag
pub fn parse_maybe_eof<T: Read>(reader: &mut T) -> Result<Option<Tag>, ParseError> {
    let byte = match expect_byte(reader) {
        Err(e) => match e {
            ParseError::UnexpectedEOF() => return Ok(None),
            _ => return Err(e),
        },
        Ok(v) => v,
    };
    match parse_tag(reader, byte) {
        Err(e) => Err(e),
        Ok(v) => Ok(Some(v)),
    }
}

fn serialize_symbol<W: Write>(writer: &mut W, sym: &str) -> std::io::Result<()> {
    let bytes = sym.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "symbol longer than 65535 bytes")
    })?;
    writer.write_u8(TAG_SYMBOL)?;
    writer.write_u16::<BigEndian>(len)?;
    writer.write_all(bytes)
}

/// Serializes a dictionary body, including the leading dict byte of the first
/// entry. An empty dict degenerates to a bare null.
pub fn serialize_dict<W: Write>(writer: &mut W, dict: &Dict) -> std::io::Result<()> {
    for (key, value) in dict.entries() {
        writer.write_u8(TAG_DICT)?;
        writer.write_u8(TAG_PAIR)?;
        serialize_symbol(writer, key)?;
        serialize(writer, value)?;
    }
    writer.write_u8(TAG_NULL)
}

/// Writes a tag in the wire format understood by [`parse`].
pub fn serialize<W: Write>(writer: &mut W, tag: &Tag) -> std::io::Result<()> {
    match tag {
        Tag::Bool(true) => writer.write_u8(TAG_TRUE),
        Tag::Bool(false) => writer.write_u8(TAG_FALSE),
        Tag::Symbol(sym) => serialize_symbol(writer, sym),
        Tag::Int32(v) => {
            writer.write_u8(TAG_INT32)?;
            writer.write_i32::<BigEndian>(*v)
        }
        Tag::Double(v) => {
            writer.write_u8(TAG_DOUBLE)?;
            writer.write_f64::<BigEndian>(*v)
        }
        Tag::Null() => writer.write_u8(TAG_NULL),
        Tag::Pair(a, b) => {
            writer.write_u8(TAG_PAIR)?;
            serialize(writer, a)?;
            serialize(writer, b)
        }
        Tag::Dict(dict) => serialize_dict(writer, dict),
        Tag::UInt64(v) => {
            writer.write_u8(TAG_UINT64)?;
            writer.write_u64::<BigEndian>(*v)
        }
        Tag::Tuple(vec) => {
            writer.write_u8(TAG_TUPLE)?;
            writer.write_u32::<BigEndian>(vec.len() as u32)?;
            for element in vec {
                serialize(writer, element)?;
            }
            Ok(())
        }
    }
}

pub fn to_bytes(tag: &Tag) -> Vec<u8> {
    let mut out = Vec::new();
    serialize(&mut out, tag).expect("writing to a Vec cannot fail");
    out
}

pub fn dict_to_bytes(dict: &Dict) -> Vec<u8> {
    let mut out = Vec::new();
    serialize_dict(&mut out, dict).expect("writing to a Vec cannot fail");
    out
}
