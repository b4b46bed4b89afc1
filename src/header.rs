use crate::pmt::{self, Dict, ParseError, Tag};
use crate::rxtime::RxTime;
use byteorder::{ByteOrder, LittleEndian};
use num_complex::Complex;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Codec compatibility tag written into every header.
pub const METADATA_VERSION: i32 = 0;

/// Size in bytes of a serialized header. Every header value type is
/// fixed-width, so encoding is deterministic and both sides of the format can
/// frame headers by reading exactly this many bytes. Changing the header
/// layout breaks existing containers and requires bumping [`METADATA_VERSION`].
pub const HEADER_LENGTH: usize = 186;

#[derive(Error, Debug)]
pub enum InvalidHeaderError {
    #[error("Header was not a dictionary")]
    HeaderNotDictionary,
    #[error("Missing field {0} in header")]
    MissingField(&'static str),
    #[error("Field {0} was present in header, but was of unexpected type")]
    WrongTypeField(&'static str),
    #[error("Type {0} was present in header, but this represents no known data type")]
    WrongDataType(i32),
    #[error("Field {0} was present in header, but its value is out of range")]
    InvalidField(&'static str),
    #[error("Header bytes could not be deserialized")]
    Undecodable(#[from] ParseError),
}

#[derive(Error, Debug)]
pub enum InvalidExtrasError {
    #[error("Extras bytes could not be deserialized")]
    Undecodable(#[from] ParseError),
    #[error("Extras were present but not a dictionary")]
    NotADictionary,
}

/// Sample encoding of a segment's payload.
/// Any of these can additionally be "complex", which doubles each item into an
/// interleaved re/im pair.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DataType {
    Byte,
    Short,
    Int,
    // tags 3 and 4 (long, long long) are reserved and never written
    Float,
    Double,
}

impl DataType {
    pub fn from_int(i: i32) -> Result<Self, InvalidHeaderError> {
        Ok(match i {
            0 => Self::Byte,
            1 => Self::Short,
            2 => Self::Int,
            5 => Self::Float,
            6 => Self::Double,
            _ => return Err(InvalidHeaderError::WrongDataType(i)),
        })
    }

    pub fn to_int(&self) -> i32 {
        match self {
            Self::Byte => 0,
            Self::Short => 1,
            Self::Int => 2,
            Self::Float => 5,
            Self::Double => 6,
        }
    }

    /// Width in bytes of one scalar of this type.
    pub fn size(&self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Short => 2,
            Self::Int => 4,
            Self::Float => 4,
            Self::Double => 8,
        }
    }

    pub fn is_floating(&self) -> bool {
        *self == Self::Float || *self == Self::Double
    }
}

/// A scalar or complex sample that can be written to and read from a
/// container payload. Payload bytes are little-endian.
pub trait Sample: Copy {
    const DTYPE: DataType;
    const COMPLEX: bool;
    const SIZE: usize;

    fn encode_le(&self, buf: &mut [u8]);
    fn decode_le(buf: &[u8]) -> Self;
}

impl Sample for i8 {
    const DTYPE: DataType = DataType::Byte;
    const COMPLEX: bool = false;
    const SIZE: usize = 1;

    fn encode_le(&self, buf: &mut [u8]) {
        buf[0] = *self as u8;
    }

    fn decode_le(buf: &[u8]) -> Self {
        buf[0] as i8
    }
}

impl Sample for i16 {
    const DTYPE: DataType = DataType::Short;
    const COMPLEX: bool = false;
    const SIZE: usize = 2;

    fn encode_le(&self, buf: &mut [u8]) {
        LittleEndian::write_i16(buf, *self);
    }

    fn decode_le(buf: &[u8]) -> Self {
        LittleEndian::read_i16(buf)
    }
}

impl Sample for i32 {
    const DTYPE: DataType = DataType::Int;
    const COMPLEX: bool = false;
    const SIZE: usize = 4;

    fn encode_le(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode_le(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl Sample for f32 {
    const DTYPE: DataType = DataType::Float;
    const COMPLEX: bool = false;
    const SIZE: usize = 4;

    fn encode_le(&self, buf: &mut [u8]) {
        LittleEndian::write_f32(buf, *self);
    }

    fn decode_le(buf: &[u8]) -> Self {
        LittleEndian::read_f32(buf)
    }
}

impl Sample for f64 {
    const DTYPE: DataType = DataType::Double;
    const COMPLEX: bool = false;
    const SIZE: usize = 8;

    fn encode_le(&self, buf: &mut [u8]) {
        LittleEndian::write_f64(buf, *self);
    }

    fn decode_le(buf: &[u8]) -> Self {
        LittleEndian::read_f64(buf)
    }
}

impl<T: Sample> Sample for Complex<T> {
    const DTYPE: DataType = T::DTYPE;
    const COMPLEX: bool = true;
    const SIZE: usize = 2 * T::SIZE;

    fn encode_le(&self, buf: &mut [u8]) {
        self.re.encode_le(&mut buf[..T::SIZE]);
        self.im.encode_le(&mut buf[T::SIZE..]);
    }

    fn decode_le(buf: &[u8]) -> Self {
        Complex::new(T::decode_le(&buf[..T::SIZE]), T::decode_le(&buf[T::SIZE..]))
    }
}

/// Header of one segment, as embedded in the container.
#[derive(PartialEq, Debug, Clone)]
pub struct Header {
    /// Codec compatibility tag, [`METADATA_VERSION`] for files written by
    /// this crate
    pub version: i32,
    /// Sample rate of the data
    pub samp_rate: f64,
    /// Reception time of the first sample of this segment
    pub rx_time: RxTime,
    /// Size of one item in bytes
    pub size: i32,
    /// Type of the data
    pub dtype: DataType,
    /// Is the data complex?
    pub cplx: bool,
    /// Offset of the first byte of this segment's data in the primary stream
    pub strt: u64,
    /// Size in bytes of the data in this segment. 0 until the segment is
    /// finalized by a rotation or close; a reader treats a 0 here as "the
    /// rest of the stream".
    pub bytes: u64,
    /// Byte length of the extras block following this header
    pub extra_len: u64,
    /// Whether headers live in a companion stream instead of the data stream
    pub detached: bool,
}

impl Header {
    /// Serializes the header. The output is always exactly
    /// [`HEADER_LENGTH`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = Dict::new();
        dict.insert("version", Tag::Int32(self.version));
        dict.insert("rx_rate", Tag::Double(self.samp_rate));
        dict.insert(
            "rx_time",
            Tag::Tuple(vec![
                Tag::UInt64(self.rx_time.secs()),
                Tag::Double(self.rx_time.frac()),
            ]),
        );
        dict.insert("size", Tag::Int32(self.size));
        dict.insert("type", Tag::Int32(self.dtype.to_int()));
        dict.insert("cplx", Tag::Bool(self.cplx));
        dict.insert("strt", Tag::UInt64(self.strt));
        dict.insert("bytes", Tag::UInt64(self.bytes));
        dict.insert("extra_len", Tag::UInt64(self.extra_len));
        dict.insert("detached", Tag::Bool(self.detached));

        let out = pmt::dict_to_bytes(&dict);
        debug_assert_eq!(out.len(), HEADER_LENGTH);
        out
    }

    /// Exact inverse of [`Header::encode`]. Returns either a complete header
    /// or an error; caller state is never partially updated.
    pub fn decode(bytes: &[u8]) -> Result<Header, InvalidHeaderError> {
        let mut reader = bytes;
        Header::from_tag(pmt::parse(&mut reader)?)
    }

    pub fn from_tag(tag: Tag) -> Result<Header, InvalidHeaderError> {
        let dict = if let Tag::Dict(as_dict) = tag {
            as_dict
        } else {
            return Err(InvalidHeaderError::HeaderNotDictionary);
        };

        let version = field(&dict, "version")?
            .get_i32()
            .ok_or(InvalidHeaderError::WrongTypeField("version"))?;

        let samp_rate = field(&dict, "rx_rate")?
            .get_f64()
            .ok_or(InvalidHeaderError::WrongTypeField("rx_rate"))?;
        if !(samp_rate.is_finite() && samp_rate > 0.0) {
            return Err(InvalidHeaderError::InvalidField("rx_rate"));
        }

        let (rx_time_a, rx_time_b) = match field(&dict, "rx_time")? {
            Tag::Tuple(vec) => {
                let a = vec
                    .first()
                    .ok_or(InvalidHeaderError::MissingField("rx_time seconds"))?;
                let b = vec
                    .get(1)
                    .ok_or(InvalidHeaderError::MissingField("rx_time fractional"))?;
                (a, b)
            }
            _ => return Err(InvalidHeaderError::WrongTypeField("rx_time")),
        };

        let rx_time_secs = rx_time_a
            .get_u64()
            .ok_or(InvalidHeaderError::WrongTypeField("rx_time seconds"))?;
        let rx_time_frac = rx_time_b
            .get_f64()
            .ok_or(InvalidHeaderError::WrongTypeField("rx_time fractional"))?;
        if !(0.0..1.0).contains(&rx_time_frac) {
            return Err(InvalidHeaderError::InvalidField("rx_time fractional"));
        }

        let size = field(&dict, "size")?
            .get_i32()
            .ok_or(InvalidHeaderError::WrongTypeField("size"))?;
        if size <= 0 {
            return Err(InvalidHeaderError::InvalidField("size"));
        }

        let dtype = DataType::from_int(
            field(&dict, "type")?
                .get_i32()
                .ok_or(InvalidHeaderError::WrongTypeField("type"))?,
        )?;

        let cplx = field(&dict, "cplx")?
            .get_bool()
            .ok_or(InvalidHeaderError::WrongTypeField("cplx"))?;

        let strt = field(&dict, "strt")?
            .get_u64()
            .ok_or(InvalidHeaderError::WrongTypeField("strt"))?;

        let bytes = field(&dict, "bytes")?
            .get_u64()
            .ok_or(InvalidHeaderError::WrongTypeField("bytes"))?;

        let extra_len = field(&dict, "extra_len")?
            .get_u64()
            .ok_or(InvalidHeaderError::WrongTypeField("extra_len"))?;

        let detached = field(&dict, "detached")?
            .get_bool()
            .ok_or(InvalidHeaderError::WrongTypeField("detached"))?;

        Ok(Header {
            version,
            samp_rate,
            rx_time: RxTime::new(rx_time_secs, rx_time_frac),
            size,
            dtype,
            cplx,
            strt,
            bytes,
            extra_len,
            detached,
        })
    }

    /// Gets the duration of one sample at the sample rate of the header
    pub fn sample_duration(&self) -> f64 {
        1.0 / self.samp_rate
    }

    /// Expected reception time of the item at offset `item` from this
    /// segment's first sample, assuming the sample rate holds.
    pub fn time_of_item(&self, item: u64) -> RxTime {
        self.rx_time.advance(item, self.samp_rate)
    }

    /// Only returns true if the payload is directly representable as `T`,
    /// including signed-ness, width and complex-ness.
    pub fn reads_directly_to<T: Sample>(&self) -> bool {
        T::DTYPE == self.dtype && T::COMPLEX == self.cplx && T::SIZE == self.size as usize
    }
}

fn field<'a>(dict: &'a Dict, name: &'static str) -> Result<&'a Tag, InvalidHeaderError> {
    dict.get(name).ok_or(InvalidHeaderError::MissingField(name))
}

/// Serializes an extras dictionary. An empty dict produces no bytes at all
/// (`extra_len` of 0).
pub fn encode_extras(extras: &Dict) -> Vec<u8> {
    if extras.is_empty() {
        Vec::new()
    } else {
        pmt::dict_to_bytes(extras)
    }
}

/// Decodes an extras block. The caller must pass exactly the `extra_len`
/// bytes announced by the owning header; an empty slice yields an empty dict
/// without parsing anything.
pub fn decode_extras(bytes: &[u8]) -> Result<Dict, InvalidExtrasError> {
    if bytes.is_empty() {
        return Ok(Dict::new());
    }
    let mut reader = bytes;
    match pmt::parse(&mut reader)? {
        Tag::Dict(dict) => Ok(dict),
        Tag::Null() => Ok(Dict::new()),
        _ => Err(InvalidExtrasError::NotADictionary),
    }
}

/// Conventional companion header path for detached containers: the data path
/// with ".hdr" appended.
pub fn detached_header_path(data_path: &Path) -> PathBuf {
    let mut os = data_path.as_os_str().to_os_string();
    os.push(".hdr");
    PathBuf::from(os)
}
