use crate::header::{
    DataType, HEADER_LENGTH, Header, METADATA_VERSION, Sample, detached_header_path,
    encode_extras,
};
use crate::pmt::Dict;
use crate::rxtime::RxTime;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Invalid sink parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("Write length {0} is not a multiple of the item size {1}")]
    MisalignedWrite(usize, usize),
    #[error("Sample type does not match the stream's configured format")]
    WrongSampleType,
    #[error("Sink is already closed")]
    Closed,
    #[error("Writer I/O error")]
    Io(#[from] std::io::Error),
}

/// Construction parameters for a [`MetaFileSink`].
#[derive(Clone, Debug)]
pub struct SinkOptions {
    item_size: usize,
    samp_rate: f64,
    dtype: DataType,
    cplx: bool,
    start_time: RxTime,
    max_segment_items: u64,
    extras: Dict,
    detached: bool,
}

impl SinkOptions {
    /// `item_size` is the byte width of one item as it will be written, e.g.
    /// 8 for a complex float sample.
    pub fn new(item_size: usize, samp_rate: f64, dtype: DataType, cplx: bool) -> SinkOptions {
        SinkOptions {
            item_size,
            samp_rate,
            dtype,
            cplx,
            start_time: RxTime::from_secs(0.0),
            max_segment_items: 1_000_000,
            extras: Dict::new(),
            detached: false,
        }
    }

    /// Capture time of the stream's first sample. Defaults to 0.
    pub fn start_time(mut self, start_time: RxTime) -> Self {
        self.start_time = start_time;
        self
    }

    /// Rotation cadence: a new segment starts once this many items have been
    /// written to the current one. Defaults to 1M items.
    pub fn max_segment_items(mut self, items: u64) -> Self {
        self.max_segment_items = items;
        self
    }

    /// User metadata replayed to readers at the first sample of every
    /// segment. Serialized once; immutable for the stream's lifetime.
    pub fn extras(mut self, extras: Dict) -> Self {
        self.extras = extras;
        self
    }

    /// Store headers in a companion `<path>.hdr` file, keeping the data
    /// stream pure sample bytes.
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }
}

/// Writes a sample stream to a container file, emitting a metadata header for
/// every segment of at most `max_segment_items` items.
///
/// The first header is written on creation, so even a container that never
/// receives a sample holds one parseable segment. On rotation and on close
/// the current header is re-written in place with the segment's final byte
/// count.
pub struct MetaFileSink {
    data: BufWriter<File>,
    /// Companion header stream, present in detached mode only
    hdr: Option<BufWriter<File>>,
    /// Header of the segment currently being written
    cur: Header,
    extra_bytes: Vec<u8>,
    max_seg_bytes: u64,
    seg_bytes: u64,
    /// Offset of the current segment's header in its stream
    last_hdr_pos: u64,
    unbuffered: bool,
    closed: bool,
}

impl MetaFileSink {
    pub fn create(path: impl AsRef<Path>, options: SinkOptions) -> Result<MetaFileSink, SinkError> {
        let path = path.as_ref();
        if options.item_size == 0 || options.item_size > i32::MAX as usize {
            return Err(SinkError::InvalidParameter("item_size"));
        }
        if !(options.samp_rate.is_finite() && options.samp_rate > 0.0) {
            return Err(SinkError::InvalidParameter("samp_rate"));
        }
        let max_seg_bytes = options
            .max_segment_items
            .checked_mul(options.item_size as u64)
            .filter(|bytes| *bytes > 0)
            .ok_or(SinkError::InvalidParameter("max_segment_items"))?;

        let extra_bytes = encode_extras(&options.extras);
        let data = BufWriter::new(File::create(path)?);
        let hdr = if options.detached {
            Some(BufWriter::new(File::create(detached_header_path(path))?))
        } else {
            None
        };

        let cur = Header {
            version: METADATA_VERSION,
            samp_rate: options.samp_rate,
            rx_time: options.start_time,
            size: options.item_size as i32,
            dtype: options.dtype,
            cplx: options.cplx,
            strt: 0, // filled in by append_header
            bytes: 0,
            extra_len: extra_bytes.len() as u64,
            detached: options.detached,
        };

        let mut sink = MetaFileSink {
            data,
            hdr,
            cur,
            extra_bytes,
            max_seg_bytes,
            seg_bytes: 0,
            last_hdr_pos: 0,
            unbuffered: false,
            closed: false,
        };
        sink.append_header()?;
        log::debug!(
            "opened meta sink at {} (detached: {})",
            path.display(),
            options.detached
        );
        Ok(sink)
    }

    /// Appends raw sample bytes. The length must be a multiple of the item
    /// size. A write that crosses the rotation cadence is split at the
    /// boundary, so segments never exceed `max_segment_items` items.
    pub fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        let item_size = self.cur.size as usize;
        if data.len() % item_size != 0 {
            return Err(SinkError::MisalignedWrite(data.len(), item_size));
        }

        let mut rest = data;
        while !rest.is_empty() {
            if self.seg_bytes >= self.max_seg_bytes {
                self.rotate()?;
            }
            let room = (self.max_seg_bytes - self.seg_bytes).min(rest.len() as u64) as usize;
            self.data.write_all(&rest[..room])?;
            self.seg_bytes += room as u64;
            rest = &rest[room..];
        }
        if self.unbuffered {
            self.flush_streams()?;
        }
        Ok(())
    }

    /// Typed variant of [`MetaFileSink::write`]. `T` must agree with the
    /// stream's configured data type, complex flag and item size.
    pub fn write_samples<T: Sample>(&mut self, samples: &[T]) -> Result<(), SinkError> {
        if !self.cur.reads_directly_to::<T>() {
            return Err(SinkError::WrongSampleType);
        }
        let mut bytes = vec![0u8; samples.len() * T::SIZE];
        for (sample, chunk) in samples.iter().zip(bytes.chunks_exact_mut(T::SIZE)) {
            sample.encode_le(chunk);
        }
        self.write(&bytes)
    }

    /// When enabled, every write and rotation is flushed to the OS
    /// immediately. Costs throughput, but lets a concurrent reader of a
    /// detached container observe up-to-date content, and bounds data loss
    /// on a crash.
    pub fn set_unbuffered(&mut self, unbuffered: bool) {
        self.unbuffered = unbuffered;
    }

    /// Finalizes the last header and flushes all streams. Safe to call more
    /// than once; later calls are no-ops. Also invoked on drop, where errors
    /// are discarded, so call this explicitly to observe them.
    pub fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.finalize_current_header()?;
        self.flush_streams()?;
        log::debug!("closed meta sink ({} bytes in final segment)", self.seg_bytes);
        Ok(())
    }

    /// Re-writes the current segment's header in place with the final byte
    /// count, leaving the stream positioned at its end.
    fn finalize_current_header(&mut self) -> Result<(), SinkError> {
        self.cur.bytes = self.seg_bytes;
        let frame = self.cur.encode();
        let last = self.last_hdr_pos;
        let dst = match self.hdr.as_mut() {
            Some(hdr) => hdr,
            None => &mut self.data,
        };
        dst.seek(SeekFrom::Start(last))?;
        dst.write_all(&frame)?;
        dst.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), SinkError> {
        self.finalize_current_header()?;
        let items = self.seg_bytes / self.cur.size as u64;
        self.cur.rx_time = self.cur.time_of_item(items);
        self.cur.bytes = 0;
        self.seg_bytes = 0;
        self.append_header()?;
        if self.unbuffered {
            self.flush_streams()?;
        }
        log::debug!("rotated segment, new data offset {}", self.cur.strt);
        Ok(())
    }

    /// Writes the current header and the extras block as one frame at the
    /// end of the header destination; a reader never observes a header
    /// without its extras.
    fn append_header(&mut self) -> Result<(), SinkError> {
        let data_end = self.data.stream_position()?;
        self.cur.strt = if self.cur.detached {
            data_end
        } else {
            data_end + HEADER_LENGTH as u64 + self.cur.extra_len
        };

        let mut frame = self.cur.encode();
        frame.extend_from_slice(&self.extra_bytes);

        let dst = match self.hdr.as_mut() {
            Some(hdr) => hdr,
            None => &mut self.data,
        };
        let at = dst.stream_position()?;
        dst.write_all(&frame)?;
        self.last_hdr_pos = at;
        Ok(())
    }

    fn flush_streams(&mut self) -> Result<(), SinkError> {
        self.data.flush()?;
        if let Some(hdr) = self.hdr.as_mut() {
            hdr.flush()?;
        }
        Ok(())
    }
}

impl Drop for MetaFileSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
