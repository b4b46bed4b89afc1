use crate::header::{
    HEADER_LENGTH, Header, InvalidExtrasError, InvalidHeaderError, Sample, decode_extras,
    detached_header_path,
};
use crate::pmt::{Dict, Tag};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Malformed header at byte {0}")]
    MalformedHeader(u64, #[source] InvalidHeaderError),
    #[error("Malformed extras at byte {0}")]
    MalformedExtras(u64, #[source] InvalidExtrasError),
    #[error("Truncated extras at byte {0}: header announced {1} bytes, stream has {2}")]
    TruncatedExtras(u64, u64, u64),
    #[error("Segment data offsets are not increasing: {0} followed by {1}")]
    NonMonotonicSegment(u64, u64),
    #[error("Sample type does not match the segment's data format")]
    WrongSampleType,
    #[error("Reader I/O error")]
    Io(#[from] std::io::Error),
}

/// Metadata annotation anchored at a sample of the reconstructed stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub key: String,
    pub value: Tag,
    /// Index of the sample this annotation belongs to
    pub offset: u64,
}

/// One parsed segment: header, extras and the location of its data span.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: Header,
    pub extras: Dict,
    /// Offset of the segment's data in the primary stream
    pub data_offset: u64,
    /// Length in bytes of the segment's data
    pub data_len: u64,
    /// Index of the segment's first sample in the reconstructed stream
    pub sample_offset: u64,
}

impl Segment {
    pub fn num_items(&self) -> u64 {
        self.data_len / self.header.size as u64
    }

    /// The annotations this segment replays, all anchored at its first
    /// sample: the synthesized `rx_rate` and `rx_time`, then the extras
    /// entries in insertion order.
    pub fn annotations(&self) -> Vec<Annotation> {
        let offset = self.sample_offset;
        let mut out = Vec::with_capacity(2 + self.extras.len());
        out.push(Annotation {
            key: "rx_rate".to_string(),
            value: Tag::Double(self.header.samp_rate),
            offset,
        });
        out.push(Annotation {
            key: "rx_time".to_string(),
            value: Tag::Tuple(vec![
                Tag::UInt64(self.header.rx_time.secs()),
                Tag::Double(self.header.rx_time.frac()),
            ]),
            offset,
        });
        for (key, value) in self.extras.entries() {
            out.push(Annotation {
                key: key.clone(),
                value: value.clone(),
                offset,
            });
        }
        out
    }
}

/// One segment's worth of output from [`MetaFileSource::produce`]: the
/// annotations come with (never after) the segment's data.
#[derive(Debug, Clone)]
pub struct Produced {
    pub header: Header,
    pub annotations: Vec<Annotation>,
    pub data: Vec<u8>,
    /// Index of `data`'s first sample in the reconstructed stream
    pub sample_offset: u64,
}

impl Produced {
    /// Decodes the payload as samples of type `T`, which must agree with the
    /// segment's recorded format.
    pub fn samples<T: Sample>(&self) -> Result<Vec<T>, SourceError> {
        if !self.header.reads_directly_to::<T>() {
            return Err(SourceError::WrongSampleType);
        }
        Ok(self.data.chunks_exact(T::SIZE).map(T::decode_le).collect())
    }
}

/// Reads a container file back as a flat sample stream plus its annotations.
///
/// All segment headers are parsed up front; sample data is only touched by
/// [`MetaFileSource::produce`]. A short header slot (fewer than
/// [`HEADER_LENGTH`] bytes left, including none at all) terminates the scan
/// normally; it is how end of stream is detected, not an error.
#[derive(Debug)]
pub struct MetaFileSource {
    data: BufReader<File>,
    segments: Vec<Segment>,
    cursor: usize,
}

impl MetaFileSource {
    /// Opens a container with attached (inline) headers.
    pub fn open(path: impl AsRef<Path>) -> Result<MetaFileSource, SourceError> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let segments = scan_attached(&mut reader)?;
        reader.rewind()?;
        log::debug!(
            "opened attached container {} with {} segments",
            path.display(),
            segments.len()
        );
        Ok(MetaFileSource {
            data: reader,
            segments,
            cursor: 0,
        })
    }

    /// Opens a container whose headers live in a companion stream. When
    /// `header_path` is None the conventional `<path>.hdr` is used.
    pub fn open_detached(
        path: impl AsRef<Path>,
        header_path: Option<&Path>,
    ) -> Result<MetaFileSource, SourceError> {
        let path = path.as_ref();
        let hdr_path = match header_path {
            Some(p) => p.to_path_buf(),
            None => detached_header_path(path),
        };
        let mut hdr_reader = BufReader::new(File::open(&hdr_path)?);
        let data_file = File::open(path)?;
        let data_len = data_file.metadata()?.len();
        let segments = scan_detached(&mut hdr_reader, data_len)?;
        log::debug!(
            "opened detached container {} ({} segments from {})",
            path.display(),
            segments.len(),
            hdr_path.display()
        );
        Ok(MetaFileSource {
            data: BufReader::new(data_file),
            segments,
            cursor: 0,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// All annotations of the stream in replay order, without touching the
    /// sample data.
    pub fn annotations(&self) -> Vec<Annotation> {
        self.segments.iter().flat_map(|s| s.annotations()).collect()
    }

    /// Yields the next segment of the stream, or None once exhausted.
    /// Restarting requires a fresh open.
    pub fn produce(&mut self) -> Result<Option<Produced>, SourceError> {
        let Some(segment) = self.segments.get(self.cursor) else {
            return Ok(None);
        };
        self.data.seek(SeekFrom::Start(segment.data_offset))?;
        let mut data = vec![0u8; segment.data_len as usize];
        self.data.read_exact(&mut data)?;

        let produced = Produced {
            header: segment.header.clone(),
            annotations: segment.annotations(),
            data,
            sample_offset: segment.sample_offset,
        };
        self.cursor += 1;
        Ok(Some(produced))
    }
}

/// Reads until `buf` is full or the stream ends; returns the filled count.
fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Reads one header+extras record starting at `pos`. None means the slot was
/// empty or short, the normal end-of-stream condition.
fn read_segment_record<R: Read>(
    r: &mut R,
    pos: u64,
    stream_len: u64,
) -> Result<Option<(Header, Dict)>, SourceError> {
    let mut slot = [0u8; HEADER_LENGTH];
    let got = read_fully(r, &mut slot)?;
    if got < HEADER_LENGTH {
        return Ok(None);
    }
    let header = Header::decode(&slot).map_err(|e| SourceError::MalformedHeader(pos, e))?;

    let extras_pos = pos + HEADER_LENGTH as u64;
    let available = stream_len - extras_pos;
    if header.extra_len > available {
        return Err(SourceError::TruncatedExtras(
            extras_pos,
            header.extra_len,
            available,
        ));
    }
    let mut extra_bytes = vec![0u8; header.extra_len as usize];
    r.read_exact(&mut extra_bytes)?;
    let extras =
        decode_extras(&extra_bytes).map_err(|e| SourceError::MalformedExtras(extras_pos, e))?;
    Ok(Some((header, extras)))
}

/// Scans a single-file container: headers interleave with data, each
/// segment's span is its header's byte count (a zero count, left by a writer
/// that never closed, extends to the end of the file).
fn scan_attached(r: &mut BufReader<File>) -> Result<Vec<Segment>, SourceError> {
    let file_len = r.seek(SeekFrom::End(0))?;
    r.rewind()?;

    let mut segments: Vec<Segment> = Vec::new();
    let mut pos = 0u64;
    let mut sample_offset = 0u64;
    loop {
        let Some((header, extras)) = read_segment_record(r, pos, file_len)? else {
            break;
        };
        if let Some(last) = segments.last() {
            if header.strt <= last.header.strt {
                return Err(SourceError::NonMonotonicSegment(
                    last.header.strt,
                    header.strt,
                ));
            }
        }

        let data_offset = pos + HEADER_LENGTH as u64 + header.extra_len;
        let available = file_len - data_offset;
        let data_len = if header.bytes == 0 {
            available
        } else {
            header.bytes.min(available)
        };
        r.seek(SeekFrom::Start(data_offset + data_len))?;
        pos = data_offset + data_len;

        let items = data_len / header.size as u64;
        segments.push(Segment {
            header,
            extras,
            data_offset,
            data_len,
            sample_offset,
        });
        sample_offset += items;
    }
    Ok(segments)
}

/// Scans a companion header stream: records are contiguous, and data spans
/// follow from consecutive segment offsets, the last segment extending to
/// the end of the data file.
fn scan_detached<R: Read + Seek>(hdr: &mut R, data_len: u64) -> Result<Vec<Segment>, SourceError> {
    let hdr_len = hdr.seek(SeekFrom::End(0))?;
    hdr.rewind()?;

    let mut records = Vec::new();
    let mut pos = 0u64;
    while let Some((header, extras)) = read_segment_record(hdr, pos, hdr_len)? {
        pos += HEADER_LENGTH as u64 + header.extra_len;
        records.push((header, extras));
    }

    let mut ends: Vec<u64> = records.iter().skip(1).map(|(h, _)| h.strt).collect();
    ends.push(data_len);

    let mut segments = Vec::with_capacity(records.len());
    let mut sample_offset = 0u64;
    for ((header, extras), end) in records.into_iter().zip(ends) {
        let start = header.strt;
        if end < start {
            return Err(SourceError::NonMonotonicSegment(start, end));
        }
        // Tolerate a data file shorter than the headers claim (live writer)
        let start = start.min(data_len);
        let end = end.min(data_len);

        let span = end - start;
        let items = span / header.size as u64;
        segments.push(Segment {
            header,
            extras,
            data_offset: start,
            data_len: span,
            sample_offset,
        });
        sample_offset += items;
    }
    Ok(segments)
}

#[cfg(test)]
mod source_tests {
    use super::*;
    use crate::header::{DataType, HEADER_LENGTH, encode_extras};
    use crate::rxtime::RxTime;
    use crate::sink::{MetaFileSink, SinkOptions};
    use num_complex::Complex;
    use std::fs;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn test_extras() -> Dict {
        let mut extras = Dict::new();
        extras.insert("samp_rate", Tag::Double(200_000.0));
        extras
    }

    fn complex_options() -> SinkOptions {
        SinkOptions::new(8, 200_000.0, DataType::Float, true).extras(test_extras())
    }

    fn complex_wave(n: usize) -> Vec<Complex<f32>> {
        (0..n)
            .map(|i| {
                let phase = i as f32 * 0.01;
                Complex::new(phase.cos(), phase.sin())
            })
            .collect()
    }

    fn with_key<'a>(annotations: &'a [Annotation], key: &str) -> Vec<&'a Annotation> {
        annotations.iter().filter(|a| a.key == key).collect()
    }

    /// Drains a source, returning the concatenated payload and all
    /// annotations in replay order.
    fn drain(source: &mut MetaFileSource) -> (Vec<u8>, Vec<Annotation>) {
        let mut data = Vec::new();
        let mut annotations = Vec::new();
        while let Some(produced) = source.produce().unwrap() {
            annotations.extend(produced.annotations);
            data.extend(produced.data);
        }
        (data, annotations)
    }

    #[test]
    fn read_complex_samples_attached_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.dat");
        let samples = complex_wave(1000);

        let mut sink = MetaFileSink::create(&path, complex_options()).unwrap();
        sink.write_samples(&samples).unwrap();
        sink.close().unwrap();

        let mut source = MetaFileSource::open(&path).unwrap();
        assert_eq!(source.segments().len(), 1);

        let produced = source.produce().unwrap().unwrap();
        assert_eq!(produced.sample_offset, 0);

        let rx_rate = with_key(&produced.annotations, "rx_rate");
        assert_eq!(rx_rate.len(), 1);
        assert_eq!(rx_rate[0].value, Tag::Double(200_000.0));
        assert_eq!(rx_rate[0].offset, 0);

        let samp_rate = with_key(&produced.annotations, "samp_rate");
        assert_eq!(samp_rate.len(), 1);
        assert_eq!(samp_rate[0].value, Tag::Double(200_000.0));
        assert_eq!(samp_rate[0].offset, 0);

        assert_eq!(produced.samples::<Complex<f32>>().unwrap(), samples);
        assert!(source.produce().unwrap().is_none());
    }

    #[test]
    fn read_complex_samples_detached_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.dat");
        let samples = complex_wave(1000);

        let mut sink = MetaFileSink::create(&path, complex_options().detached(true)).unwrap();
        sink.write_samples(&samples).unwrap();
        sink.close().unwrap();
        assert!(detached_header_path(&path).exists());

        let mut source = MetaFileSource::open_detached(&path, None).unwrap();
        assert_eq!(source.segments().len(), 1);
        assert_eq!(source.segments()[0].data_offset, 0);

        let produced = source.produce().unwrap().unwrap();
        assert_eq!(produced.samples::<Complex<f32>>().unwrap(), samples);
        assert_eq!(with_key(&produced.annotations, "rx_rate").len(), 1);
        assert!(source.produce().unwrap().is_none());
    }

    #[test]
    fn attached_and_detached_are_equivalent() {
        let dir = tempfile::tempdir().unwrap();
        let attached = dir.path().join("attached.dat");
        let detached = dir.path().join("detached.dat");
        let samples = complex_wave(2500);

        for (path, is_detached) in [(&attached, false), (&detached, true)] {
            let opts = complex_options()
                .max_segment_items(1000)
                .detached(is_detached);
            let mut sink = MetaFileSink::create(path, opts).unwrap();
            sink.write_samples(&samples).unwrap();
            sink.close().unwrap();
        }

        let (data_a, ann_a) = drain(&mut MetaFileSource::open(&attached).unwrap());
        let (data_d, ann_d) = drain(&mut MetaFileSource::open_detached(&detached, None).unwrap());

        assert_eq!(data_a, data_d);
        assert_eq!(ann_a, ann_d);
        // 2500 samples at a 1000 item cadence makes three segments
        assert_eq!(with_key(&ann_a, "rx_rate").len(), 3);
    }

    #[test]
    fn rotation_splits_segments_and_advances_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotated.dat");
        let wave: Vec<f32> = (0..250).map(|i| i as f32).collect();

        let opts = SinkOptions::new(4, 200_000.0, DataType::Float, false)
            .extras(test_extras())
            .max_segment_items(100)
            .start_time(RxTime::from_secs(100.0));
        let mut sink = MetaFileSink::create(&path, opts).unwrap();
        // Split across calls; one call crosses a segment boundary
        sink.write_samples(&wave[..30]).unwrap();
        sink.write_samples(&wave[30..]).unwrap();
        sink.close().unwrap();

        let mut source = MetaFileSource::open(&path).unwrap();
        let segments = source.segments().to_vec();
        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments.iter().map(|s| s.data_len).collect::<Vec<_>>(),
            [400, 400, 200]
        );
        assert_eq!(
            segments.iter().map(|s| s.sample_offset).collect::<Vec<_>>(),
            [0, 100, 200]
        );
        assert_eq!(
            segments.iter().map(|s| s.header.bytes).collect::<Vec<_>>(),
            [400, 400, 200]
        );
        assert_eq!(segments[2].num_items(), 50);

        // Each rotation advances rx_time by items / samp_rate
        let tol = 1e-9;
        assert!(segments[0].header.rx_time.is_same_as(RxTime::new(100, 0.0), tol));
        assert!(segments[1].header.rx_time.is_same_as(RxTime::new(100, 0.0005), tol));
        assert!(segments[2].header.rx_time.is_same_as(RxTime::new(100, 0.001), tol));

        let (data, annotations) = drain(&mut source);
        let read_back: Vec<f32> = data.chunks_exact(4).map(f32::decode_le).collect();
        assert_eq!(read_back, wave);

        let offsets: Vec<u64> = with_key(&annotations, "rx_rate")
            .iter()
            .map(|a| a.offset)
            .collect();
        assert_eq!(offsets, [0, 100, 200]);
    }

    #[test]
    fn empty_container_has_one_segment_and_no_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.dat");

        let mut sink = MetaFileSink::create(&path, complex_options()).unwrap();
        sink.close().unwrap();

        let mut source = MetaFileSource::open(&path).unwrap();
        assert_eq!(source.segments().len(), 1);
        // rx_rate, rx_time and the one extras entry
        assert_eq!(source.annotations().len(), 3);

        let produced = source.produce().unwrap().unwrap();
        assert!(produced.data.is_empty());
        assert_eq!(with_key(&produced.annotations, "rx_rate").len(), 1);
        assert_eq!(with_key(&produced.annotations, "samp_rate").len(), 1);
        assert!(source.produce().unwrap().is_none());
    }

    #[test]
    fn zero_byte_file_is_an_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing.dat");
        fs::File::create(&path).unwrap();

        let mut source = MetaFileSource::open(&path).unwrap();
        assert!(source.segments().is_empty());
        assert!(source.produce().unwrap().is_none());
    }

    /// Writes 15 float items with a 10 item cadence: two segments, the
    /// second header at a known offset.
    fn two_segment_file(path: &PathBuf) -> u64 {
        let opts = SinkOptions::new(4, 200_000.0, DataType::Float, false)
            .extras(test_extras())
            .max_segment_items(10);
        let wave: Vec<f32> = (0..15).map(|i| i as f32).collect();
        let mut sink = MetaFileSink::create(path, opts).unwrap();
        sink.write_samples(&wave).unwrap();
        sink.close().unwrap();

        let extras_len = encode_extras(&test_extras()).len() as u64;
        HEADER_LENGTH as u64 + extras_len + 40
    }

    #[test]
    fn truncation_short_of_a_header_slot_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.dat");
        let second_hdr_pos = two_segment_file(&path);

        // Leave only part of the second header slot behind
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(second_hdr_pos + 50).unwrap();
        drop(file);

        let mut source = MetaFileSource::open(&path).unwrap();
        assert_eq!(source.segments().len(), 1);
        let produced = source.produce().unwrap().unwrap();
        assert_eq!(produced.data.len(), 40);
    }

    #[test]
    fn corruption_inside_a_full_header_slot_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.dat");
        let second_hdr_pos = two_segment_file(&path);

        let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(second_hdr_pos)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);

        let err = MetaFileSource::open(&path).unwrap_err();
        assert!(matches!(err, SourceError::MalformedHeader(pos, _) if pos == second_hdr_pos));
    }

    #[test]
    fn truncated_extras_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short-extras.dat");
        let mut sink = MetaFileSink::create(&path, complex_options()).unwrap();
        sink.close().unwrap();

        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(HEADER_LENGTH as u64 + 10).unwrap();
        drop(file);

        let err = MetaFileSource::open(&path).unwrap_err();
        assert!(matches!(err, SourceError::TruncatedExtras(_, _, 10)));
    }

    #[test]
    fn unfinalized_tail_segment_extends_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashed.dat");
        let wave: Vec<f32> = (0..100).map(|i| i as f32).collect();

        let opts = SinkOptions::new(4, 200_000.0, DataType::Float, false).extras(test_extras());
        let mut sink = MetaFileSink::create(&path, opts).unwrap();
        sink.set_unbuffered(true);
        sink.write_samples(&wave).unwrap();
        // Simulate a crash: the final header never gets its byte count
        std::mem::forget(sink);

        let mut source = MetaFileSource::open(&path).unwrap();
        assert_eq!(source.segments().len(), 1);
        assert_eq!(source.segments()[0].header.bytes, 0);
        assert_eq!(source.segments()[0].data_len, 400);
        let produced = source.produce().unwrap().unwrap();
        assert_eq!(produced.samples::<f32>().unwrap(), wave);
    }

    #[test]
    fn detached_container_is_readable_while_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.dat");
        let wave: Vec<f32> = (0..50).map(|i| i as f32).collect();

        let opts = SinkOptions::new(4, 200_000.0, DataType::Float, false)
            .extras(test_extras())
            .detached(true);
        let mut sink = MetaFileSink::create(&path, opts).unwrap();
        sink.set_unbuffered(true);
        sink.write_samples(&wave).unwrap();

        // Reader opens the companion stream before the writer closes
        let mut source = MetaFileSource::open_detached(&path, None).unwrap();
        assert_eq!(source.segments().len(), 1);
        let produced = source.produce().unwrap().unwrap();
        assert_eq!(produced.samples::<f32>().unwrap(), wave);

        sink.close().unwrap();
    }

    #[test]
    fn explicit_header_path_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let custom = dir.path().join("headers.meta");
        let samples = complex_wave(10);

        let mut sink = MetaFileSink::create(&path, complex_options().detached(true)).unwrap();
        sink.write_samples(&samples).unwrap();
        sink.close().unwrap();
        fs::rename(detached_header_path(&path), &custom).unwrap();

        let mut source = MetaFileSource::open_detached(&path, Some(custom.as_path())).unwrap();
        let produced = source.produce().unwrap().unwrap();
        assert_eq!(produced.samples::<Complex<f32>>().unwrap(), samples);
    }

    #[test]
    fn mistyped_sample_reads_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typed.dat");
        let mut sink = MetaFileSink::create(&path, complex_options()).unwrap();
        sink.write_samples(&complex_wave(4)).unwrap();
        sink.close().unwrap();

        let mut source = MetaFileSource::open(&path).unwrap();
        let produced = source.produce().unwrap().unwrap();
        assert!(matches!(
            produced.samples::<f64>(),
            Err(SourceError::WrongSampleType)
        ));
        assert!(produced.samples::<Complex<f32>>().is_ok());
    }
}
