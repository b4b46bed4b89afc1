//! # sigmeta
//! This library writes and reads self-describing sample stream containers: raw
//! signal samples (say, complex floating-point IQ data) stored alongside the
//! metadata needed to reconstruct the stream later without any external
//! configuration.
//!
//! A container is a sequence of segments. Each segment starts with a
//! fixed-size header (sample rate, capture time, item size, format tag,
//! offsets) followed by a variable-length user dictionary of "extras", then
//! the segment's sample bytes. Headers may be interleaved with the data in a
//! single file (attached) or kept in a companion `.hdr` file while the data
//! file stays pure sample bytes (detached).
//!
//! On read, each segment's metadata is replayed as [`source::Annotation`]s
//! anchored at the segment's first sample: a synthesized `rx_rate` and
//! `rx_time`, plus one annotation per extras entry.
//!
//! ## File layout
//!
//! Attached, single file:
//!
//! ```text
//! [header #0][extras #0][data ...][header #1][extras #1][data ...]
//! ```
//!
//! Detached, two files:
//!
//! ```text
//! capture.dat      [data ..............................]
//! capture.dat.hdr  [header #0][extras #0][header #1][extras #1]
//! ```
//!
//! Every header is exactly [`header::HEADER_LENGTH`] bytes, so readers frame
//! headers without inspecting their content.
//!
//! ## Streaming
//!
//! The writer and reader are plain synchronous stages meant to be driven by
//! an external loop. A reader may scan a detached container while it is
//! still being written if the writer runs with
//! [`sink::MetaFileSink::set_unbuffered`] enabled.
//!
//! ## Example
//!
//! ```no_run
//! use num_complex::Complex;
//! use sigmeta::{DataType, Dict, MetaFileSink, MetaFileSource, SinkOptions, Tag};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut extras = Dict::new();
//!     extras.insert("samp_rate", Tag::Double(200_000.0));
//!
//!     let opts = SinkOptions::new(8, 200_000.0, DataType::Float, true).extras(extras);
//!     let mut sink = MetaFileSink::create("capture.dat", opts)?;
//!     sink.write_samples(&[Complex::new(1.0f32, 0.0); 1024])?;
//!     sink.close()?;
//!
//!     let mut source = MetaFileSource::open("capture.dat")?;
//!     while let Some(chunk) = source.produce()? {
//!         for ann in &chunk.annotations {
//!             println!("{} @ sample {}: {:?}", ann.key, ann.offset, ann.value);
//!         }
//!         let samples: Vec<Complex<f32>> = chunk.samples()?;
//!         println!("{} samples", samples.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod header;
pub mod pmt;
pub mod rxtime;
pub mod sink;
pub mod source;

pub use header::{DataType, HEADER_LENGTH, Header, METADATA_VERSION, Sample};
pub use pmt::{Dict, Tag};
pub use rxtime::RxTime;
pub use sink::{MetaFileSink, SinkError, SinkOptions};
pub use source::{Annotation, MetaFileSource, Produced, Segment, SourceError};
