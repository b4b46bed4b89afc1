//! Capture timestamps as they appear in segment headers: whole seconds plus a
//! fractional part. Backed by a 64.64 fixed-point number so that adding many
//! small per-segment increments does not accumulate the error a plain f64
//! would.

use fixed::types::I64F64;
use std::ops::{Add, Sub};

/// Reception time of a sample, in seconds. Usually relative to the first
/// sample of the stream, but nothing stops a writer from using an absolute
/// epoch (say, a UNIX timestamp).
#[derive(PartialEq, PartialOrd, Copy, Clone, Debug)]
pub struct RxTime(I64F64);

impl RxTime {
    /// Builds a timestamp from the wire representation: whole seconds and a
    /// fractional part in `[0, 1)`.
    pub fn new(sec: u64, frac: f64) -> RxTime {
        debug_assert!((0.0..1.0).contains(&frac));
        RxTime(I64F64::from_num(sec) + I64F64::from_num(frac))
    }

    pub fn from_secs(sec: f64) -> RxTime {
        RxTime(I64F64::from_num(sec))
    }

    /// Whole-seconds part, as stored on the wire.
    pub fn secs(&self) -> u64 {
        self.0.int().to_num::<u64>()
    }

    /// Fractional part in `[0, 1)`, as stored on the wire.
    pub fn frac(&self) -> f64 {
        self.0.frac().to_num::<f64>()
    }

    /// Could have some rounding error if the number of seconds is large,
    /// or if the time is not relative to 0, but to a given epoch.
    pub fn total_secs(&self) -> f64 {
        self.0.to_num::<f64>()
    }

    /// The timestamp `items` samples later at the given sample rate.
    pub fn advance(&self, items: u64, samp_rate: f64) -> RxTime {
        RxTime(self.0 + I64F64::from_num(items) / I64F64::from_num(samp_rate))
    }

    /// Returns true if self and b represent the same timestamp, up to
    /// the precision (in seconds) stated in the argument
    pub fn is_same_as(&self, b: RxTime, tol: f64) -> bool {
        (self.0 - b.0).abs() <= I64F64::from_num(tol)
    }
}

impl Add for RxTime {
    type Output = RxTime;

    fn add(self, other: RxTime) -> RxTime {
        RxTime(self.0 + other.0)
    }
}

impl Sub for RxTime {
    type Output = RxTime;

    fn sub(self, other: RxTime) -> RxTime {
        RxTime(self.0 - other.0)
    }
}
