use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::Duration;

/// Exact rational media timestamp.
///
/// A `MediaTime` is either a finite fraction `num / den` seconds, one of the
/// two infinities, or invalid. DASH timelines mix many timescales (MPD
/// attributes, sidx boxes, Matroska clusters), so values keep their native
/// numerator/timescale pair and are only rescaled on demand via
/// [`MediaTime::as_timebase`], which floors like the reference player does.
///
/// Invalid values compare unequal to everything, including themselves;
/// callers are expected to check [`MediaTime::is_valid`] before ordering.
#[derive(Clone, Copy, Debug)]
pub struct MediaTime {
    num: i64,
    den: u32,
    kind: Kind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Finite,
    Invalid,
    PosInfinity,
    NegInfinity,
}

/// Timescale used when two finite values with different denominators must be
/// merged. 100ns ticks, fine enough for every real-world media timescale.
const HNS: u32 = 10_000_000;

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1)
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime {
        num: 0,
        den: 1,
        kind: Kind::Finite,
    };

    pub fn invalid() -> Self {
        Self {
            num: 0,
            den: 1,
            kind: Kind::Invalid,
        }
    }

    pub fn pos_infinity() -> Self {
        Self {
            num: 0,
            den: 1,
            kind: Kind::PosInfinity,
        }
    }

    pub fn neg_infinity() -> Self {
        Self {
            num: 0,
            den: 1,
            kind: Kind::NegInfinity,
        }
    }

    /// Finite value `num / timescale` seconds. A zero timescale yields an
    /// invalid value rather than panicking.
    pub fn from_nd(num: i64, timescale: u32) -> Self {
        if timescale == 0 {
            return Self::invalid();
        }
        Self {
            num,
            den: timescale,
            kind: Kind::Finite,
        }
    }

    pub fn from_seconds(seconds: i64) -> Self {
        Self::from_nd(seconds, 1)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_nd(millis, 1_000)
    }

    pub fn from_hns(hns: i64) -> Self {
        Self::from_nd(hns, HNS)
    }

    pub fn from_seconds_f64(seconds: f64) -> Self {
        if !seconds.is_finite() {
            return if seconds > 0.0 {
                Self::pos_infinity()
            } else {
                Self::neg_infinity()
            };
        }
        Self::from_nd((seconds * HNS as f64).round() as i64, HNS)
    }

    pub fn from_duration(d: Duration) -> Self {
        Self::from_nd((d.as_nanos() / 100) as i64, HNS)
    }

    pub fn is_valid(&self) -> bool {
        self.kind != Kind::Invalid
    }

    pub fn is_finite(&self) -> bool {
        self.kind == Kind::Finite
    }

    pub fn is_infinity(&self) -> bool {
        matches!(self.kind, Kind::PosInfinity | Kind::NegInfinity)
    }

    pub fn is_pos_infinity(&self) -> bool {
        self.kind == Kind::PosInfinity
    }

    pub fn is_zero(&self) -> bool {
        self.kind == Kind::Finite && self.num == 0
    }

    /// Numerator in the value's own timescale.
    pub fn numerator(&self) -> i64 {
        self.num
    }

    /// The value's own timescale.
    pub fn timescale(&self) -> u32 {
        self.den
    }

    /// Rescale to `timescale` ticks, flooring. Infinities saturate, invalid
    /// maps to 0 (callers check validity first).
    pub fn as_timebase(&self, timescale: u32) -> i64 {
        match self.kind {
            Kind::Invalid => 0,
            Kind::PosInfinity => i64::MAX,
            Kind::NegInfinity => i64::MIN,
            Kind::Finite => {
                if timescale == 0 {
                    return 0;
                }
                if self.den == timescale {
                    return self.num;
                }
                let scaled = self.num as i128 * timescale as i128;
                scaled.div_euclid(self.den as i128) as i64
            }
        }
    }

    pub fn as_hns(&self) -> i64 {
        self.as_timebase(HNS)
    }

    pub fn as_millis(&self) -> i64 {
        self.as_timebase(1_000)
    }

    pub fn as_seconds_f64(&self) -> f64 {
        match self.kind {
            Kind::Invalid => f64::NAN,
            Kind::PosInfinity => f64::INFINITY,
            Kind::NegInfinity => f64::NEG_INFINITY,
            Kind::Finite => self.num as f64 / self.den as f64,
        }
    }

    /// Reduce to the smallest equivalent fraction.
    fn reduced(num: i128, den: u64) -> Self {
        let g = gcd(num.unsigned_abs() as u64, den);
        let num = num / g as i128;
        let den = den / g;
        if den <= u32::MAX as u64 && num >= i64::MIN as i128 && num <= i64::MAX as i128 {
            Self::from_nd(num as i64, den as u32)
        } else {
            // Out-of-range after reduction: fall back to HNS precision.
            let hns = (num * HNS as i128).div_euclid(den as i128);
            Self::from_nd(hns.clamp(i64::MIN as i128, i64::MAX as i128) as i64, HNS)
        }
    }

    fn checked_combine(self, rhs: Self, negate_rhs: bool) -> Self {
        let rhs_kind = if negate_rhs {
            match rhs.kind {
                Kind::PosInfinity => Kind::NegInfinity,
                Kind::NegInfinity => Kind::PosInfinity,
                k => k,
            }
        } else {
            rhs.kind
        };
        match (self.kind, rhs_kind) {
            (Kind::Invalid, _) | (_, Kind::Invalid) => Self::invalid(),
            (Kind::PosInfinity, Kind::NegInfinity) | (Kind::NegInfinity, Kind::PosInfinity) => {
                Self::invalid()
            }
            (Kind::PosInfinity, _) | (_, Kind::PosInfinity) => Self::pos_infinity(),
            (Kind::NegInfinity, _) | (_, Kind::NegInfinity) => Self::neg_infinity(),
            (Kind::Finite, Kind::Finite) => {
                let rn = if negate_rhs { -(rhs.num as i128) } else { rhs.num as i128 };
                if self.den == rhs.den {
                    let sum = self.num as i128 + rn;
                    Self::reduced(sum, self.den as u64)
                } else {
                    let den = self.den as u64 * rhs.den as u64;
                    let sum = self.num as i128 * rhs.den as i128 + rn * self.den as i128;
                    Self::reduced(sum, den)
                }
            }
        }
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Add for MediaTime {
    type Output = MediaTime;
    fn add(self, rhs: MediaTime) -> MediaTime {
        self.checked_combine(rhs, false)
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;
    fn sub(self, rhs: MediaTime) -> MediaTime {
        self.checked_combine(rhs, true)
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: MediaTime) {
        *self = *self + rhs;
    }
}

impl SubAssign for MediaTime {
    fn sub_assign(&mut self, rhs: MediaTime) {
        *self = *self - rhs;
    }
}

impl Neg for MediaTime {
    type Output = MediaTime;
    fn neg(self) -> MediaTime {
        match self.kind {
            Kind::Invalid => self,
            Kind::PosInfinity => Self::neg_infinity(),
            Kind::NegInfinity => Self::pos_infinity(),
            Kind::Finite => Self::from_nd(-self.num, self.den),
        }
    }
}

impl PartialEq for MediaTime {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Equal))
    }
}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.kind, other.kind) {
            (Kind::Invalid, _) | (_, Kind::Invalid) => None,
            (Kind::PosInfinity, Kind::PosInfinity) => Some(Ordering::Equal),
            (Kind::NegInfinity, Kind::NegInfinity) => Some(Ordering::Equal),
            (Kind::PosInfinity, _) => Some(Ordering::Greater),
            (_, Kind::PosInfinity) => Some(Ordering::Less),
            (Kind::NegInfinity, _) => Some(Ordering::Less),
            (_, Kind::NegInfinity) => Some(Ordering::Greater),
            (Kind::Finite, Kind::Finite) => {
                let lhs = self.num as i128 * other.den as i128;
                let rhs = other.num as i128 * self.den as i128;
                lhs.partial_cmp(&rhs)
            }
        }
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Invalid => write!(f, "invalid"),
            Kind::PosInfinity => write!(f, "+inf"),
            Kind::NegInfinity => write!(f, "-inf"),
            Kind::Finite => write!(f, "{:.3}s", self.as_seconds_f64()),
        }
    }
}

/// Half-open time range `[start, end)`. Either bound may be invalid or
/// infinite, mirroring manifest semantics (a live period has no end).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeRange {
    pub start: MediaTime,
    pub end: MediaTime,
}

impl TimeRange {
    pub fn new(start: MediaTime, end: MediaTime) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start.is_valid() && self.end.is_valid()
    }

    pub fn contains(&self, t: MediaTime) -> bool {
        self.is_valid() && t.is_valid() && t >= self.start && t < self.end
    }

    pub fn duration(&self) -> MediaTime {
        if self.is_valid() {
            self.end - self.start
        } else {
            MediaTime::invalid()
        }
    }
}
