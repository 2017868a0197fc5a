//! The temporal model: microsecond timestamps, closed-open validity
//! intervals and the temporal query modes applied to index scans.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time: microseconds since the Unix epoch, UTC.
pub type Timestamp = i64;

/// "Valid until further notice".
pub const TIMESTAMP_MAX: Timestamp = i64::MAX;

/// The current instant as a [`Timestamp`].
pub fn now() -> Timestamp {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => Timestamp::try_from(d.as_micros()).unwrap_or(TIMESTAMP_MAX),
        Err(e) => -Timestamp::try_from(e.duration().as_micros()).unwrap_or(TIMESTAMP_MAX),
    }
}

/// A closed-open validity interval `[start, end)`.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub struct Interval {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Interval {
    /// The interval starting at `start` and open towards the future.
    #[inline]
    pub fn since(start: Timestamp) -> Self {
        Self {
            start,
            end: TIMESTAMP_MAX,
        }
    }

    /// Whether the interval is still open towards the future.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.end == TIMESTAMP_MAX
    }

    #[inline]
    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t < self.end
    }

    /// Half-open interval overlap.
    #[inline]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && self.end > other.start
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_current() {
            write!(f, "[{}, +inf)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

/// The temporal mode of a query, before the evaluation instant is pinned.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Default)]
pub enum TemporalMode {
    /// Versions valid now.
    #[default]
    Current,
    /// Versions valid at the given instant.
    AsOf(Timestamp),
    /// Versions whose validity overlaps `[start, end)`.
    During(Timestamp, Timestamp),
    /// Every version, including closed ones.
    AllVersions,
}

impl TemporalMode {
    /// Pins `Current` to the given evaluation instant so that a whole query
    /// execution observes one consistent "now".
    #[inline]
    pub fn resolve(self, at: Timestamp) -> TemporalFilter {
        match self {
            Self::Current => TemporalFilter::AsOf(at),
            Self::AsOf(t) => TemporalFilter::AsOf(t),
            Self::During(a, b) => TemporalFilter::During(a, b),
            Self::AllVersions => TemporalFilter::All,
        }
    }
}

/// The validity filter an index scan applies to its payload.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum TemporalFilter {
    AsOf(Timestamp),
    During(Timestamp, Timestamp),
    All,
}

impl TemporalFilter {
    #[inline]
    pub fn matches(&self, validity: &Interval) -> bool {
        match self {
            Self::AsOf(t) => validity.contains(*t),
            Self::During(a, b) => validity.overlaps(&Interval { start: *a, end: *b }),
            Self::All => true,
        }
    }
}

/// Parses an `xsd:dateTime` or `xsd:date` lexical form into a [`Timestamp`].
///
/// Accepted shapes: `YYYY-MM-DD`, `YYYY-MM-DDThh:mm:ss`, with an optional
/// fractional second part and an optional `Z` or `±hh:mm` offset. Returns
/// `None` on anything else; the caller decides whether that is a plan-time
/// rejection or an expression error.
pub fn parse_timestamp(lexical: &str) -> Option<Timestamp> {
    let bytes = lexical.as_bytes();
    let (date, rest) = lexical.split_at(bytes.iter().position(|b| *b == b'T').unwrap_or(bytes.len()));
    let mut parts = date.splitn(3, '-');
    let year: i64 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let mut micros = days_from_civil(year, month, day).checked_mul(86_400_000_000)?;
    if !rest.is_empty() {
        let time = &rest[1..];
        let (time, offset_micros) = split_offset(time)?;
        let mut parts = time.splitn(3, ':');
        let hours: i64 = parts.next()?.parse().ok()?;
        let minutes: i64 = parts.next()?.parse().ok()?;
        let seconds = parts.next()?;
        let (whole, frac) = match seconds.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (seconds, ""),
        };
        let seconds: i64 = whole.parse().ok()?;
        if hours > 23 || minutes > 59 || seconds > 60 {
            return None;
        }
        let mut frac_micros = 0_i64;
        for i in 0..6 {
            frac_micros *= 10;
            if let Some(digit) = frac.as_bytes().get(i) {
                if !digit.is_ascii_digit() {
                    return None;
                }
                frac_micros += i64::from(digit - b'0');
            }
        }
        micros = micros.checked_add(
            ((hours * 60 + minutes) * 60 + seconds) * 1_000_000 + frac_micros,
        )?;
        micros = micros.checked_sub(offset_micros)?;
    }
    Some(micros)
}

/// Splits a trailing timezone designator, returning its offset in µs.
fn split_offset(time: &str) -> Option<(&str, i64)> {
    if let Some(time) = time.strip_suffix('Z') {
        return Some((time, 0));
    }
    // An offset sign can only appear after the hh:mm:ss part.
    if time.len() > 6 {
        let (head, tail) = time.split_at(time.len() - 6);
        let sign = match tail.as_bytes()[0] {
            b'+' => 1,
            b'-' => -1,
            _ => return Some((time, 0)),
        };
        let hours: i64 = tail[1..3].parse().ok()?;
        let minutes: i64 = tail.get(4..6)?.parse().ok()?;
        if tail.as_bytes()[3] != b':' || hours > 14 || minutes > 59 {
            return None;
        }
        return Some((head, sign * (hours * 60 + minutes) * 60 * 1_000_000));
    }
    Some((time, 0))
}

/// Days since 1970-01-01 of a proleptic Gregorian date (Howard Hinnant's
/// `days_from_civil`).
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = i64::from((month + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_contains_is_closed_open() {
        let i = Interval { start: 10, end: 20 };
        assert!(i.contains(10));
        assert!(i.contains(19));
        assert!(!i.contains(20));
        assert!(!i.contains(9));
    }

    #[test]
    fn overlap_is_half_open() {
        let a = Interval { start: 10, end: 20 };
        assert!(a.overlaps(&Interval { start: 19, end: 25 }));
        assert!(!a.overlaps(&Interval { start: 20, end: 25 }));
        assert!(!a.overlaps(&Interval { start: 0, end: 10 }));
        assert!(a.overlaps(&Interval { start: 0, end: 11 }));
    }

    #[test]
    fn current_resolves_to_as_of() {
        assert_eq!(
            TemporalMode::Current.resolve(42),
            TemporalFilter::AsOf(42)
        );
        assert_eq!(
            TemporalMode::AsOf(7).resolve(42),
            TemporalFilter::AsOf(7)
        );
    }

    #[test]
    fn all_versions_matches_everything() {
        let closed = Interval { start: 1, end: 2 };
        assert!(TemporalFilter::All.matches(&closed));
        assert!(!TemporalFilter::AsOf(5).matches(&closed));
    }

    #[test]
    fn parses_dates_and_date_times() {
        assert_eq!(parse_timestamp("1970-01-01"), Some(0));
        assert_eq!(parse_timestamp("1970-01-02"), Some(86_400_000_000));
        assert_eq!(parse_timestamp("1969-12-31"), Some(-86_400_000_000));
        assert_eq!(
            parse_timestamp("1970-01-01T00:00:01"),
            Some(1_000_000)
        );
        assert_eq!(
            parse_timestamp("1970-01-01T00:00:00.5"),
            Some(500_000)
        );
        assert_eq!(
            parse_timestamp("2020-01-01T00:00:00Z"),
            Some(1_577_836_800_000_000)
        );
        // +01:00 is one hour before the same wall-clock UTC instant.
        assert_eq!(
            parse_timestamp("2020-01-01T01:00:00+01:00"),
            parse_timestamp("2020-01-01T00:00:00Z")
        );
    }

    #[test]
    fn rejects_malformed_timestamps() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp("2020-13-01"), None);
        assert_eq!(parse_timestamp("2020-01-01T25:00:00"), None);
        assert_eq!(parse_timestamp("2020-01-01T00:00"), None);
    }
}
