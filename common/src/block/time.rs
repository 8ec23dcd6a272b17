//! Monotonic time used for protocol deadlines.
//!
//! Deadlines and intervals in the peer logic are measured in microseconds
//! on a monotonic clock; wall-clock seconds appear only in protocol
//! timestamps (block headers, `addr` entries, `version` messages).
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

use super::BlockTime;

/// Maximum adjustment between network and local time (70 minutes).
pub const MAX_TIME_ADJUSTMENT: TimeOffset = 70 * 60;

/// Minimum number of samples before the network-adjusted offset moves.
pub const MIN_TIME_SAMPLES: usize = 5;

/// Maximum number of time samples stored.
pub const MAX_TIME_SAMPLES: usize = 200;

/// A time offset, in seconds.
pub type TimeOffset = i64;

/// Local time, in microseconds since epoch.
///
/// This clock is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default, Hash)]
pub struct LocalTime {
    micros: u64,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl LocalTime {
    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).micros;
        let last = LAST.fetch_max(now, atomic::Ordering::SeqCst);

        // Never step backwards, even if the system clock does.
        Self {
            micros: now.max(last),
        }
    }

    /// Construct a local time from whole seconds since epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    /// Construct a local time from microseconds since epoch.
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Construct a local time from a block timestamp.
    pub const fn from_block_time(t: BlockTime) -> Self {
        Self::from_secs(t as u64)
    }

    /// This time in whole seconds since epoch.
    pub const fn as_secs(&self) -> u64 {
        self.micros / 1_000_000
    }

    /// This time in microseconds since epoch.
    pub const fn as_micros(&self) -> u64 {
        self.micros
    }

    /// This time as a block timestamp.
    pub const fn block_time(&self) -> BlockTime {
        (self.micros / 1_000_000) as BlockTime
    }

    /// Elapse time, adding the given duration.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.micros += duration.as_micros()
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let micros = system
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        Self { micros }
    }
}

/// Subtract two local times. Saturates at zero.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.micros.saturating_sub(other.micros))
    }
}

impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            micros: self.micros.saturating_sub(other.0),
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            micros: self.micros + other.0,
        }
    }
}

/// Time duration as measured locally, in microseconds.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// Create a new duration from microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Create a new duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1000)
    }

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Create a new duration from whole hours.
    pub const fn from_hours(hours: u64) -> Self {
        Self::from_mins(hours * 60)
    }

    /// The number of microseconds in this duration.
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// The number of whole seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// The number of whole minutes in this duration.
    pub const fn as_mins(&self) -> u64 {
        self.as_secs() / 60
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.as_secs() < 1 {
            write!(f, "{} microsecond(s)", self.as_micros())
        } else if self.as_secs() < 60 {
            write!(f, "{} second(s)", self.as_secs())
        } else if self.as_mins() < 60 {
            write!(f, "{} minute(s)", self.as_mins())
        } else {
            write!(f, "{} hour(s)", self.as_mins() / 60)
        }
    }
}

impl<'a> std::iter::Sum<&'a LocalDuration> for LocalDuration {
    fn sum<I: Iterator<Item = &'a LocalDuration>>(iter: I) -> LocalDuration {
        let mut total: u64 = 0;

        for entry in iter {
            total = total
                .checked_add(entry.0)
                .expect("iter::sum should not overflow");
        }
        Self(total)
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0 + other.0)
    }
}

impl std::ops::Div<u32> for LocalDuration {
    type Output = LocalDuration;

    fn div(self, other: u32) -> LocalDuration {
        LocalDuration(self.0 / other as u64)
    }
}

impl std::ops::Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> LocalDuration {
        LocalDuration(self.0 * other)
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_micros(other.0)
    }
}

/// Clock that tells the time.
pub trait Clock {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
    /// The local time as seconds since epoch, the representation used
    /// in protocol timestamps.
    fn block_time(&self) -> BlockTime;
}

impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }

    fn block_time(&self) -> BlockTime {
        LocalTime::block_time(self)
    }
}

/// Draw the next event time of a Poisson process with the given average
/// interval. Used to unpredictably space periodic broadcasts.
pub fn poisson_next_send(
    now: LocalTime,
    average_interval: LocalDuration,
    rng: &fastrand::Rng,
) -> LocalTime {
    let u = rng.f64().min(1.0 - f64::EPSILON);
    let micros = (average_interval.as_micros() as f64 * -(1.0 - u).ln()).round();

    now + LocalDuration::from_micros(micros as u64)
}

/// Network-adjusted time tracker.
///
/// The adjusted time is the local time shifted by the median time offset
/// of our peers, sampled from their `version` timestamps. The offset is
/// never adjusted by more than [`MAX_TIME_ADJUSTMENT`].
#[derive(Debug, Clone)]
pub struct AdjustedTime<K> {
    /// Sample sources, to prevent double-counting a peer.
    sources: HashSet<K>,
    /// Time offset samples.
    samples: Vec<TimeOffset>,
    /// Current offset, based on our samples.
    offset: TimeOffset,
    /// Last known local time.
    local_time: LocalTime,
}

impl<K: Hash + Eq> Default for AdjustedTime<K> {
    fn default() -> Self {
        Self::new(LocalTime::default())
    }
}

impl<K: Hash + Eq> AdjustedTime<K> {
    /// Create a new network-adjusted time tracker.
    /// Starts with a single sample of zero.
    pub fn new(local_time: LocalTime) -> Self {
        Self {
            sources: HashSet::with_capacity(MAX_TIME_SAMPLES),
            samples: vec![0],
            offset: 0,
            local_time,
        }
    }

    /// Add a time sample from the given source. Ignored once the sample
    /// limit is reached, or when the source was already counted.
    pub fn record_offset(&mut self, source: K, sample: TimeOffset) {
        if self.sources.len() == MAX_TIME_SAMPLES {
            return;
        }
        if !self.sources.insert(source) {
            return;
        }
        self.samples.push(sample);

        let mut offsets = self.samples.clone();
        let count = offsets.len();

        offsets.sort_unstable();

        if count < MIN_TIME_SAMPLES {
            return;
        }
        // Only adjust on a true median. With an even count the offset
        // stays put, which matches the reference behavior.
        if count % 2 == 1 {
            let median = offsets[count / 2];

            if median.abs() <= MAX_TIME_ADJUSTMENT {
                self.offset = median;
            } else {
                self.offset = 0;
            }
        }
    }

    /// The current median network time offset.
    pub fn offset(&self) -> TimeOffset {
        self.offset
    }

    /// Apply the offset to the given timestamp.
    pub fn adjust(&self, time: BlockTime) -> BlockTime {
        if self.offset >= 0 {
            time + self.offset as BlockTime
        } else {
            time.saturating_sub(self.offset.unsigned_abs() as BlockTime)
        }
    }

    /// Set the local time to the given value.
    pub fn set_local_time(&mut self, time: LocalTime) {
        self.local_time = time;
    }
}

impl<K: Hash + Eq> Clock for AdjustedTime<K> {
    fn local_time(&self) -> LocalTime {
        self.local_time
    }

    fn block_time(&self) -> BlockTime {
        self.adjust(self.local_time.block_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_subtraction() {
        let earlier = LocalTime::from_secs(100);
        let later = LocalTime::from_secs(103);

        assert_eq!(later - earlier, LocalDuration::from_secs(3));
        assert_eq!(earlier - later, LocalDuration::default());
    }

    #[test]
    fn test_adjusted_time_median() {
        let mut adjusted: AdjustedTime<u64> = AdjustedTime::default();
        assert_eq!(adjusted.offset(), 0);

        adjusted.record_offset(1, 42);
        adjusted.record_offset(2, 47);
        assert_eq!(adjusted.offset(), 0, "below the sample minimum");

        adjusted.record_offset(3, 51);
        adjusted.record_offset(4, 51);
        assert_eq!(adjusted.offset(), 47, "median of [0, 42, 47, 51, 51]");

        adjusted.record_offset(4, 60);
        assert_eq!(adjusted.offset(), 47, "sources are only counted once");
    }

    #[test]
    fn test_adjusted_time_limit() {
        let mut adjusted: AdjustedTime<u64> = AdjustedTime::default();

        for peer in 0..6 {
            adjusted.record_offset(peer, MAX_TIME_ADJUSTMENT + 1);
        }
        assert_eq!(
            adjusted.offset(),
            0,
            "a too-large median adjustment reverts to zero"
        );
    }

    #[test]
    fn test_poisson_next_send_is_in_the_future() {
        let rng = fastrand::Rng::with_seed(42);
        let now = LocalTime::from_secs(1_000_000);

        for _ in 0..100 {
            let next = poisson_next_send(now, LocalDuration::from_secs(30), &rng);
            assert!(next >= now);
        }
    }
}
