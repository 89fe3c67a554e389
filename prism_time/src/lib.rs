//! Abstraction over the system clock so that ingestion-time stamping,
//! flush scheduling and deadline arithmetic can be driven deterministically
//! in tests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// A wall-clock instant with millisecond precision.
///
/// All user time and ingestion time in prism is expressed as epoch
/// milliseconds; `Time` is the typed carrier for those values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Construct from epoch milliseconds.
    pub fn from_timestamp_millis(ms: i64) -> Self {
        Self(Utc.timestamp_millis_opt(ms).unwrap())
    }

    /// Epoch milliseconds.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Time advanced by `duration`.
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0 + chrono::Duration::from_std(duration).expect("duration in range"))
    }

    /// Elapsed wall-clock time since `earlier`, or `None` if `earlier` is
    /// in the future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Provides the current time to the rest of the system.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] backed by the real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that returns a programmable instant.
#[derive(Debug, Clone)]
pub struct MockProvider {
    now: Arc<RwLock<Time>>,
}

impl MockProvider {
    /// Create a provider frozen at `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Replace the current instant.
    pub fn set(&self, now: Time) {
        *self.now.write() = now;
    }

    /// Advance the current instant by `duration`.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = now.add(duration);
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip() {
        let t = Time::from_timestamp_millis(1_650_000_000_123);
        assert_eq!(t.timestamp_millis(), 1_650_000_000_123);
    }

    #[test]
    fn test_mock_provider() {
        let provider = MockProvider::new(Time::from_timestamp_millis(1_000));
        assert_eq!(provider.now().timestamp_millis(), 1_000);

        provider.inc(Duration::from_millis(250));
        assert_eq!(provider.now().timestamp_millis(), 1_250);

        provider.set(Time::from_timestamp_millis(10));
        assert_eq!(provider.now().timestamp_millis(), 10);
    }

    #[test]
    fn test_duration_since() {
        let t0 = Time::from_timestamp_millis(5_000);
        let t1 = t0.add(Duration::from_secs(2));
        assert_eq!(
            t1.checked_duration_since(t0),
            Some(Duration::from_secs(2))
        );
        assert_eq!(t0.checked_duration_since(t1), None);
    }
}
