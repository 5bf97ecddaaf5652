use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 2024-01-01T00:00:00Z. A device clock reading earlier than this has not been set by NTP.
pub const DEFAULT_MIN_VALID_EPOCH_SECS: u64 = 1_704_067_200;

/// Wall-clock source shared by transport, failover and alerting.
///
/// Times are unix milliseconds so they can be persisted and compared across reboots.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;

    /// Whether the clock has been synchronised well enough for certificate validity checks.
    fn is_synchronized(&self) -> bool;
}

/// System clock that considers itself synchronised once it reads past a floor epoch
#[derive(Debug, Clone)]
pub struct SystemClock {
    min_valid_epoch_secs: u64,
}

impl SystemClock {
    pub fn new(min_valid_epoch_secs: u64) -> Self {
        Self { min_valid_epoch_secs }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_VALID_EPOCH_SECS)
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn is_synchronized(&self) -> bool {
        self.now_millis() / 1000 >= self.min_valid_epoch_secs
    }
}

/// Hand-driven clock for deterministic tests
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
    synchronized: AtomicBool,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
            synchronized: AtomicBool::new(true),
        }
    }

    pub fn advance_millis(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_millis(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }

    pub fn set_synchronized(&self, synchronized: bool) {
        self.synchronized.store(synchronized, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_synchronized_on_a_real_host() {
        let clock = SystemClock::default();
        assert!(clock.is_synchronized());
        assert!(clock.now_millis() > DEFAULT_MIN_VALID_EPOCH_SECS * 1000);
    }

    #[test]
    fn test_system_clock_floor_in_the_future_is_unsynchronized() {
        let clock = SystemClock::new(u64::MAX / 1000);
        assert!(!clock.is_synchronized());
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance_millis(250);
        assert_eq!(clock.now_millis(), 1_250);
        clock.set_synchronized(false);
        assert!(!clock.is_synchronized());
    }
}
