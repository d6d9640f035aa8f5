use std::sync::atomic::{AtomicU32, Ordering};


/// Counts transfer failures on a link since the last successful transfer. Both directions
///  share one counter: a successful send resets it just like a successful receive does.
#[derive(Debug, Default)]
pub struct ErrorCounter {
    count: AtomicU32,
}
impl ErrorCounter {
    pub fn new() -> ErrorCounter {
        ErrorCounter::default()
    }

    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// returns the new count
    pub fn record_failure(&self) -> u32 {
        self.count.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub fn record_success(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn exceeds(&self, threshold: u32) -> bool {
        self.get() > threshold
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_increment_and_success_resets() {
        let counter = ErrorCounter::new();
        assert_eq!(counter.record_failure(), 1);
        assert_eq!(counter.record_failure(), 2);
        assert_eq!(counter.get(), 2);

        counter.record_success();
        assert_eq!(counter.get(), 0);
        assert_eq!(counter.record_failure(), 1);
    }

    #[test]
    fn test_exceeds_is_strict() {
        let counter = ErrorCounter::new();
        for _ in 0..3 {
            counter.record_failure();
        }
        assert!(!counter.exceeds(3));
        counter.record_failure();
        assert!(counter.exceeds(3));
    }
}
