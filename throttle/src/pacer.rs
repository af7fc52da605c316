/// Inserts a short pause every time a fixed amount of data has passed through.
///
/// Used by chunked transfers so that a single large download does not saturate a slow link
/// and starve the keepalive traffic of the SSH session.
#[derive(Debug, Clone)]
pub struct Pacer {
    every: u64,
    delay: std::time::Duration,
    since_pause: u64,
    pauses: u64,
}

impl Pacer {
    #[must_use]
    pub fn new(every: u64, delay: std::time::Duration) -> Self {
        Self {
            every,
            delay,
            since_pause: 0,
            pauses: 0,
        }
    }

    /// Records `bytes` passing through and returns the pause owed, if a boundary was crossed.
    pub fn record(&mut self, bytes: u64) -> Option<std::time::Duration> {
        if self.every == 0 || self.delay.is_zero() {
            return None;
        }
        self.since_pause += bytes;
        if self.since_pause < self.every {
            return None;
        }
        // carry the overshoot so the cadence stays tied to the byte count
        self.since_pause %= self.every;
        self.pauses += 1;
        Some(self.delay)
    }

    #[must_use]
    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pauses_once_per_boundary() {
        let mut pacer = Pacer::new(1024 * 1024, std::time::Duration::from_millis(10));
        let mut owed = 0;
        // 45 MiB in 32 KiB chunks
        for _ in 0..1440 {
            if pacer.record(32 * 1024).is_some() {
                owed += 1;
            }
        }
        assert_eq!(owed, 45);
        assert_eq!(pacer.pauses(), 45);
    }

    #[test]
    fn disabled_pacer_never_pauses() {
        let mut pacer = Pacer::new(0, std::time::Duration::from_millis(10));
        assert!(pacer.record(u64::MAX / 2).is_none());
        let mut pacer = Pacer::new(1, std::time::Duration::ZERO);
        assert!(pacer.record(100).is_none());
        assert_eq!(pacer.pauses(), 0);
    }

    #[test]
    fn uneven_chunks_carry_over() {
        let mut pacer = Pacer::new(100, std::time::Duration::from_millis(1));
        assert!(pacer.record(60).is_none());
        assert!(pacer.record(60).is_some());
        // 20 bytes carried over
        assert!(pacer.record(79).is_none());
        assert!(pacer.record(1).is_some());
    }
}
