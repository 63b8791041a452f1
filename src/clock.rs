use std::time::Instant;

/// Milliseconds since the process started, the "millis()" of this device.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking fixed-interval check against a millisecond clock.
///
/// Elapsed time is computed with wrapping subtraction so a counter rollover
/// never stalls the cadence.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    interval_ms: u64,
    last_ms: u64,
}

impl Cadence {
    pub fn new(interval_ms: u64) -> Cadence {
        Cadence {
            interval_ms,
            last_ms: 0,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Returns true (and restarts the interval) once `interval_ms` has passed.
    pub fn due(&mut self, now_ms: u64) -> bool {
        if now_ms.wrapping_sub(self.last_ms) >= self.interval_ms {
            self.last_ms = now_ms;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_fires_once_per_interval() {
        let mut cadence = Cadence::new(1000);
        assert!(!cadence.due(999));
        assert!(cadence.due(1000));
        assert!(!cadence.due(1500));
        assert!(cadence.due(2000));
    }

    #[test]
    fn test_cadence_survives_wraparound() {
        let mut cadence = Cadence::new(1000);
        cadence.last_ms = u64::MAX - 100;
        assert!(!cadence.due(800));
        assert!(cadence.due(899));
    }
}
