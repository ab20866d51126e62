//! Loss-velocity circuit breaker

use std::collections::VecDeque;

/// Trailing window of loss timestamps (milliseconds)
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    losses: VecDeque<i64>,
    window_ms: i64,
    threshold: usize,
    pause_ms: i64,
}

impl Default for CircuitBreaker {
    /// Three losses inside an hour pause entries for two hours
    fn default() -> Self {
        Self::new(3_600_000, 3, 7_200_000)
    }
}

impl CircuitBreaker {
    pub fn new(window_ms: i64, threshold: usize, pause_ms: i64) -> Self {
        Self {
            losses: VecDeque::new(),
            window_ms,
            threshold,
            pause_ms,
        }
    }

    pub fn record_loss(&mut self, ts: i64) {
        self.losses.push_back(ts);
    }

    /// Losses currently inside the window as of `now`
    #[cfg(test)]
    fn in_window(&self, now: i64) -> usize {
        self.losses.iter().filter(|&&t| now - t < self.window_ms).count()
    }

    /// Prune to the trailing window; on trip returns the resume time
    ///
    /// A trip consumes the window so the losses that caused it cannot trip
    /// the breaker a second time.
    pub fn evaluate(&mut self, now: i64) -> Option<i64> {
        let window_ms = self.window_ms;
        self.losses.retain(|&t| now - t < window_ms);
        if self.losses.len() >= self.threshold {
            self.losses.clear();
            Some(now + self.pause_ms)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: i64 = 1_000;

    #[test]
    fn three_losses_in_window_trip() {
        let mut cb = CircuitBreaker::default();
        cb.record_loss(0);
        assert_eq!(cb.evaluate(0), None);
        cb.record_loss(600 * S);
        assert_eq!(cb.evaluate(600 * S), None);
        cb.record_loss(1_800 * S);
        assert_eq!(cb.evaluate(1_800 * S), Some(1_800 * S + 7_200 * S));
    }

    #[test]
    fn tripped_window_does_not_retrip_on_next_loss() {
        let mut cb = CircuitBreaker::default();
        for t in [0, 600, 1_800] {
            cb.record_loss(t * S);
        }
        assert!(cb.evaluate(1_800 * S).is_some());
        cb.record_loss(4_000 * S);
        assert_eq!(cb.evaluate(4_000 * S), None);
        assert_eq!(cb.in_window(4_000 * S), 1);
    }

    #[test]
    fn spread_losses_never_trip() {
        let mut cb = CircuitBreaker::default();
        for t in [0, 3_700, 7_400, 11_100] {
            cb.record_loss(t * S);
            assert_eq!(cb.evaluate(t * S), None);
        }
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let mut cb = CircuitBreaker::default();
        cb.record_loss(0);
        cb.record_loss(1_000 * S);
        cb.record_loss(3_600 * S);
        // The t=0 loss is exactly one window old and no longer counts
        assert_eq!(cb.evaluate(3_600 * S), None);
        assert_eq!(cb.in_window(3_600 * S), 2);
    }
}
