//! Generation metrics
//!
//! Per-turn counters for generated tokens and time spent producing them.

use std::time::Duration;

/// Tokens produced and decode time for the current turn.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationMetrics {
    tokens_generated: u64,
    decode_time: Duration,
}

impl GenerationMetrics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records one generated token and the time its step took.
    pub fn record_token(&mut self, elapsed: Duration) {
        self.tokens_generated += 1;
        self.decode_time += elapsed;
    }

    pub fn tokens_generated(&self) -> u64 {
        self.tokens_generated
    }

    pub fn decode_time(&self) -> Duration {
        self.decode_time
    }

    /// Generation speed, or 0.0 before any time has been recorded.
    pub fn tokens_per_second(&self) -> f32 {
        let micros = self.decode_time.as_micros();
        if micros == 0 {
            return 0.0;
        }
        (self.tokens_generated as f64 / (micros as f64 / 1e6)) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_per_second() {
        let mut metrics = GenerationMetrics::default();
        for _ in 0..10 {
            metrics.record_token(Duration::from_millis(50));
        }
        assert_eq!(metrics.tokens_generated(), 10);
        assert_eq!(metrics.decode_time(), Duration::from_millis(500));
        assert!((metrics.tokens_per_second() - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_speed_is_zero_without_time() {
        let metrics = GenerationMetrics::default();
        assert_eq!(metrics.tokens_per_second(), 0.0);
    }

    #[test]
    fn test_reset() {
        let mut metrics = GenerationMetrics::default();
        metrics.record_token(Duration::from_millis(3));
        metrics.reset();
        assert_eq!(metrics, GenerationMetrics::default());
    }
}
