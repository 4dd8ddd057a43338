//! Builder translating raw breaker settings into resolved circuit settings.

use super::circuit::CircuitSettings;
use std::time::Duration;

// Library defaults applied for zero-valued settings.
const DEFAULT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_MAX_CONCURRENT: u32 = 10;
const DEFAULT_VOLUME_THRESHOLD: u32 = 20;
const DEFAULT_SLEEP_WINDOW_MS: u64 = 5_000;
const DEFAULT_ERROR_PERCENT: u32 = 50;
/// Unset queue size defaults to this multiple of the concurrency cap.
const DEFAULT_QUEUE_FACTOR: u32 = 5;

/// Builder for one circuit's settings. Zero-valued inputs keep the library
/// default for that field.
#[derive(Debug, Clone)]
pub struct CircuitBuilder {
    name: String,
    timeout_ms: u64,
    max_concurrent: u32,
    volume_threshold: u32,
    sleep_window_ms: u64,
    error_percent: u32,
    queue_size: Option<u32>,
}

impl CircuitBuilder {
    /// Start a builder for the circuit with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            sleep_window_ms: DEFAULT_SLEEP_WINDOW_MS,
            error_percent: DEFAULT_ERROR_PERCENT,
            queue_size: None,
        }
    }

    /// The circuit name this builder configures.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-call timeout in milliseconds.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        if timeout_ms > 0 {
            self.timeout_ms = timeout_ms;
        }
        self
    }

    /// Concurrency cap.
    pub fn with_max_concurrent_requests(mut self, max_concurrent: u32) -> Self {
        if max_concurrent > 0 {
            self.max_concurrent = max_concurrent;
        }
        self
    }

    /// Minimum request volume before the circuit can trip.
    pub fn with_request_volume_threshold(mut self, volume: u32) -> Self {
        if volume > 0 {
            self.volume_threshold = volume;
        }
        self
    }

    /// Error percentage at which the circuit opens.
    pub fn with_error_percentage_threshold(mut self, percent: u32) -> Self {
        if percent > 0 {
            self.error_percent = percent;
        }
        self
    }

    /// Recovery sleep window in milliseconds.
    pub fn with_sleep_window(mut self, sleep_window_ms: u64) -> Self {
        if sleep_window_ms > 0 {
            self.sleep_window_ms = sleep_window_ms;
        }
        self
    }

    /// Bound on calls waiting for a concurrency permit.
    pub fn with_queue_size(mut self, queue_size: u32) -> Self {
        if queue_size > 0 {
            self.queue_size = Some(queue_size);
        }
        self
    }

    /// Resolve into settings, applying the queue-size default.
    pub fn build(self) -> CircuitSettings {
        CircuitSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            max_concurrent: self.max_concurrent,
            volume_threshold: self.volume_threshold,
            error_percent: self.error_percent,
            sleep_window: Duration::from_millis(self.sleep_window_ms),
            queue_size: self
                .queue_size
                .unwrap_or(DEFAULT_QUEUE_FACTOR * self.max_concurrent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_values_keep_defaults() {
        let settings = CircuitBuilder::new("redis_x")
            .with_timeout(0)
            .with_max_concurrent_requests(0)
            .with_request_volume_threshold(0)
            .with_error_percentage_threshold(0)
            .with_sleep_window(0)
            .with_queue_size(0)
            .build();

        assert_eq!(settings.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(settings.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(settings.volume_threshold, DEFAULT_VOLUME_THRESHOLD);
        assert_eq!(settings.error_percent, DEFAULT_ERROR_PERCENT);
        assert_eq!(
            settings.sleep_window,
            Duration::from_millis(DEFAULT_SLEEP_WINDOW_MS)
        );
        assert_eq!(settings.queue_size, DEFAULT_QUEUE_FACTOR * DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn test_explicit_values_are_kept() {
        let settings = CircuitBuilder::new("redis_x")
            .with_timeout(200)
            .with_max_concurrent_requests(7)
            .with_request_volume_threshold(3)
            .with_error_percentage_threshold(25)
            .with_sleep_window(900)
            .with_queue_size(4)
            .build();

        assert_eq!(settings.timeout, Duration::from_millis(200));
        assert_eq!(settings.max_concurrent, 7);
        assert_eq!(settings.volume_threshold, 3);
        assert_eq!(settings.error_percent, 25);
        assert_eq!(settings.sleep_window, Duration::from_millis(900));
        assert_eq!(settings.queue_size, 4);
    }
}
