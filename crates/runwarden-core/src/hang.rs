use std::time::Duration;

pub const LOOSE_THRESHOLD: f64 = 0.90;
pub const STRICT_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub max_gb: f64,
    pub avg_gb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryTelemetry {
    Sampled(MemorySample),
    /// The scheduler cannot report memory. Never grounds for a kill.
    Unsupported,
}

/// Decides whether a running job has been pinned at its memory limit long
/// enough that it will never finish.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HangDetector {
    pub threshold: f64,
}

impl Default for HangDetector {
    fn default() -> Self {
        Self::loose()
    }
}

impl HangDetector {
    pub fn loose() -> Self {
        Self {
            threshold: LOOSE_THRESHOLD,
        }
    }

    pub fn strict() -> Self {
        Self {
            threshold: STRICT_THRESHOLD,
        }
    }

    pub fn is_hung(&self, telemetry: &MemoryTelemetry, requested_gb: f64) -> bool {
        let MemoryTelemetry::Sampled(sample) = telemetry else {
            return false;
        };
        if requested_gb <= 0.0 {
            return false;
        }
        sample.max_gb >= requested_gb && sample.avg_gb / requested_gb >= self.threshold
    }
}

/// Tracks when the next hang check is due, measured from the moment the job
/// was first seen running.
#[derive(Debug, Clone)]
pub struct HangCheckSchedule {
    min_running: Duration,
    interval: Duration,
    last_check: Option<Duration>,
}

impl HangCheckSchedule {
    pub fn new(min_running: Duration, interval: Duration) -> Self {
        Self {
            min_running,
            interval,
            last_check: None,
        }
    }

    pub fn every(interval: Duration) -> Self {
        Self::new(interval, interval)
    }

    /// Returns true, and records the check, when a sample should be taken now.
    pub fn is_due(&mut self, running_for: Duration) -> bool {
        if running_for < self.min_running {
            return false;
        }
        let due = match self.last_check {
            None => true,
            Some(last) => running_for.saturating_sub(last) >= self.interval,
        };
        if due {
            self.last_check = Some(running_for);
        }
        due
    }
}

pub fn jittered_secs(min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    rand::random_range(min..=max)
}

/// Returns true roughly once every `n` calls.
pub fn one_in(n: u32) -> bool {
    if n <= 1 {
        return true;
    }
    rand::random_range(0..n) == 0
}
