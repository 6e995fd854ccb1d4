//! Sample stream data (§4.B): immutable blocks of samples with sample-rate
//! and provenance metadata, and the sample↔time arithmetic that every other
//! component delegates to.

mod input_data;
mod output_data;

pub use input_data::InputData;
pub use output_data::OutputData;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// `(name, attributes)` describing one pipeline node a block passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineNodeConfiguration {
    pub name: String,
    pub attributes: HashMap<String, serde_json::Value>,
}

impl PipelineNodeConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A `(duration, nodes)` record: the set of pipeline nodes that shaped the
/// samples delivered over a span of time. Stimuli accumulate these in
/// insertion order as output is actually delivered to hardware (§4.F).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpan {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub nodes: Vec<PipelineNodeConfiguration>,
}

impl ConfigurationSpan {
    pub fn new(duration: Duration, nodes: Vec<PipelineNodeConfiguration>) -> Self {
        Self { duration, nodes }
    }
}

/// Nanosecond tick resolution; the single authority other components use to
/// convert between sample counts and durations.
pub const TICKS_PER_SECOND: u64 = 1_000_000_000;

/// `duration(block) = ceil(samples * ticksPerSecond / sampleRateHz)` (§4.B).
pub fn duration_for_samples(sample_count: usize, sample_rate_hz: f64) -> Duration {
    if sample_count == 0 {
        return Duration::ZERO;
    }
    let ticks = (sample_count as f64 * TICKS_PER_SECOND as f64 / sample_rate_hz).ceil();
    Duration::from_nanos(ticks.max(0.0) as u64)
}

/// `samples(duration, rate) = ceil(duration.seconds * rate)` (§4.B).
pub fn samples_for_duration(duration: Duration, sample_rate_hz: f64) -> usize {
    let count = (duration.as_secs_f64() * sample_rate_hz).ceil();
    count.max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_and_samples_are_inverse_at_integral_rates() {
        let d = duration_for_samples(500, 1000.0);
        assert_eq!(d, Duration::from_millis(500));
        assert_eq!(samples_for_duration(d, 1000.0), 500);
    }

    #[test]
    fn zero_samples_is_zero_duration() {
        assert_eq!(duration_for_samples(0, 1000.0), Duration::ZERO);
    }

    #[test]
    fn samples_for_duration_rounds_up() {
        // 333 samples at 1000 Hz -> 333 ms exactly; 1 sample at 3 Hz -> ceil(333.33ms)
        let d = Duration::from_nanos(333_333_334); // slightly over 1/3 s
        assert_eq!(samples_for_duration(d, 3.0), 2);
    }
}
