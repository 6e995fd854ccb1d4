use super::{duration_for_samples, samples_for_duration, ConfigurationSpan, PipelineNodeConfiguration};
use crate::error::{AppResult, DaqError};
use crate::measurement::Measurement;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// An immutable block of samples flowing from hardware toward a response
/// (§4.B). Unlike [`crate::sample::OutputData`], every block carries the
/// wall-clock time its first sample was acquired, since responses must be
/// reassembled in `input_time` order across possibly-out-of-order delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct InputData {
    samples: Vec<Measurement>,
    sample_rate: Measurement,
    is_last: bool,
    input_time: DateTime<Utc>,
    node_configuration: Vec<PipelineNodeConfiguration>,
}

impl InputData {
    pub fn new(
        samples: Vec<Measurement>,
        sample_rate: Measurement,
        is_last: bool,
        input_time: DateTime<Utc>,
    ) -> AppResult<Self> {
        validate_samples(&samples)?;
        validate_sample_rate(&sample_rate)?;
        Ok(Self {
            samples,
            sample_rate,
            is_last,
            input_time,
            node_configuration: Vec::new(),
        })
    }

    pub fn samples(&self) -> &[Measurement] {
        &self.samples
    }

    pub fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn input_time(&self) -> DateTime<Utc> {
        self.input_time
    }

    pub fn node_configuration(&self) -> &[PipelineNodeConfiguration] {
        &self.node_configuration
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        duration_for_samples(self.samples.len(), self.sample_rate.value_in_base_units())
    }

    /// The `input_time` of the sample immediately after this block, i.e. the
    /// `input_time` the rest-half of a [`InputData::split`] should carry.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.input_time
            + chrono::Duration::from_std(self.duration()).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Splits at `duration`, deriving the rest half's `input_time` as
    /// `self.input_time + head.duration()`.
    pub fn split(&self, duration: Duration) -> (InputData, InputData) {
        let rate_hz = self.sample_rate.value_in_base_units();
        let cut = samples_for_duration(duration, rate_hz).min(self.samples.len());

        let head = InputData {
            samples: self.samples[..cut].to_vec(),
            sample_rate: self.sample_rate.clone(),
            is_last: false,
            input_time: self.input_time,
            node_configuration: self.node_configuration.clone(),
        };
        let rest = InputData {
            samples: self.samples[cut..].to_vec(),
            sample_rate: self.sample_rate.clone(),
            is_last: self.is_last,
            input_time: head.end_time(),
            node_configuration: self.node_configuration.clone(),
        };
        (head, rest)
    }

    /// Concatenates `self` followed by `other`, which must immediately
    /// follow `self` in time (`other.input_time == self.end_time()`) and
    /// share a sample rate.
    pub fn concat(&self, other: &InputData) -> AppResult<InputData> {
        if let (Some(a), Some(b)) = (self.samples.first(), other.samples.first()) {
            if !a.is_unit_compatible(b) {
                return Err(DaqError::MeasurementIncompatibility {
                    expected: a.base_unit().to_string(),
                    actual: b.base_unit().to_string(),
                });
            }
        }
        if self.sample_rate != other.sample_rate {
            return Err(DaqError::SampleRateMismatch {
                expected: self.sample_rate.value_in_base_units(),
                actual: other.sample_rate.value_in_base_units(),
            });
        }
        if !self.node_configuration.is_empty() && !other.node_configuration.is_empty() {
            return Err(DaqError::ExistingConfiguration(
                "both operands of concat already carry node configuration".into(),
            ));
        }

        let mut samples = self.samples.clone();
        samples.extend(other.samples.iter().cloned());
        let mut node_configuration = self.node_configuration.clone();
        node_configuration.extend(other.node_configuration.iter().cloned());

        Ok(InputData {
            samples,
            sample_rate: self.sample_rate.clone(),
            is_last: self.is_last || other.is_last,
            input_time: self.input_time,
            node_configuration,
        })
    }

    pub fn with_conversion<F>(&self, convert: F) -> InputData
    where
        F: Fn(&Measurement) -> Measurement,
    {
        InputData {
            samples: self.samples.iter().map(convert).collect(),
            sample_rate: self.sample_rate.clone(),
            is_last: self.is_last,
            input_time: self.input_time,
            node_configuration: self.node_configuration.clone(),
        }
    }

    pub fn with_node_configuration(
        &self,
        name: impl Into<String>,
        attrs: HashMap<String, serde_json::Value>,
    ) -> AppResult<InputData> {
        let name = name.into();
        if self.node_configuration.iter().any(|n| n.name == name) {
            return Err(DaqError::ExistingConfiguration(name));
        }
        let mut node_configuration = self.node_configuration.clone();
        let mut node = PipelineNodeConfiguration::new(name);
        node.attributes = attrs;
        node_configuration.push(node);
        Ok(InputData {
            samples: self.samples.clone(),
            sample_rate: self.sample_rate.clone(),
            is_last: self.is_last,
            input_time: self.input_time,
            node_configuration,
        })
    }

    pub fn configuration_span(&self) -> ConfigurationSpan {
        ConfigurationSpan::new(self.duration(), self.node_configuration.clone())
    }
}

fn validate_samples(samples: &[Measurement]) -> AppResult<()> {
    let mut iter = samples.iter();
    if let Some(first) = iter.next() {
        for sample in iter {
            if !first.is_unit_compatible(sample) {
                return Err(DaqError::MeasurementIncompatibility {
                    expected: first.base_unit().to_string(),
                    actual: sample.base_unit().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn validate_sample_rate(sample_rate: &Measurement) -> AppResult<()> {
    if sample_rate.base_unit() != "Hz" || sample_rate.value_in_base_units() <= 0.0 {
        return Err(DaqError::ArgumentError(format!(
            "sample rate must be a positive Hz measurement, got {sample_rate}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(hz: f64) -> Measurement {
        Measurement::new(hz, 0, "Hz").unwrap()
    }

    fn samples(n: usize) -> Vec<Measurement> {
        (0..n).map(|i| Measurement::new(i as f64, 0, "V").unwrap()).collect()
    }

    #[test]
    fn split_derives_rest_input_time_from_head_duration() {
        let t0 = Utc::now();
        let data = InputData::new(samples(1000), rate(1000.0), true, t0).unwrap();
        let (head, rest) = data.split(Duration::from_millis(500));
        assert_eq!(head.input_time(), t0);
        assert_eq!(rest.input_time(), t0 + chrono::Duration::milliseconds(500));
    }

    #[test]
    fn concat_requires_matching_sample_rate() {
        let t0 = Utc::now();
        let a = InputData::new(samples(10), rate(1000.0), false, t0).unwrap();
        let b = InputData::new(samples(10), rate(2000.0), false, t0).unwrap();
        assert!(a.concat(&b).is_err());
    }

    #[test]
    fn split_then_concat_round_trips() {
        let t0 = Utc::now();
        let data = InputData::new(samples(1000), rate(1000.0), true, t0).unwrap();
        let (head, rest) = data.split(Duration::from_millis(500));
        let rejoined = head.concat(&rest).unwrap();
        assert_eq!(rejoined.samples(), data.samples());
        assert_eq!(rejoined.input_time(), t0);
    }

    #[test]
    fn with_node_configuration_stores_attributes() {
        let t0 = Utc::now();
        let attrs = HashMap::from([("gain_db".to_string(), serde_json::json!(6.0))]);
        let a = InputData::new(samples(10), rate(1000.0), false, t0)
            .unwrap()
            .with_node_configuration("gain", attrs)
            .unwrap();
        assert_eq!(a.node_configuration()[0].attributes["gain_db"], serde_json::json!(6.0));
    }

    #[test]
    fn concat_rejects_mismatched_base_units() {
        let t0 = Utc::now();
        let a = InputData::new(samples(10), rate(1000.0), false, t0).unwrap();
        let amps: Vec<Measurement> = (0..10).map(|i| Measurement::new(i as f64, 0, "A").unwrap()).collect();
        let b = InputData::new(amps, rate(1000.0), false, t0).unwrap();
        assert!(a.concat(&b).is_err());
    }
}
