use super::{duration_for_samples, samples_for_duration, ConfigurationSpan, PipelineNodeConfiguration};
use crate::error::{AppResult, DaqError};
use crate::measurement::Measurement;
use std::collections::HashMap;
use std::time::Duration;

/// An immutable block of samples flowing from a stimulus toward hardware
/// (§4.B). `is_last` marks the final block of a stimulus's data; everything
/// downstream relies on it to know when to stop pulling.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputData {
    samples: Vec<Measurement>,
    sample_rate: Measurement,
    is_last: bool,
    node_configuration: Vec<PipelineNodeConfiguration>,
}

impl OutputData {
    /// Builds a block, requiring every sample to share a base unit and the
    /// sample rate to be a positive `Hz` measurement.
    pub fn new(samples: Vec<Measurement>, sample_rate: Measurement, is_last: bool) -> AppResult<Self> {
        validate_samples(&samples)?;
        validate_sample_rate(&sample_rate)?;
        Ok(Self {
            samples,
            sample_rate,
            is_last,
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

    pub fn node_configuration(&self) -> &[PipelineNodeConfiguration] {
        &self.node_configuration
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The wall-clock span this block represents at its own sample rate.
    pub fn duration(&self) -> Duration {
        duration_for_samples(self.samples.len(), self.sample_rate.value_in_base_units())
    }

    /// Splits this block into `(head, rest)` at `duration`, rounding the cut
    /// point up to the nearest whole sample via [`samples_for_duration`].
    /// `is_last` propagates to the rest half only; the head of a split block
    /// is never the last block.
    pub fn split(&self, duration: Duration) -> (OutputData, OutputData) {
        let rate_hz = self.sample_rate.value_in_base_units();
        let cut = samples_for_duration(duration, rate_hz).min(self.samples.len());

        let head = OutputData {
            samples: self.samples[..cut].to_vec(),
            sample_rate: self.sample_rate.clone(),
            is_last: false,
            node_configuration: self.node_configuration.clone(),
        };
        let rest = OutputData {
            samples: self.samples[cut..].to_vec(),
            sample_rate: self.sample_rate.clone(),
            is_last: self.is_last,
            node_configuration: self.node_configuration.clone(),
        };
        (head, rest)
    }

    /// Concatenates `self` followed by `other`. Both must share a sample
    /// rate; at most one of the two may already carry node configuration
    /// (concatenating two already-configured blocks would silently lose
    /// provenance, so it is rejected instead).
    pub fn concat(&self, other: &OutputData) -> AppResult<OutputData> {
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

        Ok(OutputData {
            samples,
            sample_rate: self.sample_rate.clone(),
            is_last: self.is_last || other.is_last,
            node_configuration,
        })
    }

    /// Returns a copy with every sample passed through `convert`.
    pub fn with_conversion<F>(&self, convert: F) -> OutputData
    where
        F: Fn(&Measurement) -> Measurement,
    {
        OutputData {
            samples: self.samples.iter().map(convert).collect(),
            sample_rate: self.sample_rate.clone(),
            is_last: self.is_last,
            node_configuration: self.node_configuration.clone(),
        }
    }

    /// Returns a copy tagged with an additional pipeline node, failing if a
    /// node with the same name is already present.
    pub fn with_node_configuration(
        &self,
        name: impl Into<String>,
        attrs: HashMap<String, serde_json::Value>,
    ) -> AppResult<OutputData> {
        let name = name.into();
        if self.node_configuration.iter().any(|n| n.name == name) {
            return Err(DaqError::ExistingConfiguration(name));
        }
        let mut node_configuration = self.node_configuration.clone();
        let mut node = PipelineNodeConfiguration::new(name);
        node.attributes = attrs;
        node_configuration.push(node);
        Ok(OutputData {
            samples: self.samples.clone(),
            sample_rate: self.sample_rate.clone(),
            is_last: self.is_last,
            node_configuration,
        })
    }

    /// The configuration span this block represents: its duration paired
    /// with the nodes it has been tagged with.
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
