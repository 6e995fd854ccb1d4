//! DAQ stream (§4.D): a named, typed endpoint on a DAQ controller that pulls
//! from or pushes to a bound device.

use crate::device::ExternalDevice;
use crate::error::{AppResult, DaqError};
use crate::measurement::Measurement;
use crate::sample::{ConfigurationSpan, InputData, OutputData};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// A stream's direction on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Input,
    Output,
}

/// Who a stream's device binding belongs to: an output stream has at most
/// one bound device; an input (digital) stream may be shared by several,
/// each claiming a distinct bit position.
#[derive(Debug, Clone, Default)]
pub enum DeviceBinding {
    #[default]
    None,
    Single(String),
    Digital(HashMap<String, u8>),
}

/// A named input or output channel (§4.D). Sample rate is either owned here
/// or left unset when the controller/hardware enforces a single rate across
/// all channels.
#[derive(Debug, Clone)]
pub struct DaqStream {
    name: String,
    direction: StreamDirection,
    sample_rate: Option<Measurement>,
    conversion_target_unit: Option<String>,
    active: bool,
    binding: DeviceBinding,
    has_more_data: bool,
}

impl DaqStream {
    pub fn new(name: impl Into<String>, direction: StreamDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            sample_rate: None,
            conversion_target_unit: None,
            active: true,
            binding: DeviceBinding::None,
            has_more_data: true,
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: Measurement) -> AppResult<Self> {
        if sample_rate.base_unit() != "Hz" || sample_rate.value_in_base_units() <= 0.0 {
            return Err(DaqError::ArgumentError(format!(
                "stream '{}' sample rate must be a positive Hz measurement",
                self.name
            )));
        }
        self.sample_rate = Some(sample_rate);
        Ok(self)
    }

    pub fn with_conversion_target_unit(mut self, unit: impl Into<String>) -> Self {
        self.conversion_target_unit = Some(unit.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn sample_rate(&self) -> Option<&Measurement> {
        self.sample_rate.as_ref()
    }

    pub fn conversion_target_unit(&self) -> Option<&str> {
        self.conversion_target_unit.as_deref()
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn has_more_data(&self) -> bool {
        self.has_more_data
    }

    /// Re-arms the stream so `has_more_data` is true again, for a fresh trial.
    pub fn reset(&mut self) {
        self.has_more_data = true;
    }

    /// Binds a single device to this (output, or single-owner input) stream.
    /// Fails with `StreamConflict` if a device is already bound.
    pub fn bind_device(&mut self, device_name: impl Into<String>) -> AppResult<()> {
        match &self.binding {
            DeviceBinding::None => {
                self.binding = DeviceBinding::Single(device_name.into());
                Ok(())
            }
            _ => Err(DaqError::StreamConflict {
                stream: self.name.clone(),
                position: 0,
            }),
        }
    }

    /// Binds a device to a bit position on a digital multiplexed stream.
    /// Fails with `StreamConflict` if the position is already claimed.
    pub fn bind_digital_device(&mut self, device_name: impl Into<String>, position: u8) -> AppResult<()> {
        let map = match &mut self.binding {
            DeviceBinding::Digital(map) => map,
            DeviceBinding::None => {
                self.binding = DeviceBinding::Digital(HashMap::new());
                match &mut self.binding {
                    DeviceBinding::Digital(map) => map,
                    _ => unreachable!(),
                }
            }
            DeviceBinding::Single(_) => {
                return Err(DaqError::StreamConflict {
                    stream: self.name.clone(),
                    position,
                })
            }
        };
        if map.values().any(|p| *p == position) {
            return Err(DaqError::StreamConflict {
                stream: self.name.clone(),
                position,
            });
        }
        map.insert(device_name.into(), position);
        Ok(())
    }

    pub fn bound_device(&self) -> Option<&str> {
        match &self.binding {
            DeviceBinding::Single(name) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn digital_bindings(&self) -> Option<&HashMap<String, u8>> {
        match &self.binding {
            DeviceBinding::Digital(map) => Some(map),
            _ => None,
        }
    }

    /// Validates that a block pulled from a device matches this stream's
    /// declared sample rate, then records whether the stream has exhausted
    /// its data (the `isLast` block sets `has_more_data = false`).
    pub fn accept_output(&mut self, block: OutputData) -> AppResult<OutputData> {
        if let Some(expected) = &self.sample_rate {
            if !block.sample_rate().is_unit_compatible(expected)
                || (block.sample_rate().value_in_base_units() - expected.value_in_base_units()).abs() > 1e-9
            {
                return Err(DaqError::SampleRateMismatch {
                    expected: expected.value_in_base_units(),
                    actual: block.sample_rate().value_in_base_units(),
                });
            }
        }
        if block.is_last() {
            self.has_more_data = false;
        }
        Ok(block)
    }

    /// Records that a block was actually delivered to hardware, forwarding
    /// the span to the device (and ultimately the stimulus).
    pub fn did_output_data(
        &self,
        device: &mut ExternalDevice,
        time: DateTime<Utc>,
        duration: Duration,
        config_span: ConfigurationSpan,
        source: &mut dyn crate::controller::EpochSource,
    ) -> AppResult<()> {
        device.did_output_data(&self.name, time, duration, config_span, source)
    }

    /// Forwards a pushed input block to every device bound to this stream,
    /// applying the bit-shift-and-mask for digital streams.
    pub fn push_input_data(
        &self,
        block: InputData,
        devices: &mut HashMap<String, ExternalDevice>,
        source: &mut dyn crate::controller::EpochSource,
    ) -> AppResult<()> {
        match &self.binding {
            DeviceBinding::Single(name) => {
                if let Some(device) = devices.get_mut(name) {
                    device.push_input_data(&self.name, block, source)?;
                }
                Ok(())
            }
            DeviceBinding::Digital(map) => {
                for (name, position) in map {
                    if let Some(device) = devices.get_mut(name) {
                        let masked = bit_shift_and_mask(&block, *position)?;
                        device.push_input_data(&self.name, masked, source)?;
                    }
                }
                Ok(())
            }
            DeviceBinding::None => Ok(()),
        }
    }

    /// Merges per-device output blocks onto a digital stream: each bound
    /// device occupies a bit position; the result is the per-sample OR of
    /// shifted values.
    pub fn bit_shift_and_merge_output(&self, per_device: &HashMap<String, OutputData>) -> AppResult<OutputData> {
        let map = self
            .digital_bindings()
            .ok_or_else(|| DaqError::ArgumentError(format!("stream '{}' is not a digital stream", self.name)))?;

        let mut merged: Option<Vec<f64>> = None;
        let mut sample_rate = None;
        for (device_name, position) in map {
            let block = per_device
                .get(device_name)
                .ok_or_else(|| DaqError::ArgumentError(format!("no output block for device '{device_name}'")))?;
            sample_rate.get_or_insert_with(|| block.sample_rate().clone());
            let shifted: Vec<f64> = block
                .samples()
                .iter()
                .map(|m| (m.value_in_base_units() as i64) << position)
                .map(|v| v as f64)
                .collect();
            merged = Some(match merged {
                None => shifted,
                Some(existing) => existing
                    .into_iter()
                    .zip(shifted)
                    .map(|(a, b)| ((a as i64) | (b as i64)) as f64)
                    .collect(),
            });
        }

        let samples = merged
            .unwrap_or_default()
            .into_iter()
            .map(|v| Measurement::in_base_units(v, "bits").expect("non-empty unit"))
            .collect();
        OutputData::new(samples, sample_rate.unwrap_or(Measurement::in_base_units(1.0, "Hz").expect("valid")), false)
    }
}

fn bit_shift_and_mask(block: &InputData, position: u8) -> AppResult<InputData> {
    let masked_samples: Vec<Measurement> = block
        .samples()
        .iter()
        .map(|m| {
            let bit = ((m.value_in_base_units() as i64) >> position) & 1;
            Measurement::in_base_units(bit as f64, "bit").expect("non-empty unit")
        })
        .collect();
    InputData::new(masked_samples, block.sample_rate().clone(), block.is_last(), block.input_time())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_device_rejects_second_binding() {
        let mut stream = DaqStream::new("ao0", StreamDirection::Output);
        stream.bind_device("device-a").unwrap();
        assert!(stream.bind_device("device-b").is_err());
    }

    #[test]
    fn digital_binding_rejects_duplicate_position() {
        let mut stream = DaqStream::new("dio0", StreamDirection::Input);
        stream.bind_digital_device("device-a", 0).unwrap();
        let err = stream.bind_digital_device("device-b", 0).unwrap_err();
        assert!(matches!(err, DaqError::StreamConflict { .. }));
    }

    #[test]
    fn accept_output_rejects_rate_mismatch() {
        let mut stream = DaqStream::new("ao0", StreamDirection::Output)
            .with_sample_rate(Measurement::new(1000.0, 0, "Hz").unwrap())
            .unwrap();
        let block = OutputData::new(
            vec![Measurement::new(1.0, 0, "V").unwrap()],
            Measurement::new(2000.0, 0, "Hz").unwrap(),
            false,
        )
        .unwrap();
        assert!(stream.accept_output(block).is_err());
    }

    #[test]
    fn accept_output_marks_exhausted_on_last_block() {
        let mut stream = DaqStream::new("ao0", StreamDirection::Output);
        let block = OutputData::new(
            vec![Measurement::new(1.0, 0, "V").unwrap()],
            Measurement::new(1000.0, 0, "Hz").unwrap(),
            true,
        )
        .unwrap();
        stream.accept_output(block).unwrap();
        assert!(!stream.has_more_data());
        stream.reset();
        assert!(stream.has_more_data());
    }
}
