//! External device (§4.E): a domain object bound to one or more streams that
//! performs unit conversion and buffers per-device output/input.
//!
//! The source hierarchy this flattens (`ExternalDeviceBase` →
//! `UnitConverting` → `Calibrated` → amplifier-specific subclasses, §9)
//! becomes a single concrete struct holding a pluggable conversion function
//! and, for devices with an asynchronous parameter source, a parameter
//! history.

use crate::controller::EpochSource;
use crate::error::{AppResult, DaqError};
use crate::measurement::Measurement;
use crate::sample::{ConfigurationSpan, InputData, OutputData, PipelineNodeConfiguration};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A unit-conversion function pair applied on output (to hardware) and input
/// (from hardware).
#[derive(Clone)]
pub struct ConversionFn(pub Arc<dyn Fn(&Measurement) -> Measurement + Send + Sync>);

impl std::fmt::Debug for ConversionFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversionFn(..)")
    }
}

/// A point-in-time device parameter snapshot, e.g. an amplifier telegraph
/// reading (gain, mode) at a given timestamp.
#[derive(Debug, Clone)]
pub struct ParameterSnapshot {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

/// Time-indexed history of asynchronous device parameters (§4.E). Readers
/// take the latest snapshot at or before a requested time; snapshots older
/// than `staleness` for which a newer snapshot exists are evicted.
#[derive(Debug, Default)]
pub struct ParameterHistory {
    snapshots: BTreeMap<DateTime<Utc>, ParameterSnapshot>,
    staleness: Duration,
}

impl ParameterHistory {
    pub fn new(staleness: Duration) -> Self {
        Self {
            snapshots: BTreeMap::new(),
            staleness,
        }
    }

    pub fn record(&mut self, snapshot: ParameterSnapshot) {
        self.snapshots.insert(snapshot.timestamp, snapshot);
    }

    /// The snapshot with the latest timestamp `<= at`, if any.
    pub fn snapshot_at(&self, at: DateTime<Utc>) -> Option<&ParameterSnapshot> {
        self.snapshots.range(..=at).next_back().map(|(_, v)| v)
    }

    /// Evicts snapshots older than `staleness` relative to `now`, provided a
    /// strictly newer snapshot exists (the latest snapshot is never evicted,
    /// even if stale, since it is still the best available reading).
    pub fn evict_stale(&mut self, now: DateTime<Utc>) {
        if self.snapshots.len() <= 1 {
            return;
        }
        let cutoff = now - chrono::Duration::from_std(self.staleness).unwrap_or_else(|_| chrono::Duration::zero());
        let newest = *self.snapshots.keys().next_back().expect("len > 1 checked above");
        self.snapshots.retain(|ts, _| *ts == newest || *ts >= cutoff);
    }
}

/// A logical instrument bound to one or more stream slots on a controller
/// (§4.E). Exclusively owned by the controller; identified by a name unique
/// within it.
#[derive(Debug)]
pub struct ExternalDevice {
    name: String,
    manufacturer: String,
    background: Measurement,
    conversion_target_unit: String,
    output_conversion: Option<ConversionFn>,
    input_conversion: Option<ConversionFn>,
    parameter_history: Option<ParameterHistory>,
}

impl ExternalDevice {
    pub fn new(
        name: impl Into<String>,
        manufacturer: impl Into<String>,
        background: Measurement,
        conversion_target_unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            manufacturer: manufacturer.into(),
            background,
            conversion_target_unit: conversion_target_unit.into(),
            output_conversion: None,
            input_conversion: None,
            parameter_history: None,
        }
    }

    pub fn with_conversion(mut self, output: ConversionFn, input: ConversionFn) -> Self {
        self.output_conversion = Some(output);
        self.input_conversion = Some(input);
        self
    }

    pub fn with_parameter_history(mut self, staleness: Duration) -> Self {
        self.parameter_history = Some(ParameterHistory::new(staleness));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn background(&self) -> &Measurement {
        &self.background
    }

    pub fn conversion_target_unit(&self) -> &str {
        &self.conversion_target_unit
    }

    pub fn parameter_history_mut(&mut self) -> Option<&mut ParameterHistory> {
        self.parameter_history.as_mut()
    }

    /// Requests a block from the epoch source, applies device-specific unit
    /// conversion, and tags it with the device's configuration snapshot.
    pub fn pull_output_data(
        &self,
        duration: Duration,
        source: &mut dyn EpochSource,
    ) -> AppResult<OutputData> {
        if duration.is_zero() {
            return Err(DaqError::ExternalDeviceError(format!(
                "device '{}': requested duration is shorter than one sample",
                self.name
            )));
        }
        let block = source
            .pull_output_data(&self.name, duration)?
            .ok_or_else(|| {
                DaqError::ExternalDeviceError(format!("device '{}' has no current operating parameters", self.name))
            })?;

        let converted = match &self.output_conversion {
            Some(convert) => block.with_conversion(|m| (convert.0)(m)),
            None => block,
        };
        converted.with_node_configuration(self.name.clone(), std::collections::HashMap::new())
    }

    /// Notifies the epoch source that a block was actually delivered to
    /// hardware, so the originating stimulus can accumulate the span.
    pub fn did_output_data(
        &mut self,
        _stream_name: &str,
        time: DateTime<Utc>,
        duration: Duration,
        config_span: ConfigurationSpan,
        source: &mut dyn EpochSource,
    ) -> AppResult<()> {
        source.did_output_data(&self.name, time, duration, config_span)
    }

    /// Applies reverse unit conversion, tags with configuration, and
    /// forwards the result to the epoch source.
    pub fn push_input_data(
        &mut self,
        _stream_name: &str,
        block: InputData,
        source: &mut dyn EpochSource,
    ) -> AppResult<()> {
        let converted = match &self.input_conversion {
            Some(convert) => block.with_conversion(|m| (convert.0)(m)),
            None => block,
        };
        let tagged = converted.with_node_configuration(self.name.clone(), std::collections::HashMap::new())?;
        source.push_input_data(&self.name, tagged)
    }

    /// Looks up the parameter snapshot applicable to a block's `input_time`,
    /// evicting stale entries first.
    pub fn parameter_snapshot_for(&mut self, input_time: DateTime<Utc>) -> Option<ParameterSnapshot> {
        let history = self.parameter_history.as_mut()?;
        history.evict_stale(input_time);
        history.snapshot_at(input_time).cloned()
    }
}

/// Stand-in pipeline node naming a device's own conversion stage, reused
/// wherever code needs to describe a device's contribution to a configuration
/// span without constructing a full [`PipelineNodeConfiguration`] inline.
pub fn device_node(name: &str) -> PipelineNodeConfiguration {
    PipelineNodeConfiguration::new(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn background() -> Measurement {
        Measurement::new(0.0, 0, "V").unwrap()
    }

    #[test]
    fn parameter_history_returns_latest_snapshot_at_or_before() {
        let mut history = ParameterHistory::new(Duration::from_secs(5));
        let t0 = Utc::now();
        history.record(ParameterSnapshot {
            timestamp: t0,
            values: BTreeMap::from([("gain".to_string(), 10.0)]),
        });
        history.record(ParameterSnapshot {
            timestamp: t0 + chrono::Duration::seconds(1),
            values: BTreeMap::from([("gain".to_string(), 20.0)]),
        });

        let snapshot = history.snapshot_at(t0 + chrono::Duration::milliseconds(500)).unwrap();
        assert_eq!(snapshot.values["gain"], 10.0);
    }

    #[test]
    fn parameter_history_evicts_stale_with_newer_successor() {
        let mut history = ParameterHistory::new(Duration::from_secs(5));
        let t0 = Utc::now();
        history.record(ParameterSnapshot {
            timestamp: t0,
            values: BTreeMap::new(),
        });
        history.record(ParameterSnapshot {
            timestamp: t0 + chrono::Duration::seconds(10),
            values: BTreeMap::new(),
        });
        history.evict_stale(t0 + chrono::Duration::seconds(10));
        assert_eq!(history.snapshots.len(), 1);
    }

    #[test]
    fn device_new_has_no_conversion_by_default() {
        let device = ExternalDevice::new("amp0", "acme", background(), "V");
        assert_eq!(device.name(), "amp0");
        assert_eq!(device.conversion_target_unit(), "V");
    }
}
