//! Persistor interface (§4.J): the write-side contract the acquisition
//! controller uses to record completed epochs. Binary representation is
//! opaque to the core; the core only guarantees it calls the interface from
//! a single persistence task at a time.

use crate::epoch::Epoch;
use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A persisted epoch's stimulus record (§4.J: ID, units, sample rate,
/// duration, parameters, optionally the rendered data, output configuration
/// spans).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStimulus {
    pub id: String,
    pub output_unit: String,
    pub sample_rate_hz: Option<f64>,
    pub duration_secs: Option<f64>,
    pub parameters: BTreeMap<String, f64>,
    pub rendered_samples: Option<Vec<f64>>,
    pub output_configuration_spans: Vec<serde_json::Value>,
}

/// A persisted epoch's response record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedResponse {
    pub sample_rate_hz: f64,
    pub input_time: DateTime<Utc>,
    pub samples: Vec<f64>,
    pub data_configuration_spans: Vec<serde_json::Value>,
}

/// The flattened record handed to a persistor for one completed epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEpoch {
    pub protocol_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub parameters: BTreeMap<String, f64>,
    pub keywords: Vec<String>,
    pub backgrounds: BTreeMap<String, f64>,
    pub stimuli: BTreeMap<String, PersistedStimulus>,
    pub responses: BTreeMap<String, PersistedResponse>,
}

/// An opaque handle to a persisted epoch, returned by `serialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedHandle(pub u64);

/// Write-side contract for recording completed epochs (§4.J). Implementors
/// decide the actual on-disk representation; the core calls these methods
/// from a single persistence task per epoch.
#[async_trait]
pub trait Persistor: Send + Sync {
    async fn begin_epoch_block(
        &self,
        protocol_id: &str,
        parameters: &BTreeMap<String, f64>,
        start_time: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn serialize(&self, epoch: &PersistedEpoch) -> AppResult<PersistedHandle>;

    async fn end_epoch_block(&self, end_time: DateTime<Utc>) -> AppResult<()>;
}

/// Flattens a completed [`Epoch`] into its persisted record. The caller
/// supplies `end_time` since the epoch itself does not track one.
pub fn persisted_epoch_from(epoch: &Epoch, end_time: DateTime<Utc>) -> PersistedEpoch {
    PersistedEpoch {
        protocol_id: epoch.protocol_id().to_string(),
        start_time: epoch.start_time().unwrap_or(end_time),
        end_time,
        parameters: epoch.parameters().clone(),
        keywords: epoch.keywords().iter().cloned().collect(),
        backgrounds: epoch
            .background_devices()
            .filter_map(|name| {
                let background = epoch.background(name)?;
                Some((name.clone(), background.value.value_in_base_units()))
            })
            .collect(),
        stimuli: epoch
            .stimulus_devices()
            .filter_map(|name| {
                let stim = epoch.stimulus(name)?;
                Some((
                    name.clone(),
                    PersistedStimulus {
                        id: stim.id().to_string(),
                        output_unit: stim.output_unit().to_string(),
                        sample_rate_hz: stim.sample_rate().map(|m| m.value_in_base_units()),
                        duration_secs: stim.duration().map(|d| d.as_secs_f64()),
                        parameters: stim.parameters().clone(),
                        rendered_samples: stim
                            .rendered_data()
                            .map(|data| data.samples().iter().map(|m| m.value_in_base_units()).collect()),
                        output_configuration_spans: stim
                            .output_configuration_spans()
                            .iter()
                            .map(|span| serde_json::to_value(span).unwrap_or(serde_json::Value::Null))
                            .collect(),
                    },
                ))
            })
            .collect(),
        responses: epoch
            .response_devices()
            .filter_map(|name| {
                let response = epoch.response(name)?;
                let first_segment = response.segments().first()?;
                Some((
                    name.clone(),
                    PersistedResponse {
                        sample_rate_hz: first_segment.sample_rate().value_in_base_units(),
                        input_time: first_segment.input_time(),
                        samples: response.samples().iter().map(|m| m.value_in_base_units()).collect(),
                        data_configuration_spans: response
                            .segments()
                            .iter()
                            .map(|segment| {
                                serde_json::to_value(segment.configuration_span()).unwrap_or(serde_json::Value::Null)
                            })
                            .collect(),
                    },
                ))
            })
            .collect(),
    }
}

/// A concrete [`Persistor`] that appends one JSON object per epoch to a
/// newline-delimited file, for tests and small deployments without a real
/// archive backend.
pub struct JsonlPersistor {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlPersistor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl Persistor for JsonlPersistor {
    async fn begin_epoch_block(
        &self,
        _protocol_id: &str,
        _parameters: &BTreeMap<String, f64>,
        _start_time: DateTime<Utc>,
    ) -> AppResult<()> {
        Ok(())
    }

    async fn serialize(&self, epoch: &PersistedEpoch) -> AppResult<PersistedHandle> {
        let _guard = self.lock.lock().await;
        let line = serde_json::to_string(epoch)?;
        let mut contents = tokio::fs::read_to_string(&self.path).await.unwrap_or_default();
        let handle = contents.lines().count() as u64;
        contents.push_str(&line);
        contents.push('\n');
        tokio::fs::write(&self.path, contents).await?;
        Ok(PersistedHandle(handle))
    }

    async fn end_epoch_block(&self, _end_time: DateTime<Utc>) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jsonl_persistor_appends_one_line_per_epoch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("epochs.jsonl");
        let persistor = JsonlPersistor::new(&path);

        let epoch = PersistedEpoch {
            protocol_id: "proto-1".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            parameters: BTreeMap::new(),
            keywords: Vec::new(),
            backgrounds: BTreeMap::new(),
            stimuli: BTreeMap::new(),
            responses: BTreeMap::new(),
        };

        persistor.serialize(&epoch).await.unwrap();
        persistor.serialize(&epoch).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
