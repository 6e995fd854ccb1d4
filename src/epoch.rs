//! Epoch (§4.G): a single trial — per-device stimulus, background, response,
//! parameters, keywords, and the validity rules binding them together.

use crate::error::{AppResult, DaqError};
use crate::measurement::Measurement;
use crate::sample::{OutputData, PipelineNodeConfiguration};
use crate::stimulus::Stimulus;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// The resting value emitted on an output channel when no stimulus is
/// active, or after a stimulus completes within an epoch (§3).
#[derive(Debug, Clone)]
pub struct Background {
    pub value: Measurement,
    pub sample_rate: Measurement,
}

/// One trial (§3, §4.G).
pub struct Epoch {
    id: Uuid,
    protocol_id: String,
    parameters: BTreeMap<String, f64>,
    keywords: HashSet<String>,
    start_time: Option<DateTime<Utc>>,
    stimuli: HashMap<String, Stimulus>,
    responses: HashMap<String, crate::response::Response>,
    backgrounds: HashMap<String, Background>,
    output_accumulators: HashMap<String, Vec<(Duration, Vec<PipelineNodeConfiguration>)>>,
}

impl Epoch {
    pub fn new(protocol_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol_id: protocol_id.into(),
            parameters: BTreeMap::new(),
            keywords: HashSet::new(),
            start_time: None,
            stimuli: HashMap::new(),
            responses: HashMap::new(),
            backgrounds: HashMap::new(),
            output_accumulators: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.insert(keyword.into());
        self
    }

    pub fn parameters(&self) -> &BTreeMap<String, f64> {
        &self.parameters
    }

    pub fn keywords(&self) -> &HashSet<String> {
        &self.keywords
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Assigns the epoch's start time. Fails with `InvalidOperation` if
    /// already assigned; start time may be set at most once.
    pub fn set_start_time(&mut self, time: DateTime<Utc>) -> AppResult<()> {
        if self.start_time.is_some() {
            return Err(DaqError::InvalidOperation(
                "epoch start time may only be assigned once".into(),
            ));
        }
        self.start_time = Some(time);
        Ok(())
    }

    pub fn register_stimulus(&mut self, device_name: impl Into<String>, stimulus: Stimulus) {
        self.stimuli.insert(device_name.into(), stimulus);
    }

    pub fn register_background(&mut self, device_name: impl Into<String>, background: Background) {
        self.backgrounds.insert(device_name.into(), background);
    }

    pub fn register_response(&mut self, device_name: impl Into<String>) {
        self.responses.insert(device_name.into(), crate::response::Response::new());
    }

    pub fn stimulus_devices(&self) -> impl Iterator<Item = &String> {
        self.stimuli.keys()
    }

    pub fn response_devices(&self) -> impl Iterator<Item = &String> {
        self.responses.keys()
    }

    pub fn response(&self, device_name: &str) -> Option<&crate::response::Response> {
        self.responses.get(device_name)
    }

    pub fn stimulus(&self, device_name: &str) -> Option<&Stimulus> {
        self.stimuli.get(device_name)
    }

    pub fn background(&self, device_name: &str) -> Option<&Background> {
        self.backgrounds.get(device_name)
    }

    pub fn background_devices(&self) -> impl Iterator<Item = &String> {
        self.backgrounds.keys()
    }

    /// The epoch's duration: the common duration of its finite stimuli, or
    /// `None` if the epoch is indefinite (no stimulus declares a duration).
    pub fn duration(&self) -> Option<Duration> {
        self.stimuli.values().filter_map(|s| s.duration()).max()
    }

    /// Validates the stored stimuli/responses per §4.G / §3:
    /// - mixed finite/indefinite stimuli with differing finite durations is rejected;
    /// - an indefinite epoch (no finite stimulus) may not register any responses;
    /// - an epoch with no stimuli and no responses is rejected.
    pub fn validate(&self) -> AppResult<()> {
        if self.stimuli.is_empty() && self.responses.is_empty() {
            return Err(DaqError::EpochValidation(
                "epoch has neither stimuli nor responses".into(),
            ));
        }

        let finite_durations: HashSet<_> = self
            .stimuli
            .values()
            .filter_map(|s| s.duration())
            .map(|d| d.as_nanos())
            .collect();
        if finite_durations.len() > 1 {
            return Err(DaqError::EpochValidation(format!(
                "epoch has finite stimuli of differing durations: {finite_durations:?}"
            )));
        }

        let is_indefinite = !self.stimuli.is_empty() && finite_durations.is_empty();
        if is_indefinite && !self.responses.is_empty() {
            return Err(DaqError::EpochValidation(
                "an indefinite epoch may not register any responses".into(),
            ));
        }

        Ok(())
    }

    /// Returns whether the epoch is indefinite (has at least one stimulus,
    /// none of which declare a duration).
    pub fn is_indefinite(&self) -> bool {
        !self.stimuli.is_empty() && self.stimuli.values().all(|s| s.duration().is_none())
    }

    /// Draws output for `device_name` from its registered stimulus; once the
    /// stimulus is exhausted but the epoch is not complete, pads with the
    /// device's background until the requested duration is produced. Fails
    /// with `ArgumentError` if the device is unknown to this epoch.
    pub fn pull_output_data(&mut self, device_name: &str, duration: Duration) -> AppResult<OutputData> {
        let name = device_name;
        let has_stimulus = self.stimuli.contains_key(name);
        let has_background = self.backgrounds.contains_key(name);
        if !has_stimulus && !has_background {
            return Err(DaqError::ArgumentError(format!(
                "device '{name}' is not known to this epoch"
            )));
        }

        if let Some(stimulus) = self.stimuli.get_mut(name) {
            if let Some(block) = stimulus.pull_block(duration)? {
                if block.duration() >= duration || block.is_last() {
                    return Ok(block);
                }
                // stimulus ran out mid-block: pad the remainder with background.
                let remaining = duration.saturating_sub(block.duration());
                if let Some(background) = self.backgrounds.get(name) {
                    let pad = background_block(background, remaining)?;
                    return block.concat(&pad);
                }
                return Ok(block);
            }
        }

        let background = self
            .backgrounds
            .get(name)
            .ok_or_else(|| DaqError::ArgumentError(format!("device '{name}' has no stimulus and no background")))?;
        background_block(background, duration)
    }

    /// Forwards a delivered-output notification to the registered stimulus,
    /// only while the epoch has not yet completed.
    pub fn did_output_data(
        &mut self,
        device_name: &str,
        duration: Duration,
        nodes: Vec<PipelineNodeConfiguration>,
    ) -> AppResult<()> {
        if self.is_complete() {
            return Ok(());
        }
        if let Some(stimulus) = self.stimuli.get_mut(device_name) {
            stimulus.did_output_data(duration, nodes.clone());
        }
        self.output_accumulators
            .entry(device_name.to_string())
            .or_default()
            .push((duration, nodes));
        Ok(())
    }

    /// Routes an input block into the named device's response, truncating
    /// at the epoch boundary if the block would extend past it.
    pub fn push_input_data(&mut self, device_name: &str, block: crate::sample::InputData) -> AppResult<()> {
        let response = self
            .responses
            .get_mut(device_name)
            .ok_or_else(|| DaqError::ArgumentError(format!("device '{device_name}' has no registered response")))?;

        let Some(epoch_duration) = self.duration() else {
            response.append_data(block)?;
            return Ok(());
        };

        let already = response.duration();
        if already >= epoch_duration {
            return Ok(());
        }
        let remaining = epoch_duration - already;
        if block.duration() <= remaining {
            response.append_data(block)?;
        } else {
            let (head, _tail) = block.split(remaining);
            if !head.is_empty() {
                response.append_data(head)?;
            }
        }
        Ok(())
    }

    /// Completion is `response.duration >= epoch.duration` for every
    /// registered response (an indefinite epoch, which carries no
    /// responses, is never "complete" via this check and relies on external
    /// cancellation).
    pub fn is_complete(&self) -> bool {
        let Some(epoch_duration) = self.duration() else {
            return false;
        };
        if self.responses.is_empty() {
            return false;
        }
        self.responses.values().all(|r| r.duration() >= epoch_duration)
    }
}

fn background_block(background: &Background, duration: Duration) -> AppResult<OutputData> {
    let count = crate::sample::samples_for_duration(duration, background.sample_rate.value_in_base_units());
    let samples = vec![background.value.clone(); count];
    OutputData::new(samples, background.sample_rate.clone(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate() -> Measurement {
        Measurement::new(1000.0, 0, "Hz").unwrap()
    }

    #[test]
    fn rejects_epoch_with_no_stimuli_and_no_responses() {
        let epoch = Epoch::new("proto-1");
        assert!(epoch.validate().is_err());
    }

    #[test]
    fn rejects_indefinite_epoch_with_responses() {
        let mut epoch = Epoch::new("proto-1");
        epoch.register_stimulus(
            "dev-a",
            Stimulus::repeating(
                "s1",
                "V",
                OutputData::new(vec![Measurement::new(1.0, 0, "V").unwrap()], rate(), false).unwrap(),
                None,
            ),
        );
        epoch.register_response("dev-a");
        let err = epoch.validate().unwrap_err();
        assert!(matches!(err, DaqError::EpochValidation(_)));
    }

    #[test]
    fn rejects_mismatched_finite_durations() {
        let mut epoch = Epoch::new("proto-1");
        epoch.register_stimulus(
            "dev-a",
            Stimulus::rendered(
                "s1",
                "V",
                OutputData::new(vec![Measurement::new(1.0, 0, "V").unwrap(); 10], rate(), true).unwrap(),
            ),
        );
        epoch.register_stimulus(
            "dev-b",
            Stimulus::rendered(
                "s2",
                "V",
                OutputData::new(vec![Measurement::new(1.0, 0, "V").unwrap(); 20], rate(), true).unwrap(),
            ),
        );
        assert!(epoch.validate().is_err());
    }

    #[test]
    fn start_time_assignable_once() {
        let mut epoch = Epoch::new("proto-1");
        epoch.set_start_time(Utc::now()).unwrap();
        assert!(epoch.set_start_time(Utc::now()).is_err());
    }

    #[test]
    fn pull_output_data_falls_back_to_background_when_no_stimulus() {
        let mut epoch = Epoch::new("proto-1");
        epoch.register_background(
            "dev-a",
            Background {
                value: Measurement::new(2.5, 0, "V").unwrap(),
                sample_rate: rate(),
            },
        );
        let block = epoch.pull_output_data("dev-a", Duration::from_millis(100)).unwrap();
        assert!(block.samples().iter().all(|s| (s.value_in_base_units() - 2.5).abs() < 1e-9));
    }

    #[test]
    fn pull_output_data_rejects_unknown_device() {
        let mut epoch = Epoch::new("proto-1");
        let err = epoch
            .pull_output_data("unknown", Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, DaqError::ArgumentError(_)));
    }
}
