//! DAQ controller base (§4.H): the hardware-abstract iteration loop. Pulls
//! output per stream, invokes the hardware (or a simulator), and pushes
//! input, cycling through `Idle -> Starting -> Running -> Stopping -> Idle`
//! (plus `ExceptionalStop`).

pub mod simulated;

use crate::clock::Clock;
use crate::device::ExternalDevice;
use crate::error::{AppResult, DaqError};
use crate::event::{Event, EventBus};
use crate::sample::{ConfigurationSpan, InputData, OutputData};
use crate::stream::{DaqStream, StreamDirection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The callback the iteration loop uses to reach back into the trial
/// scheduler that owns the current epoch (§9: devices and streams hold
/// non-owning references; the controller is the sole owner of epoch state).
pub trait EpochSource: Send {
    fn pull_output_data(&mut self, device_name: &str, duration: Duration) -> AppResult<Option<OutputData>>;
    fn push_input_data(&mut self, device_name: &str, block: InputData) -> AppResult<()>;
    fn did_output_data(
        &mut self,
        device_name: &str,
        time: DateTime<Utc>,
        duration: Duration,
        config_span: ConfigurationSpan,
    ) -> AppResult<()>;
    /// Whether the iteration loop should stop at the next boundary: the
    /// current epoch has completed or a cancellation was requested.
    fn should_stop(&self) -> bool;
}

/// The hardware-drive capability consumed once per iteration (§6).
#[async_trait]
pub trait HardwareDrive: Send {
    /// Consumes all output blocks, returns acquired input blocks of
    /// approximately `interval` duration, and the deficit: how much longer
    /// than `interval` the call actually took.
    async fn drive(
        &mut self,
        outputs: HashMap<String, OutputData>,
        interval: Duration,
    ) -> AppResult<(HashMap<String, InputData>, Duration)>;

    /// Whether this hardware back-end honours a triggered start. Simulated
    /// controllers must reject it with `DAQError` (§9 open question).
    fn supports_triggered_start(&self) -> bool {
        false
    }

    /// Best-effort: push every stream's background value to hardware.
    async fn set_streams_background(&mut self, backgrounds: HashMap<String, OutputData>) -> AppResult<()>;
}

/// The controller's lifecycle state (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Starting,
    Running,
    Stopping,
    ExceptionalStop,
}

/// The hardware-abstract iteration engine. Owns the stream/device graph and
/// the injected hardware-drive capability; does not own epoch state, which
/// it reaches via an [`EpochSource`] handed to each call.
pub struct DaqController<D: HardwareDrive> {
    streams: HashMap<String, DaqStream>,
    devices: HashMap<String, ExternalDevice>,
    hardware: D,
    process_interval: Duration,
    state: ControllerState,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl<D: HardwareDrive> DaqController<D> {
    pub fn new(hardware: D, process_interval: Duration, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            streams: HashMap::new(),
            devices: HashMap::new(),
            hardware,
            process_interval,
            state: ControllerState::Idle,
            clock,
            events,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn add_stream(&mut self, stream: DaqStream) {
        self.streams.insert(stream.name().to_string(), stream);
    }

    /// Fails with `InvalidOperation` on a duplicate device name (§4.I).
    pub fn add_device(&mut self, device: ExternalDevice) -> AppResult<()> {
        if self.devices.contains_key(device.name()) {
            return Err(DaqError::InvalidOperation(format!(
                "device '{}' already exists on this controller",
                device.name()
            )));
        }
        self.devices.insert(device.name().to_string(), device);
        Ok(())
    }

    pub fn stream(&self, name: &str) -> Option<&DaqStream> {
        self.streams.get(name)
    }

    pub fn device(&self, name: &str) -> Option<&ExternalDevice> {
        self.devices.get(name)
    }

    pub fn devices(&self) -> &HashMap<String, ExternalDevice> {
        &self.devices
    }

    pub fn streams(&self) -> &HashMap<String, DaqStream> {
        &self.streams
    }

    /// Starts the controller. `triggered` requests hardware-triggered
    /// acquisition start; rejected with `DAQError` unless the hardware
    /// reports support for it.
    pub fn start(&mut self, triggered: bool) -> AppResult<()> {
        if triggered && !self.hardware.supports_triggered_start() {
            return Err(DaqError::DAQError(
                "hardware drive does not support triggered start".into(),
            ));
        }
        self.state = ControllerState::Starting;
        for stream in self.streams.values_mut() {
            stream.reset();
        }
        self.state = ControllerState::Running;
        self.events.publish(Event::Started { at: self.clock.now() });
        info!("DAQ controller started (triggered = {triggered})");
        Ok(())
    }

    /// Runs iterations until `source.should_stop()` reports true or an
    /// output stream pull fails, at which point the controller transitions
    /// to `Stopping`/`ExceptionalStop` and fires the corresponding event.
    pub async fn run_until_stopped(&mut self, source: &mut dyn EpochSource) -> AppResult<()> {
        loop {
            match self.run_iteration(source).await {
                Ok(()) => {
                    if source.should_stop() {
                        self.stop(source).await?;
                        return Ok(());
                    }
                }
                Err(err) => {
                    self.exceptional_stop(source, &err).await;
                    return Err(err);
                }
            }
        }
    }

    /// One iteration: pull per active output stream, drive the hardware,
    /// push each returned input block, fire `StimulusOutput` per delivered
    /// block, and fire `ProcessIteration`.
    async fn run_iteration(&mut self, source: &mut dyn EpochSource) -> AppResult<()> {
        let mut outputs = HashMap::new();
        let mut delivered_spans: Vec<(String, DateTime<Utc>, Duration, ConfigurationSpan)> = Vec::new();

        for (name, stream) in self.streams.iter_mut() {
            if stream.direction() != StreamDirection::Output || !stream.active() || !stream.has_more_data() {
                continue;
            }
            let Some(device_name) = stream.bound_device().map(str::to_string) else {
                continue;
            };
            let Some(device) = self.devices.get(&device_name) else {
                continue;
            };
            let block = device.pull_output_data(self.process_interval, source)?;
            let block = stream.accept_output(block)?;
            let time = self.clock.now();
            let span = block.configuration_span();
            delivered_spans.push((name.clone(), time, block.duration(), span));
            outputs.insert(name.clone(), block);
        }

        let (inputs, deficit) = self.hardware.drive(outputs, self.process_interval).await?;

        for (stream_name, block) in inputs {
            if let Some(stream) = self.streams.get(&stream_name) {
                stream.push_input_data(block, &mut self.devices, source)?;
            }
        }

        for (stream_name, time, duration, span) in delivered_spans {
            self.events.publish(Event::StimulusOutput {
                at: time,
                stream: stream_name.clone(),
                spans: vec![span.clone()],
            });
            let device_name = self.streams.get(&stream_name).and_then(|s| s.bound_device()).map(str::to_string);
            if let Some(device_name) = device_name {
                if let Some(device) = self.devices.get_mut(&device_name) {
                    let stream = self.streams.get(&stream_name).expect("stream exists");
                    stream.did_output_data(device, time, duration, span, source)?;
                }
            }
        }

        let interval = self.process_interval;
        self.events.publish(Event::ProcessIteration {
            at: self.clock.now(),
            deficit: deficit.saturating_sub(interval),
        });
        debug!("iteration complete, deficit = {deficit:?}");
        Ok(())
    }

    async fn stop(&mut self, _source: &mut dyn EpochSource) -> AppResult<()> {
        self.state = ControllerState::Stopping;
        let _ = self.set_streams_background_best_effort().await;
        self.state = ControllerState::Idle;
        self.events.publish(Event::Stopped { at: self.clock.now() });
        Ok(())
    }

    async fn exceptional_stop(&mut self, _source: &mut dyn EpochSource, err: &DaqError) {
        self.state = ControllerState::ExceptionalStop;
        let _ = self.set_streams_background_best_effort().await;
        self.events.publish(Event::ExceptionalStop {
            at: self.clock.now(),
            reason: err.to_string(),
        });
        warn!("DAQ controller entered ExceptionalStop: {err}");
    }

    async fn set_streams_background_best_effort(&mut self) -> AppResult<()> {
        let mut backgrounds = HashMap::new();
        for (name, stream) in &self.streams {
            if stream.direction() != StreamDirection::Output {
                continue;
            }
            let Some(sample_rate) = stream.sample_rate() else { continue };
            let Some(device_name) = stream.bound_device() else { continue };
            let Some(device) = self.devices.get(device_name) else { continue };
            let background = device.background();
            let count = crate::sample::samples_for_duration(self.process_interval, sample_rate.value_in_base_units());
            if let Ok(block) = OutputData::new(vec![background.clone(); count], sample_rate.clone(), false) {
                backgrounds.insert(name.clone(), block);
            }
        }
        self.hardware.set_streams_background(backgrounds).await
    }
}
