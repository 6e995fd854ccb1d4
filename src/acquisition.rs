//! Acquisition controller (§4.I): the trial scheduler. Owns the current
//! epoch and a FIFO of pending epochs, coordinates persistence, and exposes
//! the pipeline's lifecycle events.

use crate::clock::Clock;
use crate::controller::{DaqController, EpochSource, HardwareDrive};
use crate::device::ExternalDevice;
use crate::epoch::Epoch;
use crate::error::{AppResult, DaqError};
use crate::event::{Event, EventBus};
use crate::persistor::{persisted_epoch_from, Persistor};
use crate::sample::{ConfigurationSpan, InputData, OutputData};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The epoch-scheduling half of the controller (§4.I state): current epoch,
/// pending queue, cancellation flag. Kept as its own struct so the iteration
/// engine ([`DaqController`]) can borrow it disjointly from the
/// stream/device graph it owns (§9: owner is the controller, not a cycle of
/// back-references).
pub struct EpochState {
    current: Option<Epoch>,
    pending: VecDeque<Epoch>,
    cancel_requested: Arc<AtomicBool>,
}

impl EpochState {
    fn new() -> Self {
        Self {
            current: None,
            pending: VecDeque::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl EpochSource for EpochState {
    fn pull_output_data(&mut self, device_name: &str, duration: Duration) -> AppResult<Option<OutputData>> {
        match &mut self.current {
            Some(epoch) => Ok(Some(epoch.pull_output_data(device_name, duration)?)),
            None => Ok(None),
        }
    }

    fn push_input_data(&mut self, device_name: &str, block: InputData) -> AppResult<()> {
        match &mut self.current {
            Some(epoch) => epoch.push_input_data(device_name, block),
            None => Ok(()),
        }
    }

    fn did_output_data(
        &mut self,
        device_name: &str,
        _time: DateTime<Utc>,
        duration: Duration,
        config_span: ConfigurationSpan,
    ) -> AppResult<()> {
        match &mut self.current {
            Some(epoch) => epoch.did_output_data(device_name, duration, config_span.nodes),
            None => Ok(()),
        }
    }

    fn should_stop(&self) -> bool {
        if self.cancel_requested.load(Ordering::SeqCst) {
            return true;
        }
        match &self.current {
            Some(epoch) => epoch.is_complete(),
            None => true,
        }
    }
}

/// A cloneable handle that can cancel whichever epoch is current at the
/// moment `cancel()` runs, independent of the controller's own borrow.
#[derive(Debug, Clone)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Tracks, per device, which streams it must be bound to for `enqueue_epoch`
/// validation (§4.I: stimulus devices need an output binding, response
/// devices need an input binding).
#[derive(Debug, Default, Clone)]
pub struct DeviceBindings {
    pub has_output_binding: bool,
    pub has_input_binding: bool,
}

/// The trial scheduler (§4.I). Generic over the hardware-drive
/// implementation its embedded [`DaqController`] uses.
pub struct AcquisitionController<D: HardwareDrive> {
    daq: DaqController<D>,
    epoch_state: EpochState,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl<D: HardwareDrive> AcquisitionController<D> {
    pub fn new(hardware: D, process_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::new(256);
        let daq = DaqController::new(hardware, process_interval, clock.clone(), events.clone());
        Self {
            daq,
            epoch_state: EpochState::new(),
            events,
            clock,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// A cloneable, thread-safe handle that can request cancellation of
    /// whatever epoch is current when `cancel()` is eventually called, even
    /// from a task spawned before `run_epoch` starts.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle(self.epoch_state.cancel_requested.clone())
    }

    pub fn add_stream(&mut self, stream: crate::stream::DaqStream) {
        self.daq.add_stream(stream);
    }

    pub fn add_device(&mut self, device: ExternalDevice) -> AppResult<()> {
        self.daq.add_device(device)
    }

    fn bindings_for(&self, device_name: &str) -> DeviceBindings {
        let mut bindings = DeviceBindings::default();
        for stream in self.daq.streams().values() {
            let bound = stream.bound_device() == Some(device_name)
                || stream
                    .digital_bindings()
                    .map(|m| m.contains_key(device_name))
                    .unwrap_or(false);
            if !bound {
                continue;
            }
            match stream.direction() {
                crate::stream::StreamDirection::Output => bindings.has_output_binding = true,
                crate::stream::StreamDirection::Input => bindings.has_input_binding = true,
            }
        }
        bindings
    }

    /// Validates the epoch against bound devices, then appends it to the
    /// pending queue.
    pub fn enqueue_epoch(&mut self, epoch: Epoch) -> AppResult<()> {
        epoch.validate()?;

        for device_name in epoch.stimulus_devices() {
            if self.daq.device(device_name).is_none() {
                return Err(DaqError::EpochValidation(format!(
                    "stimulus device '{device_name}' is not known to this controller"
                )));
            }
            if !self.bindings_for(device_name).has_output_binding {
                return Err(DaqError::EpochValidation(format!(
                    "stimulus device '{device_name}' is not bound to any output stream"
                )));
            }
        }
        for device_name in epoch.response_devices() {
            if self.daq.device(device_name).is_none() {
                return Err(DaqError::EpochValidation(format!(
                    "response device '{device_name}' is not known to this controller"
                )));
            }
            if !self.bindings_for(device_name).has_input_binding {
                return Err(DaqError::EpochValidation(format!(
                    "response device '{device_name}' is not bound to any input stream"
                )));
            }
        }

        self.epoch_state.pending.push_back(epoch);
        Ok(())
    }

    /// Dequeues the head of the pending queue and makes it current. Fails
    /// with `ControllerError` if the queue is empty or an epoch is already
    /// current.
    pub fn next_epoch(&mut self) -> AppResult<()> {
        if self.epoch_state.current.is_some() {
            return Err(DaqError::ControllerError(
                "an epoch is already current; cannot advance".into(),
            ));
        }
        let epoch = self
            .epoch_state
            .pending
            .pop_front()
            .ok_or_else(|| DaqError::ControllerError("no pending epoch to advance to".into()))?;
        let epoch_id = epoch.id();
        self.epoch_state.current = Some(epoch);
        self.epoch_state.cancel_requested.store(false, Ordering::SeqCst);
        self.events.publish(Event::NextEpochRequested {
            at: self.clock.now(),
            epoch_id,
        });
        Ok(())
    }

    /// Safe from any thread; takes effect at the next iteration boundary.
    pub fn cancel_epoch(&self) {
        self.epoch_state.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Enqueues, advances, starts the DAQ controller, blocks cooperatively
    /// until the epoch completes or is cancelled, stops the DAQ controller,
    /// and hands the epoch to the persistor on a separate task. The only
    /// entry point that may fail mid-trial.
    pub async fn run_epoch(&mut self, epoch: Epoch, persistor: Option<Arc<dyn Persistor>>) -> AppResult<()> {
        self.enqueue_epoch(epoch)?;
        self.next_epoch()?;

        let start_time = self.clock.now();
        if let Some(current) = &mut self.epoch_state.current {
            current.set_start_time(start_time)?;
        }

        self.daq.start(false)?;
        self.daq.run_until_stopped(&mut self.epoch_state).await?;

        let cancelled = self.epoch_state.cancel_requested.load(Ordering::SeqCst);
        let Some(completed) = self.epoch_state.current.take() else {
            return Err(DaqError::ControllerError("epoch vanished before completion".into()));
        };
        let epoch_id = completed.id();

        if cancelled {
            self.events.publish(Event::DiscardedEpoch {
                at: self.clock.now(),
                epoch_id,
            });
            return Ok(());
        }

        if let Some(persistor) = persistor {
            let end_time = self.clock.now();
            let record = persisted_epoch_from(&completed, end_time);
            let task = tokio::spawn(async move {
                persistor
                    .begin_epoch_block(&record.protocol_id, &record.parameters, record.start_time)
                    .await?;
                persistor.serialize(&record).await?;
                persistor.end_epoch_block(end_time).await
            });
            match task.await {
                Ok(Ok(())) => {
                    self.events.publish(Event::SavedEpoch {
                        at: self.clock.now(),
                        epoch_id,
                    });
                }
                Ok(Err(persist_err)) => {
                    return Err(DaqError::ControllerError(format!(
                        "persistor task failed: {persist_err}"
                    )));
                }
                Err(join_err) => return Err(DaqError::from(join_err)),
            }
        } else {
            self.events.publish(Event::SavedEpoch {
                at: self.clock.now(),
                epoch_id,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::simulated::{LoopbackWiring, SimulatedHardwareDrive};
    use crate::epoch::Background;
    use crate::measurement::Measurement;
    use crate::sample::OutputData;
    use crate::stimulus::Stimulus;
    use crate::stream::{DaqStream, StreamDirection};

    fn rate() -> Measurement {
        Measurement::new(1000.0, 0, "Hz").unwrap()
    }

    async fn build_controller() -> AcquisitionController<SimulatedHardwareDrive> {
        let wiring = LoopbackWiring::new().connect("ao0", "ai0");
        let drive = SimulatedHardwareDrive::new(wiring);
        let clock = crate::clock::WallClock::new();
        let mut controller = AcquisitionController::new(drive, Duration::from_millis(100), clock);

        let mut ao0 = DaqStream::new("ao0", StreamDirection::Output).with_sample_rate(rate()).unwrap();
        ao0.bind_device("dev-a").unwrap();
        controller.add_stream(ao0);

        let mut ai0 = DaqStream::new("ai0", StreamDirection::Input).with_sample_rate(rate()).unwrap();
        ai0.bind_device("dev-a").unwrap();
        controller.add_stream(ai0);

        controller
            .add_device(ExternalDevice::new("dev-a", "acme", Measurement::new(0.0, 0, "V").unwrap(), "V"))
            .unwrap();
        controller
    }

    #[tokio::test]
    async fn single_loopback_trial_produces_full_response() {
        let mut controller = build_controller().await;

        let data = OutputData::new(vec![Measurement::new(1.0, 0, "V").unwrap(); 2000], rate(), true).unwrap();
        let mut epoch = Epoch::new("loopback-trial");
        epoch.register_stimulus("dev-a", Stimulus::rendered("stim-1", "V", data));
        epoch.register_response("dev-a");

        controller.run_epoch(epoch, None).await.unwrap();
    }

    #[tokio::test]
    async fn indefinite_epoch_with_response_is_rejected() {
        let mut controller = build_controller().await;

        let mut epoch = Epoch::new("bad-trial");
        epoch.register_stimulus(
            "dev-a",
            Stimulus::repeating(
                "stim-1",
                "V",
                OutputData::new(vec![Measurement::new(1.0, 0, "V").unwrap()], rate(), false).unwrap(),
                None,
            ),
        );
        epoch.register_response("dev-a");

        let err = controller.run_epoch(epoch, None).await.unwrap_err();
        assert!(matches!(err, DaqError::EpochValidation(_)));
    }

    #[tokio::test]
    async fn enqueue_rejects_unbound_stimulus_device() {
        let mut controller = build_controller().await;
        let mut epoch = Epoch::new("trial");
        epoch.register_stimulus(
            "unknown-device",
            Stimulus::rendered(
                "stim-1",
                "V",
                OutputData::new(vec![Measurement::new(1.0, 0, "V").unwrap(); 10], rate(), true).unwrap(),
            ),
        );
        epoch.register_background(
            "unknown-device",
            Background {
                value: Measurement::new(0.0, 0, "V").unwrap(),
                sample_rate: rate(),
            },
        );
        assert!(controller.enqueue_epoch(epoch).is_err());
    }

    #[tokio::test]
    async fn next_epoch_fails_on_empty_queue() {
        let mut controller = build_controller().await;
        assert!(controller.next_epoch().is_err());
    }
}
