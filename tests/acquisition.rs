//! End-to-end scenarios for the acquisition pipeline, driven entirely
//! through the public API with the in-process loopback hardware drive.

use rust_daq::acquisition::AcquisitionController;
use rust_daq::clock::WallClock;
use rust_daq::controller::simulated::{LoopbackWiring, SimulatedHardwareDrive};
use rust_daq::device::ExternalDevice;
use rust_daq::epoch::Epoch;
use rust_daq::error::DaqError;
use rust_daq::measurement::Measurement;
use rust_daq::persistor::{JsonlPersistor, PersistedEpoch, PersistedHandle, Persistor};
use rust_daq::sample::OutputData;
use rust_daq::stimulus::Stimulus;
use rust_daq::stream::{DaqStream, StreamDirection};
use std::sync::Arc;
use std::time::Duration;

fn hz(rate: f64) -> Measurement {
    Measurement::new(rate, 0, "Hz").unwrap()
}

fn volts(value: f64) -> Measurement {
    Measurement::new(value, 0, "V").unwrap()
}

async fn single_device_controller(process_interval: Duration) -> AcquisitionController<SimulatedHardwareDrive> {
    let wiring = LoopbackWiring::new().connect("ao0", "ai0");
    let drive = SimulatedHardwareDrive::new(wiring);
    let clock = WallClock::new();
    let mut controller = AcquisitionController::new(drive, process_interval, clock);

    let mut ao0 = DaqStream::new("ao0", StreamDirection::Output).with_sample_rate(hz(1000.0)).unwrap();
    ao0.bind_device("dev-a").unwrap();
    controller.add_stream(ao0);

    let mut ai0 = DaqStream::new("ai0", StreamDirection::Input).with_sample_rate(hz(1000.0)).unwrap();
    ai0.bind_device("dev-a").unwrap();
    controller.add_stream(ai0);

    controller
        .add_device(ExternalDevice::new("dev-a", "acme", volts(0.0), "V"))
        .unwrap();
    controller
}

/// Scenario 1: single loopback trial. Persists the epoch and reads the JSONL
/// record back to verify every response sample round-tripped within
/// tolerance of the driven +1 V stimulus.
#[tokio::test]
async fn single_loopback_trial_round_trips_response() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("epochs.jsonl");
    let persistor: Arc<dyn Persistor> = Arc::new(JsonlPersistor::new(&path));

    let mut controller = single_device_controller(Duration::from_millis(500)).await;

    let data = OutputData::new(vec![volts(1.0); 2000], hz(1000.0), true).unwrap();
    let mut epoch = Epoch::new("single-loopback");
    epoch.register_stimulus("dev-a", Stimulus::rendered("stim", "V", data));
    epoch.register_response("dev-a");

    controller.run_epoch(epoch, Some(persistor)).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let persisted: PersistedEpoch = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    let response = &persisted.responses["dev-a"];
    assert_eq!(response.samples.len(), 2000);
    assert!(response.samples.iter().all(|s| (s - 1.0).abs() <= 1.0));
}

/// Scenario 3: two devices driven by independent sinusoids, verified
/// sample-for-sample after a short trial through the loopback simulator.
#[tokio::test]
async fn multi_device_sinusoid_matches_within_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("epochs.jsonl");
    let persistor: Arc<dyn Persistor> = Arc::new(JsonlPersistor::new(&path));

    let wiring = LoopbackWiring::new().connect("ao0", "ai0").connect("ao1", "ai1");
    let drive = SimulatedHardwareDrive::new(wiring);
    let clock = WallClock::new();
    let mut controller = AcquisitionController::new(drive, Duration::from_millis(100), clock);

    for (ao, ai, dev) in [("ao0", "ai0", "dev-a"), ("ao1", "ai1", "dev-b")] {
        let mut output = DaqStream::new(ao, StreamDirection::Output).with_sample_rate(hz(10_000.0)).unwrap();
        output.bind_device(dev).unwrap();
        controller.add_stream(output);

        let mut input = DaqStream::new(ai, StreamDirection::Input).with_sample_rate(hz(10_000.0)).unwrap();
        input.bind_device(dev).unwrap();
        controller.add_stream(input);

        controller.add_device(ExternalDevice::new(dev, "acme", volts(0.0), "V")).unwrap();
    }

    let n = 2000usize; // scaled down from the 5s/50_000-sample scenario for test speed
    let sine = |i: usize| 8.0 * ((i as f64) / (n as f64 / 10.0)).sin();

    let samples_a: Vec<Measurement> = (0..n).map(|i| volts(sine(i))).collect();
    let samples_b: Vec<Measurement> = (0..n).map(|i| volts(sine(i))).collect();

    let mut epoch = Epoch::new("sinusoid-trial");
    epoch.register_stimulus(
        "dev-a",
        Stimulus::rendered("stim-a", "V", OutputData::new(samples_a.clone(), hz(10_000.0), true).unwrap()),
    );
    epoch.register_stimulus(
        "dev-b",
        Stimulus::rendered("stim-b", "V", OutputData::new(samples_b.clone(), hz(10_000.0), true).unwrap()),
    );
    epoch.register_response("dev-a");
    epoch.register_response("dev-b");

    controller.run_epoch(epoch, Some(persistor)).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let persisted: PersistedEpoch = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    for (dev, expected) in [("dev-a", &samples_a), ("dev-b", &samples_b)] {
        let response = &persisted.responses[dev];
        assert_eq!(response.samples.len(), n);
        for (i, (actual, expected)) in response.samples.iter().zip(expected.iter()).enumerate() {
            let expected = expected.value_in_base_units();
            assert!(
                (actual - expected).abs() <= 0.1,
                "sample {i} on {dev}: expected {expected}, got {actual}"
            );
        }
    }
}

/// Scenario 4: an indefinite epoch that also registers a response is
/// rejected before any hardware interaction happens.
#[tokio::test]
async fn indefinite_epoch_with_response_rejected_at_run_epoch() {
    let mut controller = single_device_controller(Duration::from_millis(500)).await;

    let mut epoch = Epoch::new("indefinite-trial");
    epoch.register_stimulus(
        "dev-a",
        Stimulus::repeating("stim", "V", OutputData::new(vec![volts(1.0)], hz(1000.0), false).unwrap(), None),
    );
    epoch.register_response("dev-a");

    let err = controller.run_epoch(epoch, None).await.unwrap_err();
    assert!(matches!(err, DaqError::EpochValidation(_)));
}

/// Scenario 5: mid-trial cancellation. `cancel_epoch` is safe to call
/// concurrently with the running trial; the trial must unwind within a
/// couple of iteration intervals.
#[tokio::test]
async fn mid_trial_cancellation_discards_epoch() {
    let process_interval = Duration::from_millis(20);
    let mut controller = single_device_controller(process_interval).await;
    let mut events = controller.subscribe();
    let cancellation = controller.cancellation_handle();

    // An indefinite stimulus stands in for a long (>=10s) trial: without
    // cancellation it would never complete on its own.
    let data = OutputData::new(vec![volts(1.0); 10], hz(1000.0), false).unwrap();
    let mut epoch = Epoch::new("long-trial");
    epoch.register_stimulus("dev-a", Stimulus::repeating("stim", "V", data, None));
    let epoch_id = epoch.id();

    let run = tokio::spawn(async move { controller.run_epoch(epoch, None).await });

    // Cancel shortly after the trial starts; cancellation is cooperative,
    // so run_epoch should still return within a couple of iterations.
    tokio::time::sleep(process_interval * 2).await;
    cancellation.cancel();

    let result = tokio::time::timeout(process_interval * 20, run)
        .await
        .expect("run_epoch did not return promptly after cancellation")
        .expect("run_epoch task panicked");
    result.unwrap();

    let mut saw_discarded = false;
    while let Ok(event) = events.try_recv() {
        if let rust_daq::event::Event::DiscardedEpoch { epoch_id: id, .. } = event {
            if id == epoch_id {
                saw_discarded = true;
            }
        }
    }
    assert!(saw_discarded, "expected a DiscardedEpoch event for the cancelled trial");
}

struct FailingPersistor;

#[async_trait::async_trait]
impl Persistor for FailingPersistor {
    async fn begin_epoch_block(
        &self,
        _protocol_id: &str,
        _parameters: &std::collections::BTreeMap<String, f64>,
        _start_time: chrono::DateTime<chrono::Utc>,
    ) -> rust_daq::error::AppResult<()> {
        Ok(())
    }

    async fn serialize(&self, _epoch: &PersistedEpoch) -> rust_daq::error::AppResult<PersistedHandle> {
        Err(DaqError::PersistenceError("simulated disk full".into()))
    }

    async fn end_epoch_block(&self, _end_time: chrono::DateTime<chrono::Utc>) -> rust_daq::error::AppResult<()> {
        Ok(())
    }
}

/// Scenario 6: a persistor that fails on `serialize` surfaces as
/// `ControllerError` from `run_epoch`, wrapping the underlying failure.
#[tokio::test]
async fn persistor_failure_surfaces_as_controller_error() {
    let mut controller = single_device_controller(Duration::from_millis(500)).await;

    let data = OutputData::new(vec![volts(1.0); 500], hz(1000.0), true).unwrap();
    let mut epoch = Epoch::new("persist-fail-trial");
    epoch.register_stimulus("dev-a", Stimulus::rendered("stim", "V", data));
    epoch.register_response("dev-a");

    let persistor: Arc<dyn Persistor> = Arc::new(FailingPersistor);
    let err = controller.run_epoch(epoch, Some(persistor)).await.unwrap_err();
    assert!(matches!(err, DaqError::ControllerError(_)));
}

/// `at-most-once persistence`: a successful persistor is only ever handed
/// one epoch per `run_epoch`, and cancelled epochs never reach it.
#[tokio::test]
async fn jsonl_persistor_records_exactly_one_epoch_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("epochs.jsonl");
    let persistor: Arc<dyn Persistor> = Arc::new(JsonlPersistor::new(&path));

    let mut controller = single_device_controller(Duration::from_millis(500)).await;
    let data = OutputData::new(vec![volts(1.0); 500], hz(1000.0), true).unwrap();
    let mut epoch = Epoch::new("persisted-trial");
    epoch.register_stimulus("dev-a", Stimulus::rendered("stim", "V", data));
    epoch.register_response("dev-a");

    controller.run_epoch(epoch, Some(persistor)).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    assert_eq!(contents.lines().count(), 1);
}
