//! A loopback [`HardwareDrive`] for tests and simulated rigs (§9): every
//! output stream's block is routed straight to the identically-named input
//! stream, with no jitter and zero reported deficit. Triggered start is
//! rejected, per the open-question resolution that simulated controllers
//! must refuse it.

use super::HardwareDrive;
use crate::error::AppResult;
use crate::sample::{InputData, OutputData};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;

/// Maps an output stream name to the input stream it loops back to.
#[derive(Debug, Clone, Default)]
pub struct LoopbackWiring {
    pub output_to_input: HashMap<String, String>,
}

impl LoopbackWiring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(mut self, output_stream: impl Into<String>, input_stream: impl Into<String>) -> Self {
        self.output_to_input.insert(output_stream.into(), input_stream.into());
        self
    }
}

/// A [`HardwareDrive`] that echoes every output block back as input on its
/// wired counterpart stream, simulating a patched-through rig.
pub struct SimulatedHardwareDrive {
    wiring: LoopbackWiring,
}

impl SimulatedHardwareDrive {
    pub fn new(wiring: LoopbackWiring) -> Self {
        Self { wiring }
    }
}

#[async_trait]
impl HardwareDrive for SimulatedHardwareDrive {
    async fn drive(
        &mut self,
        outputs: HashMap<String, OutputData>,
        interval: Duration,
    ) -> AppResult<(HashMap<String, InputData>, Duration)> {
        let now = Utc::now();
        let mut inputs = HashMap::new();
        for (output_stream, block) in outputs {
            let Some(input_stream) = self.wiring.output_to_input.get(&output_stream) else {
                continue;
            };
            let looped = InputData::new(block.samples().to_vec(), block.sample_rate().clone(), block.is_last(), now)?;
            inputs.insert(input_stream.clone(), looped);
        }
        Ok((inputs, interval))
    }

    fn supports_triggered_start(&self) -> bool {
        false
    }

    async fn set_streams_background(&mut self, _backgrounds: HashMap<String, OutputData>) -> AppResult<()> {
        Ok(())
    }
}
