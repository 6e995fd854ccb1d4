//! Stimulus (§4.F): a lazy output-sample producer with three variants —
//! rendered, repeating-rendered, and delegated.

use crate::error::{AppResult, DaqError};
use crate::measurement::Measurement;
use crate::sample::{ConfigurationSpan, OutputData, PipelineNodeConfiguration};
use std::sync::Arc;
use std::time::Duration;

/// A block-producing function for a delegated stimulus: given the stimulus's
/// parameter map and a requested block duration, produces the next block.
pub type BlockProducer = Arc<dyn Fn(&std::collections::BTreeMap<String, f64>, Duration) -> AppResult<OutputData> + Send + Sync>;

/// A duration-query function for a delegated stimulus.
pub type DurationQuery = Arc<dyn Fn(&std::collections::BTreeMap<String, f64>) -> Option<Duration> + Send + Sync>;

enum Source {
    /// A fully materialised sample buffer with a finite duration.
    Rendered { data: OutputData },
    /// The same buffer played indefinitely or a fixed number of times.
    Repeating { data: OutputData, repeat_count: Option<u32> },
    /// User-supplied block-producer and duration-query functions.
    Delegated { produce: BlockProducer, duration: DurationQuery },
}

/// A polymorphic output-sample producer (§4.F), tagged sum rather than a
/// class hierarchy per the variant-over-subclassing design note.
pub struct Stimulus {
    id: String,
    output_unit: String,
    parameters: std::collections::BTreeMap<String, f64>,
    source: Source,
    output_spans: Vec<(Duration, Vec<PipelineNodeConfiguration>)>,
    cursor: usize,
    cycles_played: u32,
}

impl Stimulus {
    /// A rendered stimulus: finite, plays its buffer exactly once.
    pub fn rendered(id: impl Into<String>, output_unit: impl Into<String>, data: OutputData) -> Self {
        Self {
            id: id.into(),
            output_unit: output_unit.into(),
            parameters: Default::default(),
            source: Source::Rendered { data },
            output_spans: Vec::new(),
            cursor: 0,
            cycles_played: 0,
        }
    }

    /// A repeating-rendered stimulus. `repeat_count = None` means indefinite.
    pub fn repeating(
        id: impl Into<String>,
        output_unit: impl Into<String>,
        data: OutputData,
        repeat_count: Option<u32>,
    ) -> Self {
        Self {
            id: id.into(),
            output_unit: output_unit.into(),
            parameters: Default::default(),
            source: Source::Repeating { data, repeat_count },
            output_spans: Vec::new(),
            cursor: 0,
            cycles_played: 0,
        }
    }

    /// A delegated stimulus driven by user-supplied functions.
    pub fn delegated(
        id: impl Into<String>,
        output_unit: impl Into<String>,
        produce: BlockProducer,
        duration: DurationQuery,
    ) -> Self {
        Self {
            id: id.into(),
            output_unit: output_unit.into(),
            parameters: Default::default(),
            source: Source::Delegated { produce, duration },
            output_spans: Vec::new(),
            cursor: 0,
            cycles_played: 0,
        }
    }

    pub fn with_parameters(mut self, parameters: std::collections::BTreeMap<String, f64>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn output_unit(&self) -> &str {
        &self.output_unit
    }

    pub fn parameters(&self) -> &std::collections::BTreeMap<String, f64> {
        &self.parameters
    }

    /// The stimulus's sample rate, or `None` for a delegated stimulus, which
    /// has no single rate of its own until a block is actually produced.
    pub fn sample_rate(&self) -> Option<Measurement> {
        match &self.source {
            Source::Rendered { data } | Source::Repeating { data, .. } => Some(data.sample_rate().clone()),
            Source::Delegated { .. } => None,
        }
    }

    /// The stimulus's total duration, or `None` if indefinite.
    pub fn duration(&self) -> Option<Duration> {
        match &self.source {
            Source::Rendered { data } => Some(data.duration()),
            Source::Repeating { data, repeat_count } => {
                repeat_count.map(|n| data.duration().saturating_mul(n))
            }
            Source::Delegated { duration, .. } => duration(&self.parameters),
        }
    }

    /// Returns `true` once no further blocks remain (finite stimuli only).
    pub fn is_exhausted(&self) -> bool {
        match &self.source {
            Source::Rendered { data } => self.cursor >= data.len(),
            Source::Repeating { repeat_count: Some(n), .. } => self.cycles_played >= *n,
            Source::Repeating { repeat_count: None, .. } => false,
            // delegated exhaustion is caller-driven; see pull_block.
            Source::Delegated { .. } => false,
        }
    }

    /// Produces the next block of up to `block_duration`, on demand. For a
    /// rendered stimulus, the final block carries `isLast = true`. For a
    /// repeating stimulus, blocks cycle through the source data. For a
    /// delegated stimulus, unit drift in the produced block is rejected with
    /// `StimulusError`.
    pub fn pull_block(&mut self, block_duration: Duration) -> AppResult<Option<OutputData>> {
        match &self.source {
            Source::Rendered { data } => {
                if self.cursor >= data.len() {
                    return Ok(None);
                }
                let remaining = data.split(
                    crate::sample::duration_for_samples(self.cursor, data.sample_rate().value_in_base_units()),
                )
                .1;
                let (head, _rest) = remaining.split(block_duration);
                self.cursor += head.len();
                let is_last = self.cursor >= data.len();
                Ok(Some(OutputData::new(
                    head.samples().to_vec(),
                    head.sample_rate().clone(),
                    is_last,
                )?))
            }
            Source::Repeating { data, repeat_count } => {
                if let Some(n) = repeat_count {
                    if self.cycles_played >= *n {
                        return Ok(None);
                    }
                }
                let remaining = data
                    .split(crate::sample::duration_for_samples(
                        self.cursor,
                        data.sample_rate().value_in_base_units(),
                    ))
                    .1;
                let (head, _rest) = remaining.split(block_duration);
                self.cursor += head.len();
                if self.cursor >= data.len() {
                    self.cursor = 0;
                    self.cycles_played += 1;
                }
                let is_last = matches!(repeat_count, Some(n) if self.cycles_played >= *n);
                Ok(Some(OutputData::new(head.samples().to_vec(), head.sample_rate().clone(), is_last)?))
            }
            Source::Delegated { produce, .. } => {
                let block = produce(&self.parameters, block_duration)?;
                if block.sample_rate().base_unit() != "Hz" {
                    return Err(DaqError::StimulusError(format!(
                        "stimulus '{}': delegated block did not produce a Hz-rated sample rate",
                        self.id
                    )));
                }
                if let Some(first) = block.samples().first() {
                    if first.base_unit() != self.output_unit {
                        return Err(DaqError::StimulusError(format!(
                            "stimulus '{}': delegated block unit '{}' drifted from declared output unit '{}'",
                            self.id,
                            first.base_unit(),
                            self.output_unit
                        )));
                    }
                }
                Ok(Some(block))
            }
        }
    }

    /// Accumulates an output-configuration span in insertion order, with no
    /// reordering when duplicate durations appear.
    pub fn did_output_data(&mut self, duration: Duration, nodes: Vec<PipelineNodeConfiguration>) {
        self.output_spans.push((duration, nodes));
    }

    /// The accumulated output-configuration spans, in insertion order.
    pub fn output_configuration_spans(&self) -> Vec<ConfigurationSpan> {
        self.output_spans
            .iter()
            .map(|(d, nodes)| ConfigurationSpan::new(*d, nodes.clone()))
            .collect()
    }

    /// Whether this stimulus requests its rendered data be persisted
    /// alongside the epoch record (§4.J); only meaningful for rendered and
    /// repeating-rendered variants.
    pub fn rendered_data(&self) -> Option<&OutputData> {
        match &self.source {
            Source::Rendered { data } | Source::Repeating { data, .. } => Some(data),
            Source::Delegated { .. } => None,
        }
    }
}
