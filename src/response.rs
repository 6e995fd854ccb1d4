//! Response (§4.F): an ordered-by-`inputTime` accumulator of input-data
//! blocks for one device.

use crate::error::{AppResult, DaqError};
use crate::sample::InputData;
use std::time::Duration;

/// Accumulates [`InputData`] blocks for one device across an epoch, kept
/// sorted by `input_time` as they arrive (delivery order is not guaranteed).
#[derive(Debug, Default)]
pub struct Response {
    segments: Vec<InputData>,
}

impl Response {
    pub fn new() -> Self {
        Self { segments: Vec::new() }
    }

    /// Inserts a block into the ordered-by-`input_time` sequence. All
    /// segments must share a base unit with the first segment appended.
    pub fn append_data(&mut self, block: InputData) -> AppResult<()> {
        if let Some(first) = self.segments.first() {
            if !first
                .samples()
                .first()
                .zip(block.samples().first())
                .map(|(a, b)| a.is_unit_compatible(b))
                .unwrap_or(true)
            {
                return Err(DaqError::MeasurementIncompatibility {
                    expected: first.samples().first().map(|m| m.base_unit().to_string()).unwrap_or_default(),
                    actual: block.samples().first().map(|m| m.base_unit().to_string()).unwrap_or_default(),
                });
            }
        }
        let position = self
            .segments
            .binary_search_by_key(&block.input_time(), |s| s.input_time())
            .unwrap_or_else(|insert_at| insert_at);
        self.segments.insert(position, block);
        Ok(())
    }

    /// The concatenated sample list across all segments, in `input_time` order.
    pub fn samples(&self) -> Vec<crate::measurement::Measurement> {
        self.segments.iter().flat_map(|s| s.samples().iter().cloned()).collect()
    }

    /// The segments, in `input_time` order, as appended.
    pub fn segments(&self) -> &[InputData] {
        &self.segments
    }

    /// Total duration: the sum of every segment's duration.
    pub fn duration(&self) -> Duration {
        self.segments.iter().map(|s| s.duration()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Measurement;
    use chrono::Utc;

    fn block(t_offset_ms: i64, samples: usize) -> InputData {
        let t0 = Utc::now() + chrono::Duration::milliseconds(t_offset_ms);
        InputData::new(
            (0..samples).map(|i| Measurement::new(i as f64, 0, "V").unwrap()).collect(),
            Measurement::new(1000.0, 0, "Hz").unwrap(),
            false,
            t0,
        )
        .unwrap()
    }

    #[test]
    fn append_data_sorts_by_input_time_regardless_of_arrival_order() {
        let mut response = Response::new();
        response.append_data(block(100, 10)).unwrap();
        response.append_data(block(0, 10)).unwrap();
        response.append_data(block(200, 10)).unwrap();

        let times: Vec<_> = response.segments().iter().map(|s| s.input_time()).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    #[test]
    fn duration_is_sum_of_segments() {
        let mut response = Response::new();
        response.append_data(block(0, 500)).unwrap();
        response.append_data(block(500, 500)).unwrap();
        assert_eq!(response.duration(), Duration::from_millis(1000));
    }
}
