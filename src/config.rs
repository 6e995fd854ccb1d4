//! Acquisition configuration.
//!
//! Loads the small set of knobs that govern pipeline timing and channel
//! sizing from a TOML file with environment-variable overrides, using the
//! `config` crate the way the rest of this family of tools does.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the acquisition pipeline.
///
/// These are deliberately few: the pipeline's correctness does not depend on
/// them, only its pacing and resource usage do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Duration of one DAQ controller iteration (§4.H "process interval").
    /// A common value is 500 ms.
    #[serde(with = "humantime_serde")]
    pub process_interval: Duration,

    /// Bound used for event-feed and command channels between the
    /// acquisition controller and the DAQ controller base.
    pub channel_capacity: usize,

    /// Staleness window for asynchronous device parameter history (§4.E):
    /// snapshots older than this, but for which a newer snapshot exists,
    /// are evicted.
    #[serde(with = "humantime_serde")]
    pub parameter_staleness: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            process_interval: Duration::from_millis(500),
            channel_capacity: 64,
            parameter_staleness: Duration::from_secs(5),
        }
    }
}

impl AcquisitionConfig {
    /// Load configuration from an optional TOML file, overlaid with
    /// `DAQ_*` environment variables, falling back to [`AcquisitionConfig::default`]
    /// when neither a file nor environment overrides are present.
    pub fn load(path: Option<&str>) -> AppResult<Self> {
        let mut builder = config::Config::builder()
            .set_default("process_interval", "500ms")
            .map_err(DaqError::Config)?
            .set_default("channel_capacity", 64i64)
            .map_err(DaqError::Config)?
            .set_default("parameter_staleness", "5s")
            .map_err(DaqError::Config)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("DAQ"));

        let settings = builder.build().map_err(DaqError::Config)?;
        settings
            .try_deserialize()
            .map_err(DaqError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_process_interval_is_500ms() {
        let cfg = AcquisitionConfig::default();
        assert_eq!(cfg.process_interval, Duration::from_millis(500));
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let cfg = AcquisitionConfig::load(None).expect("load should not fail");
        assert_eq!(cfg.process_interval, Duration::from_millis(500));
        assert_eq!(cfg.channel_capacity, 64);
    }
}
