//! Aggregated configuration, loadable from JSON.
//!
//! Every section is optional in the file; missing fields keep their
//! defaults.
//!
//! ```json
//! {
//!   "tracker": { "detect_threshold": 0.6, "lost_frame_count": 8 },
//!   "registration": { "min_keypoints": 20 },
//!   "pipeline": { "frame_queue_capacity": 3 }
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::integration::PipelineConfig;
use crate::recipe::RegistrationConfig;
use crate::tracker::TrackerConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tracker: TrackerConfig,
    pub registration: RegistrationConfig,
    pub pipeline: PipelineConfig,
}

impl Settings {
    /// Parse and validate settings from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read, parse and validate the JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let settings = Self::from_json_str(&fs::read_to_string(path)?)?;
        debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracker.validate()?;
        self.registration.validate()?;
        self.pipeline.validate()
    }
}
