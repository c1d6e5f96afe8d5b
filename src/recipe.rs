mod model;
mod persist;
mod store;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tracker::ExtractorConfig;

pub use model::{
    DESCRIPTOR_BYTES, Descriptor, DescriptorSet, Keypoint, QualityMetrics, Recipe, RecipeId,
    RecipeSummary, ReferenceSize,
};
pub use store::RecipeStore;

/// Parameters applied when a region of interest is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Fewer keypoints than this fails registration
    pub min_keypoints: usize,
    pub extractor: ExtractorConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            min_keypoints: 10,
            extractor: ExtractorConfig::default(),
        }
    }
}

impl RegistrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_keypoints < 4 {
            return Err(ConfigError::invalid(
                "registration.min_keypoints",
                "at least 4 keypoints are needed to locate a recipe",
            ));
        }
        self.extractor.validate()
    }
}
