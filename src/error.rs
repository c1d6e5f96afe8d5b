//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::recipe::RecipeId;

/// Failures of recipe registration and persistence.
///
/// These are returned synchronously to the caller of a [`RecipeStore`]
/// operation and never reach the vision flow.
///
/// [`RecipeStore`]: crate::recipe::RecipeStore
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("insufficient features: found {found} keypoints, at least {required} required")]
    InsufficientFeatures { found: usize, required: usize },

    #[error("a recipe named {0:?} already exists")]
    DuplicateName(String),

    #[error("recipe {0} not found")]
    NotFound(RecipeId),

    #[error("recipe {0} is already saved")]
    AlreadySaved(RecipeId),

    #[error("recipe name must not be empty")]
    InvalidName,

    #[error("corrupted recipe data at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("recipe storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("reference image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("recipe metadata is malformed: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Invalid configuration, detected before any session begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Why an incremental tracking step could not produce an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackLostReason {
    /// The tracker has no template yet.
    NotInitialized,
    /// The region collapsed to zero area.
    DegenerateRegion,
    /// The search window lies entirely outside the frame.
    OutOfFrame,
    /// The correlation peak is too weak to trust.
    WeakResponse,
}

/// Transient vision failure. Handled by state transitions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("track lost: {reason:?}")]
pub struct TrackLost {
    pub reason: TrackLostReason,
}

impl From<TrackLostReason> for TrackLost {
    fn from(reason: TrackLostReason) -> Self {
        Self { reason }
    }
}

/// Errors surfaced by the pipeline's command interface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline processing thread is no longer running")]
    Disconnected,
}
