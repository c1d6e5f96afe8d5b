//! Single-object template tracking for live video.
//!
//! A registered template (a [`Recipe`]) is followed through a frame stream by a
//! state machine that arbitrates between feature-based re-detection
//! ([`FeatureMatcher`]) and cheap incremental correlation tracking
//! ([`FastTracker`]). [`TrackingPipeline`] runs capture and processing on
//! separate threads connected by bounded queues.

pub mod config;
pub mod error;
pub mod integration;
pub mod recipe;
pub mod tracker;

pub use config::Settings;
pub use error::{ConfigError, PipelineError, RecipeError, TrackLost};
pub use integration::{
    BoundedQueue, DropReason, FrameSource, PipelineBuilder, PipelineConfig, PipelineEvent,
    PipelineStats, SourceStatus, TrackingPipeline,
};
pub use recipe::{
    Descriptor, DescriptorSet, Keypoint, QualityMetrics, Recipe, RecipeId, RecipeStore,
    RecipeSummary, ReferenceSize, RegistrationConfig,
};
pub use tracker::{
    ExtractorConfig, FastTracker, FastTrackerConfig, FeatureMatcher, Frame, Health, Localizer,
    MatchResult, MatcherConfig, Point, ReacquireHandle, Rect, SearchScope, TrackSession,
    TrackState, TrackerConfig, TrackingResult, TrackingStateMachine,
};
