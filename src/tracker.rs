mod fast_tracker;
mod feature_matcher;
mod frame;
mod localizer;
mod motion;
mod rect;
mod session;
mod state_machine;
mod track_state;

pub mod features;
pub mod homography;
pub mod image;
pub mod matching;

pub use fast_tracker::{FastTracker, FastTrackerConfig};
pub use feature_matcher::{FeatureMatcher, MatcherConfig};
pub use features::{ExtractorConfig, FeatureExtractor};
pub use frame::Frame;
pub use localizer::{Localizer, MatchResult, SearchScope};
pub use motion::MotionModel;
pub use rect::{Point, Rect};
pub use session::{TrackSession, TrackingResult};
pub use state_machine::{ReacquireHandle, TrackerConfig, TrackingStateMachine};
pub use track_state::{Health, TrackState};
