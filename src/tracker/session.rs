use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::recipe::{Recipe, RecipeId};
use crate::tracker::rect::{Point, Rect};
use crate::tracker::track_state::{Health, TrackState};

/// Live tracking of one recipe. Mutated only by the state machine.
#[derive(Debug, Clone)]
pub struct TrackSession {
    recipe: Arc<Recipe>,
    pub(crate) state: TrackState,
    pub(crate) bounding_region: Option<Rect>,
    pub(crate) corners: Option<[Point; 4]>,
    pub(crate) confidence: f32,
    pub(crate) consecutive_low_confidence_count: u32,
    pub(crate) last_good_detection_frame: Option<u64>,
    /// Frames evaluated since the last state change
    pub(crate) frames_in_state: u32,
    /// Track frames since the last feature revalidation
    pub(crate) frames_since_validation: u32,
    /// Last region the target was confirmed or tracked at
    pub(crate) last_known_region: Option<Rect>,
    pub(crate) frames_processed: u64,
}

impl TrackSession {
    pub fn new(recipe: Arc<Recipe>) -> Self {
        Self {
            recipe,
            state: TrackState::Search,
            bounding_region: None,
            corners: None,
            confidence: 0.0,
            consecutive_low_confidence_count: 0,
            last_good_detection_frame: None,
            frames_in_state: 0,
            frames_since_validation: 0,
            last_known_region: None,
            frames_processed: 0,
        }
    }

    pub fn recipe(&self) -> &Arc<Recipe> {
        &self.recipe
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn bounding_region(&self) -> Option<Rect> {
        self.bounding_region
    }

    pub fn corners(&self) -> Option<[Point; 4]> {
        self.corners
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn consecutive_low_confidence_count(&self) -> u32 {
        self.consecutive_low_confidence_count
    }

    pub fn last_good_detection_frame(&self) -> Option<u64> {
        self.last_good_detection_frame
    }

    pub fn last_known_region(&self) -> Option<Rect> {
        self.last_known_region
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub(crate) fn transition(&mut self, to: TrackState) {
        if self.state != to {
            self.state = to;
            self.frames_in_state = 0;
        }
    }

    /// Forget the current location, keeping `last_known_region`.
    pub(crate) fn clear_location(&mut self) {
        self.bounding_region = None;
        self.corners = None;
        self.confidence = 0.0;
        self.consecutive_low_confidence_count = 0;
        self.frames_since_validation = 0;
    }
}

/// Per-frame output of the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingResult {
    pub sequence: u64,
    pub timestamp: Duration,
    pub recipe_id: RecipeId,
    /// State the frame was evaluated in
    pub state: TrackState,
    /// State the next frame will be evaluated in
    pub next_state: TrackState,
    pub health: Health,
    pub bounding_region: Option<Rect>,
    pub corners: Option<[Point; 4]>,
    pub confidence: f32,
    pub consecutive_low_confidence_count: u32,
    pub last_good_detection_frame: Option<u64>,
    /// A forced re-acquire was applied before evaluating this frame
    pub forced: bool,
}
