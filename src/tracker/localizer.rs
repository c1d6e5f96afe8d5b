use crate::error::TrackLost;
use crate::tracker::frame::Frame;
use crate::tracker::rect::{Point, Rect};

/// Where a localizer should look for the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchScope {
    /// The whole frame, with no prior location
    FullFrame,
    /// A region around a prior location, already padded by the caller
    Neighborhood(Rect),
    /// Continue from the localizer's own internal state
    Incremental,
}

/// Outcome of one localization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatchResult {
    /// Axis-aligned region in frame coordinates, `None` when not found
    pub region: Option<Rect>,
    /// Projected reference quadrilateral, when the localizer knows it
    pub corners: Option<[Point; 4]>,
    /// Trust in the result, in [0, 1]
    pub confidence: f32,
    /// Geometrically consistent correspondences; 0 for correlation tracking
    pub inlier_count: usize,
}

impl MatchResult {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn found(&self) -> bool {
        self.region.is_some()
    }
}

/// A strategy that finds the session's target in a frame.
///
/// The tracking state machine drives two of these: a re-detector for
/// full-frame and neighborhood scopes and an incremental tracker.
pub trait Localizer {
    fn localize(&mut self, frame: &Frame, scope: SearchScope) -> Result<MatchResult, TrackLost>;

    /// Re-seed internal state at a confirmed location.
    fn reinitialize(&mut self, _frame: &Frame, _region: Rect) {}

    /// Drop all internal state.
    fn reset(&mut self) {}
}

impl<L: Localizer + ?Sized> Localizer for Box<L> {
    fn localize(&mut self, frame: &Frame, scope: SearchScope) -> Result<MatchResult, TrackLost> {
        (**self).localize(frame, scope)
    }

    fn reinitialize(&mut self, frame: &Frame, region: Rect) {
        (**self).reinitialize(frame, region)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
