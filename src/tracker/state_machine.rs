//! Per-frame arbitration between feature re-detection and incremental
//! tracking.
//!
//! | State     | Localizer                      | Exit                                        |
//! |-----------|--------------------------------|---------------------------------------------|
//! | SEARCH    | detector, full frame           | match -> TRACK                              |
//! | TRACK     | tracker; detector revalidates  | failure or low confidence streak -> LOST    |
//! | LOST      | detector, padded neighborhood  | match -> TRACK; timeout -> REACQUIRE        |
//! | REACQUIRE | detector, full frame           | match -> TRACK; timeout -> SEARCH           |
//!
//! A "match" is a found result with confidence at or above
//! `detect_threshold`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::recipe::Recipe;
use crate::tracker::fast_tracker::{FastTracker, FastTrackerConfig};
use crate::tracker::feature_matcher::{FeatureMatcher, MatcherConfig};
use crate::tracker::frame::Frame;
use crate::tracker::localizer::{Localizer, MatchResult, SearchScope};
use crate::tracker::rect::Rect;
use crate::tracker::session::{TrackSession, TrackingResult};
use crate::tracker::track_state::TrackState;

/// Thresholds and timeouts of the tracking state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum detector confidence to enter TRACK
    pub detect_threshold: f32,
    /// Tracker confidence below this counts as a low-confidence frame
    pub lost_threshold: f32,
    /// Consecutive low-confidence frames before TRACK gives up
    pub lost_frame_count: u32,
    /// LOST frames without a neighborhood match before REACQUIRE
    pub neighborhood_frames: u32,
    /// REACQUIRE frames without a match before falling back to SEARCH
    pub reacquire_timeout_frames: u32,
    /// TRACK frames between feature revalidations
    pub revalidate_interval: u32,
    /// Weight of a revalidated region when correcting the tracked one
    pub region_smoothing: f32,
    /// Neighborhood padding on every side, relative to the region size
    pub neighborhood_padding: f32,
    pub matcher: MatcherConfig,
    pub fast_tracker: FastTrackerConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            detect_threshold: 0.5,
            lost_threshold: 0.35,
            lost_frame_count: 5,
            neighborhood_frames: 10,
            reacquire_timeout_frames: 90,
            revalidate_interval: 15,
            region_smoothing: 0.6,
            neighborhood_padding: 1.0,
            matcher: MatcherConfig::default(),
            fast_tracker: FastTrackerConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.detect_threshold) {
            return Err(ConfigError::invalid("tracker.detect_threshold", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.lost_threshold) {
            return Err(ConfigError::invalid("tracker.lost_threshold", "must be in [0, 1]"));
        }
        for (field, value) in [
            ("tracker.lost_frame_count", self.lost_frame_count),
            ("tracker.neighborhood_frames", self.neighborhood_frames),
            ("tracker.reacquire_timeout_frames", self.reacquire_timeout_frames),
            ("tracker.revalidate_interval", self.revalidate_interval),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        if !(self.region_smoothing > 0.0 && self.region_smoothing <= 1.0) {
            return Err(ConfigError::invalid("tracker.region_smoothing", "must be in (0, 1]"));
        }
        if !(self.neighborhood_padding >= 0.0 && self.neighborhood_padding.is_finite()) {
            return Err(ConfigError::invalid(
                "tracker.neighborhood_padding",
                "must be a non-negative number",
            ));
        }
        self.matcher.validate()?;
        self.fast_tracker.validate()
    }
}

/// Requests a forced re-acquire from any thread.
///
/// The request is applied at the start of the next processed frame.
#[derive(Debug, Clone, Default)]
pub struct ReacquireHandle(Arc<AtomicBool>);

impl ReacquireHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Withdraw a pending request.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

type BoxedLocalizer = Box<dyn Localizer + Send>;

pub struct TrackingStateMachine {
    config: TrackerConfig,
    session: TrackSession,
    detector: BoxedLocalizer,
    tracker: BoxedLocalizer,
    reacquire: ReacquireHandle,
}

impl TrackingStateMachine {
    /// Session for `recipe` with the default localizers.
    pub fn new(recipe: Arc<Recipe>, config: TrackerConfig) -> Self {
        let detector = Box::new(FeatureMatcher::new(recipe.clone(), config.matcher.clone()));
        let tracker = Box::new(FastTracker::new(config.fast_tracker.clone()));
        Self::with_localizers(recipe, config, detector, tracker)
    }

    /// Session with caller-provided localizers.
    pub fn with_localizers(
        recipe: Arc<Recipe>,
        config: TrackerConfig,
        detector: BoxedLocalizer,
        tracker: BoxedLocalizer,
    ) -> Self {
        Self {
            config,
            session: TrackSession::new(recipe),
            detector,
            tracker,
            reacquire: ReacquireHandle::default(),
        }
    }

    /// Share an externally owned re-acquire flag. Any pending request on it
    /// is withdrawn.
    pub fn with_reacquire_handle(mut self, handle: ReacquireHandle) -> Self {
        handle.clear();
        self.reacquire = handle;
        self
    }

    pub fn session(&self) -> &TrackSession {
        &self.session
    }

    pub fn state(&self) -> TrackState {
        self.session.state
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn reacquire_handle(&self) -> ReacquireHandle {
        self.reacquire.clone()
    }

    pub fn force_reacquire(&self) {
        self.reacquire.request();
    }

    /// Evaluate one frame and advance by exactly one step.
    ///
    /// # Arguments
    /// * `frame` - Next frame of the session, newer than the last one
    ///
    /// # Returns
    /// The result for this frame: the state it was evaluated in, the state
    /// the machine moved to, and the region when one is known.
    pub fn process(&mut self, frame: &Frame) -> TrackingResult {
        let forced = self.reacquire.take();
        if forced {
            info!(
                sequence = frame.sequence(),
                from = %self.session.state,
                "forced re-acquire"
            );
            self.session.clear_location();
            self.session.transition(TrackState::Reacquire);
            self.session.frames_in_state = 0;
            self.tracker.reset();
        }

        let evaluated = self.session.state;
        match evaluated {
            TrackState::Search => self.step_search(frame),
            TrackState::Track => self.step_track(frame),
            TrackState::Lost => self.step_lost(frame),
            TrackState::Reacquire => self.step_reacquire(frame),
        }

        self.session.frames_processed += 1;
        let next_state = self.session.state;
        if next_state != evaluated {
            info!(
                sequence = frame.sequence(),
                recipe = %self.session.recipe().name,
                from = %evaluated,
                to = %next_state,
                confidence = self.session.confidence,
                "tracking state changed"
            );
        }

        TrackingResult {
            sequence: frame.sequence(),
            timestamp: frame.timestamp(),
            recipe_id: self.session.recipe().id,
            state: evaluated,
            next_state,
            health: next_state.health(),
            bounding_region: self.session.bounding_region,
            corners: self.session.corners,
            confidence: self.session.confidence,
            consecutive_low_confidence_count: self.session.consecutive_low_confidence_count,
            last_good_detection_frame: self.session.last_good_detection_frame,
            forced,
        }
    }

    fn is_match(&self, result: &MatchResult) -> bool {
        result.found() && result.confidence >= self.config.detect_threshold
    }

    fn detect(&mut self, frame: &Frame, scope: SearchScope) -> MatchResult {
        // A re-detector has no state to lose; an error is simply no match.
        self.detector
            .localize(frame, scope)
            .unwrap_or_else(|_| MatchResult::not_found())
    }

    fn neighborhood(&self, frame: &Frame, region: Rect) -> Option<Rect> {
        region
            .padded(self.config.neighborhood_padding)
            .clamp_to(frame.width(), frame.height())
    }

    /// Confirmed detection: enter TRACK at the detected region.
    fn acquire(&mut self, frame: &Frame, result: MatchResult) {
        let Some(region) = result.region else {
            return;
        };
        let s = &mut self.session;
        s.bounding_region = Some(region);
        s.corners = result.corners;
        s.confidence = result.confidence;
        s.consecutive_low_confidence_count = 0;
        s.frames_since_validation = 0;
        s.last_good_detection_frame = Some(frame.sequence());
        s.last_known_region = Some(region);
        s.transition(TrackState::Track);
        self.tracker.reinitialize(frame, region);
    }

    fn step_search(&mut self, frame: &Frame) {
        let result = self.detect(frame, SearchScope::FullFrame);
        if self.is_match(&result) {
            self.acquire(frame, result);
        } else {
            self.session.confidence = result.confidence;
            self.session.frames_in_state += 1;
        }
    }

    fn step_track(&mut self, frame: &Frame) {
        let step = match self.tracker.localize(frame, SearchScope::Incremental) {
            Ok(result) if result.found() => result,
            Ok(_) => {
                self.enter_lost(frame, "tracker returned no region");
                return;
            }
            Err(lost) => {
                self.enter_lost(frame, &lost.to_string());
                return;
            }
        };

        let Some(mut region) = step.region else {
            return;
        };
        let s = &mut self.session;
        s.frames_in_state += 1;
        s.confidence = step.confidence;
        s.corners = step.corners;
        if step.confidence < self.config.lost_threshold {
            s.consecutive_low_confidence_count += 1;
        } else {
            s.consecutive_low_confidence_count = 0;
        }
        s.frames_since_validation += 1;

        if s.frames_since_validation >= self.config.revalidate_interval {
            self.session.frames_since_validation = 0;
            if let Some(area) = self.neighborhood(frame, region) {
                let check = self.detect(frame, SearchScope::Neighborhood(area));
                if let (true, Some(detected)) = (self.is_match(&check), check.region) {
                    region = region.lerp(&detected, self.config.region_smoothing);
                    let s = &mut self.session;
                    s.corners = check.corners;
                    s.confidence = check.confidence;
                    s.consecutive_low_confidence_count = 0;
                    s.last_good_detection_frame = Some(frame.sequence());
                    self.tracker.reinitialize(frame, region);
                    debug!(sequence = frame.sequence(), "revalidated track");
                }
            }
        }

        self.session.bounding_region = Some(region);
        self.session.last_known_region = Some(region);

        if self.session.consecutive_low_confidence_count >= self.config.lost_frame_count {
            self.enter_lost(frame, "confidence stayed low");
        }
    }

    fn enter_lost(&mut self, frame: &Frame, why: &str) {
        debug!(sequence = frame.sequence(), reason = why, "track lost");
        self.session.frames_since_validation = 0;
        self.session.transition(TrackState::Lost);
    }

    fn step_lost(&mut self, frame: &Frame) {
        let area = self
            .session
            .last_known_region
            .and_then(|region| self.neighborhood(frame, region));
        let result = match area {
            Some(area) => self.detect(frame, SearchScope::Neighborhood(area)),
            None => MatchResult::not_found(),
        };
        if self.is_match(&result) {
            self.acquire(frame, result);
            return;
        }

        self.session.confidence = result.confidence;
        self.session.frames_in_state += 1;
        if self.session.frames_in_state >= self.config.neighborhood_frames {
            self.session.clear_location();
            self.session.transition(TrackState::Reacquire);
            self.tracker.reset();
        }
    }

    fn step_reacquire(&mut self, frame: &Frame) {
        let result = self.detect(frame, SearchScope::FullFrame);
        if self.is_match(&result) {
            self.acquire(frame, result);
            return;
        }

        self.session.confidence = result.confidence;
        self.session.frames_in_state += 1;
        if self.session.frames_in_state >= self.config.reacquire_timeout_frames {
            self.session.clear_location();
            self.session.last_known_region = None;
            self.session.transition(TrackState::Search);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TrackLost, TrackLostReason};
    use crate::recipe::{DescriptorSet, QualityMetrics, RecipeId, ReferenceSize};
    use chrono::Utc;
    use ndarray::Array2;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct Scripted(VecDeque<Result<MatchResult, TrackLost>>);

    impl Localizer for Scripted {
        fn localize(&mut self, _: &Frame, _: SearchScope) -> Result<MatchResult, TrackLost> {
            self.0
                .pop_front()
                .unwrap_or_else(|| Ok(MatchResult::not_found()))
        }
    }

    fn hit(confidence: f32) -> Result<MatchResult, TrackLost> {
        Ok(MatchResult {
            region: Some(Rect::new(40.0, 30.0, 20.0, 20.0)),
            corners: None,
            confidence,
            inlier_count: 20,
        })
    }

    fn recipe() -> Arc<Recipe> {
        Arc::new(Recipe {
            id: RecipeId::new(),
            name: "unit".into(),
            version: 1,
            supersedes: None,
            notes: String::new(),
            created_at: Utc::now(),
            roi: Rect::new(0.0, 0.0, 20.0, 20.0),
            reference_image: Arc::new(Array2::zeros((20, 20))),
            descriptors: DescriptorSet::new(),
            reference_size: ReferenceSize {
                width: 20,
                height: 20,
            },
            quality: QualityMetrics {
                keypoint_count: 0,
                mean_distinctiveness: 0.0,
                registration_confidence: 0.0,
            },
        })
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Duration::ZERO, Array2::zeros((120, 160)))
    }

    fn machine(
        detector: Vec<Result<MatchResult, TrackLost>>,
        tracker: Vec<Result<MatchResult, TrackLost>>,
    ) -> TrackingStateMachine {
        TrackingStateMachine::with_localizers(
            recipe(),
            TrackerConfig::default(),
            Box::new(Scripted(detector.into())),
            Box::new(Scripted(tracker.into())),
        )
    }

    #[test]
    fn test_weak_detection_stays_in_search() {
        let mut sm = machine(vec![hit(0.3)], vec![]);
        let r = sm.process(&frame(1));
        assert_eq!(r.state, TrackState::Search);
        assert_eq!(r.next_state, TrackState::Search);
        assert_eq!(r.bounding_region, None);
    }

    #[test]
    fn test_tracker_error_loses_track() {
        let mut sm = machine(
            vec![hit(0.9)],
            vec![Err(TrackLostReason::WeakResponse.into())],
        );
        sm.process(&frame(1));
        let r = sm.process(&frame(2));
        assert_eq!(r.state, TrackState::Track);
        assert_eq!(r.next_state, TrackState::Lost);
        // The last known location is still reported while lost.
        assert!(r.bounding_region.is_some());
    }

    #[test]
    fn test_lost_rematch_returns_to_track() {
        let mut sm = machine(
            vec![hit(0.9), hit(0.8)],
            vec![Err(TrackLostReason::OutOfFrame.into())],
        );
        sm.process(&frame(1));
        sm.process(&frame(2));
        let r = sm.process(&frame(3));
        assert_eq!(r.state, TrackState::Lost);
        assert_eq!(r.next_state, TrackState::Track);
        assert_eq!(r.last_good_detection_frame, Some(3));
    }

    #[test]
    fn test_revalidation_blends_region() {
        let mut config = TrackerConfig::default();
        config.revalidate_interval = 2;
        let shifted = Ok(MatchResult {
            region: Some(Rect::new(50.0, 30.0, 20.0, 20.0)),
            corners: None,
            confidence: 0.95,
            inlier_count: 30,
        });
        let mut sm = TrackingStateMachine::with_localizers(
            recipe(),
            config,
            Box::new(Scripted(vec![hit(0.9), shifted].into())),
            Box::new(Scripted(vec![hit(0.8), hit(0.8)].into())),
        );
        sm.process(&frame(1));
        let first = sm.process(&frame(2));
        assert_eq!(first.bounding_region, Some(Rect::new(40.0, 30.0, 20.0, 20.0)));
        let second = sm.process(&frame(3));
        let region = second.bounding_region.unwrap();
        assert!((region.x - 46.0).abs() < 1e-4);
        assert!((region.y - 30.0).abs() < 1e-4);
        assert_eq!(second.last_good_detection_frame, Some(3));
    }

    #[test]
    fn test_config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        let bad = TrackerConfig {
            lost_frame_count: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
