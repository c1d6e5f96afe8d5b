//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use ndarray::{Array2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use recipe_track::{
    DescriptorSet, Frame, Localizer, MatchResult, QualityMetrics, Recipe, RecipeId, Rect,
    ReferenceSize, SearchScope, TrackLost,
};

pub const BACKGROUND: u8 = 30;

/// Random overlapping rectangles on a dark background.
pub fn texture(width: usize, height: usize, seed: u64) -> Array2<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = Array2::<u8>::from_elem((height, width), BACKGROUND);
    let count = width * height / 120;
    for _ in 0..count {
        let x0 = rng.random_range(0..width - 4);
        let y0 = rng.random_range(0..height - 4);
        let rw = rng.random_range(3..20).min(width - x0);
        let rh = rng.random_range(3..20).min(height - y0);
        let value: u8 = rng.random_range(60..=250);
        img.slice_mut(s![y0..y0 + rh, x0..x0 + rw]).fill(value);
    }
    img
}

/// `patch` copied into a flat frame with its top-left corner at `(x, y)`.
pub fn paste(patch: &Array2<u8>, width: usize, height: usize, x: usize, y: usize) -> Array2<u8> {
    let mut frame = Array2::<u8>::from_elem((height, width), BACKGROUND);
    let (ph, pw) = patch.dim();
    frame.slice_mut(s![y..y + ph, x..x + pw]).assign(patch);
    frame
}

pub fn flat_frame(sequence: u64) -> Frame {
    Frame::new(
        sequence,
        Duration::from_millis(sequence * 33),
        Array2::from_elem((120, 160), BACKGROUND),
    )
}

/// Fresh directory under the system temp dir, unique per call.
pub fn temp_store_dir(tag: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("recipe-track-{tag}-{}-{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Recipe with no stored pixels, for driving scripted localizers.
pub fn stub_recipe(name: &str) -> Arc<Recipe> {
    Arc::new(Recipe {
        id: RecipeId::new(),
        name: name.into(),
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
            keypoint_count: 50,
            mean_distinctiveness: 0.5,
            registration_confidence: 1.0,
        },
    })
}

pub fn region() -> Rect {
    Rect::new(40.0, 30.0, 20.0, 20.0)
}

pub fn hit(confidence: f32) -> Result<MatchResult, TrackLost> {
    Ok(MatchResult {
        region: Some(region()),
        corners: None,
        confidence,
        inlier_count: 30,
    })
}

pub fn miss() -> Result<MatchResult, TrackLost> {
    Ok(MatchResult::not_found())
}

/// Replays canned results, then reports nothing found. Records every scope
/// it was asked to search.
#[derive(Default)]
pub struct Scripted {
    script: VecDeque<Result<MatchResult, TrackLost>>,
    pub scopes: Arc<parking_lot::Mutex<Vec<SearchScope>>>,
}

impl Scripted {
    pub fn new(script: impl IntoIterator<Item = Result<MatchResult, TrackLost>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            scopes: Default::default(),
        }
    }
}

impl Localizer for Scripted {
    fn localize(&mut self, _frame: &Frame, scope: SearchScope) -> Result<MatchResult, TrackLost> {
        self.scopes.lock().push(scope);
        self.script.pop_front().unwrap_or_else(miss)
    }
}
