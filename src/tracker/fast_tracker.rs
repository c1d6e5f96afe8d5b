//! Incremental correlation tracking between consecutive frames.
//!
//! The target appearance is a small zero-mean template. Each step resamples
//! a search window around the motion-predicted center at three scales and
//! slides the template over it with normalized cross-correlation.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ConfigError, TrackLost, TrackLostReason};
use crate::tracker::frame::Frame;
use crate::tracker::image::{IntegralImage, resample};
use crate::tracker::localizer::{Localizer, MatchResult, SearchScope};
use crate::tracker::motion::MotionModel;
use crate::tracker::rect::Rect;

/// Half-width of the area around the peak excluded from the sidelobe.
const PEAK_EXCLUSION: usize = 2;

/// Patches with a smaller standard deviation than this are treated as flat.
const MIN_PATCH_STD: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastTrackerConfig {
    /// Template resolution on the longer side
    pub template_size: usize,
    /// Search window size relative to the region size
    pub search_factor: f32,
    /// Relative scale change tested on each side of the current scale
    pub scale_step: f32,
    /// Minimum correlation peak for a valid step
    pub min_peak: f32,
    /// Peak-to-sidelobe ratio at which the sharpness factor reaches 0.5
    pub psr_half: f32,
    /// Template adaptation rate per successful step
    pub learning_rate: f32,
}

impl Default for FastTrackerConfig {
    fn default() -> Self {
        Self {
            template_size: 32,
            search_factor: 2.0,
            scale_step: 0.05,
            min_peak: 0.2,
            psr_half: 4.0,
            learning_rate: 0.1,
        }
    }
}

impl FastTrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8..=128).contains(&self.template_size) {
            return Err(ConfigError::invalid(
                "fast_tracker.template_size",
                format!("{} is outside 8..=128", self.template_size),
            ));
        }
        if !(self.search_factor > 1.0 && self.search_factor <= 4.0) {
            return Err(ConfigError::invalid("fast_tracker.search_factor", "must be in (1, 4]"));
        }
        if !(0.0..0.5).contains(&self.scale_step) {
            return Err(ConfigError::invalid("fast_tracker.scale_step", "must be in [0, 0.5)"));
        }
        if !(-1.0..=1.0).contains(&self.min_peak) {
            return Err(ConfigError::invalid("fast_tracker.min_peak", "must be in [-1, 1]"));
        }
        if !(self.psr_half > 0.0) {
            return Err(ConfigError::invalid("fast_tracker.psr_half", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.learning_rate) {
            return Err(ConfigError::invalid("fast_tracker.learning_rate", "must be in [0, 1]"));
        }
        Ok(())
    }
}

struct Template {
    /// Zero-mean appearance
    pixels: Array2<f32>,
    norm: f64,
}

impl Template {
    fn from_patch(patch: Array2<f32>) -> Self {
        let mean = patch.mean().unwrap_or(0.0);
        let pixels = patch.mapv(|v| v - mean);
        let norm = pixels.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>().sqrt();
        Self { pixels, norm }
    }

    fn blend(&self, patch: &Array2<f32>, rate: f32) -> Self {
        let mixed = &self.pixels * (1.0 - rate) + patch * rate;
        Self::from_patch(mixed)
    }

    fn width(&self) -> usize {
        self.pixels.ncols()
    }

    fn height(&self) -> usize {
        self.pixels.nrows()
    }
}

/// Best placement found at one scale.
struct Candidate {
    region: Rect,
    peak: f32,
    psr: f32,
    confidence: f32,
}

/// Frame-to-frame correlation tracker.
pub struct FastTracker {
    config: FastTrackerConfig,
    template: Option<Template>,
    motion: Option<MotionModel>,
    region: Option<Rect>,
}

impl FastTracker {
    pub fn new(config: FastTrackerConfig) -> Self {
        Self {
            config,
            template: None,
            motion: None,
            region: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.template.is_some()
    }

    /// Region estimated by the last successful step, unclamped.
    pub fn region(&self) -> Option<Rect> {
        self.region
    }

    fn template_dims(&self, region: &Rect) -> (usize, usize) {
        let size = self.config.template_size as f32;
        let (w, h) = if region.width >= region.height {
            (size, size * region.height / region.width)
        } else {
            (size * region.width / region.height, size)
        };
        ((w.round() as usize).max(4), (h.round() as usize).max(4))
    }

    /// One tracking step against `frame`.
    pub fn step(&mut self, frame: &Frame) -> Result<MatchResult, TrackLost> {
        let (Some(template), Some(region)) = (self.template.as_ref(), self.region) else {
            return Err(TrackLostReason::NotInitialized.into());
        };
        if region.is_empty() || !region.width.is_finite() || !region.height.is_finite() {
            return Err(TrackLostReason::DegenerateRegion.into());
        }

        let (cx, cy) = match self.motion.as_mut() {
            Some(motion) => motion.predict(),
            None => region.center(),
        };

        let pixels = frame.pixels();
        let (w, h) = (frame.width(), frame.height());
        let step = self.config.scale_step;
        let mut best: Option<Candidate> = None;
        let mut any_in_frame = false;

        for scale in [1.0 - step, 1.0, 1.0 + step] {
            let candidate = Rect::from_center(cx, cy, region.width * scale, region.height * scale);
            let window = candidate.scaled(self.config.search_factor);
            if window.clamp_to(w, h).is_none() {
                continue;
            }
            any_in_frame = true;

            if let Some(found) = self.search(&pixels, template, &candidate, &window)
                && best.as_ref().is_none_or(|b| found.confidence > b.confidence)
            {
                best = Some(found);
            }
        }

        if !any_in_frame {
            return Err(TrackLostReason::OutOfFrame.into());
        }
        let Some(best) = best.filter(|b| b.peak >= self.config.min_peak) else {
            return Err(TrackLostReason::WeakResponse.into());
        };
        let Some(visible) = best.region.clamp_to(w, h) else {
            return Err(TrackLostReason::OutOfFrame.into());
        };
        trace!(peak = best.peak, psr = best.psr, confidence = best.confidence, "tracker step");

        // Adapt appearance and motion.
        let (tw, th) = (template.width(), template.height());
        let patch = resample(&pixels, &best.region, tw, th);
        let patch_mean = patch.mean().unwrap_or(0.0);
        let adapted = template.blend(&patch.mapv(|v| v - patch_mean), self.config.learning_rate);
        self.template = Some(adapted);
        let (ncx, ncy) = best.region.center();
        if let Some(motion) = self.motion.as_mut() {
            motion.update(ncx, ncy, best.region.height);
        }
        self.region = Some(best.region);

        Ok(MatchResult {
            region: Some(visible),
            corners: None,
            confidence: best.confidence,
            inlier_count: 0,
        })
    }

    /// Slide the template over `window`, resampled so that `candidate`
    /// maps onto exactly one template.
    fn search(
        &self,
        pixels: &ArrayView2<'_, u8>,
        template: &Template,
        candidate: &Rect,
        window: &Rect,
    ) -> Option<Candidate> {
        let (tw, th) = (template.width(), template.height());
        let cell_x = candidate.width / tw as f32;
        let cell_y = candidate.height / th as f32;
        let sw = (window.width / cell_x).round() as usize;
        let sh = (window.height / cell_y).round() as usize;
        if sw < tw || sh < th || template.norm <= f64::EPSILON {
            return None;
        }

        let search = resample(pixels, window, sw, sh);
        let response = ncc_response(&search.view(), template);
        let (peak_x, peak_y, peak) = argmax(&response)?;
        let psr = peak_to_sidelobe(&response, peak_x, peak_y, peak);
        let sharpness = psr / (psr + self.config.psr_half);
        let confidence = (peak.max(0.0) * sharpness).clamp(0.0, 1.0);

        Some(Candidate {
            region: Rect::new(
                window.x + peak_x as f32 * cell_x,
                window.y + peak_y as f32 * cell_y,
                candidate.width,
                candidate.height,
            ),
            peak,
            psr,
            confidence,
        })
    }
}

impl Default for FastTracker {
    fn default() -> Self {
        Self::new(FastTrackerConfig::default())
    }
}

impl Localizer for FastTracker {
    /// The tracker always continues from its own state; the scope is ignored.
    fn localize(&mut self, frame: &Frame, _scope: SearchScope) -> Result<MatchResult, TrackLost> {
        self.step(frame)
    }

    fn reinitialize(&mut self, frame: &Frame, region: Rect) {
        if region.is_empty() {
            self.reset();
            return;
        }
        let (tw, th) = self.template_dims(&region);
        let patch = resample(&frame.pixels(), &region, tw, th);
        self.template = Some(Template::from_patch(patch));
        let (cx, cy) = region.center();
        self.motion = Some(MotionModel::new(cx, cy, region.height));
        self.region = Some(region);
    }

    fn reset(&mut self) {
        self.template = None;
        self.motion = None;
        self.region = None;
    }
}

/// Normalized cross-correlation of `template` at every offset in `search`.
fn ncc_response(search: &ArrayView2<'_, f32>, template: &Template) -> Array2<f32> {
    let (tw, th) = (template.width(), template.height());
    let (sh, sw) = search.dim();
    let (rows, cols) = (sh - th + 1, sw - tw + 1);
    let integral = IntegralImage::from_f32(search);
    let n = (tw * th) as f64;

    Array2::from_shape_fn((rows, cols), |(v, u)| {
        let sum = integral.sum(u, v, tw, th);
        let sum_sq = integral.sum_sq(u, v, tw, th);
        let variance = (sum_sq - sum * sum / n).max(0.0);
        if variance / n < MIN_PATCH_STD * MIN_PATCH_STD {
            return 0.0;
        }
        let mut cross = 0.0f64;
        for ty in 0..th {
            for tx in 0..tw {
                cross += template.pixels[[ty, tx]] as f64 * search[[v + ty, u + tx]] as f64;
            }
        }
        (cross / (template.norm * variance.sqrt())) as f32
    })
}

fn argmax(response: &Array2<f32>) -> Option<(usize, usize, f32)> {
    response
        .indexed_iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|((y, x), &v)| (x, y, v))
}

/// `(peak - mean) / std` over the response outside a small area around the
/// peak. 0 when there is no sidelobe to compare against.
fn peak_to_sidelobe(response: &Array2<f32>, px: usize, py: usize, peak: f32) -> f32 {
    let mut n = 0usize;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for ((y, x), &v) in response.indexed_iter() {
        if x.abs_diff(px) <= PEAK_EXCLUSION && y.abs_diff(py) <= PEAK_EXCLUSION {
            continue;
        }
        n += 1;
        sum += v as f64;
        sum_sq += (v as f64) * (v as f64);
    }
    if n < 2 {
        return 0.0;
    }
    let mean = sum / n as f64;
    let std = (sum_sq / n as f64 - mean * mean).max(0.0).sqrt();
    (((peak as f64 - mean) / (std + 1e-6)).max(0.0)) as f32
}
