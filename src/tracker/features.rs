//! Oriented binary features: FAST-9 corners on an image pyramid with steered
//! 256-bit box-comparison descriptors.
//!
//! The same extractor runs at registration time and on every frame the
//! matcher sees, so the sampling pattern is fixed and generated from a
//! constant seed. Changing it invalidates every persisted descriptor file.

use std::sync::LazyLock;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::recipe::{DESCRIPTOR_BYTES, Descriptor, DescriptorSet, Keypoint};
use crate::tracker::image::{IntegralImage, resize};

/// Bresenham circle of radius 3, clockwise from 12 o'clock.
const CIRCLE_OFFSETS: [(isize, isize); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Contiguous arc length for FAST-9.
const ARC_LENGTH: usize = 9;

/// Radius of the disk used for the intensity-centroid orientation.
const ORIENTATION_RADIUS: isize = 15;

/// Radius of the disk the descriptor test points are drawn from.
const PATTERN_RADIUS: i32 = 13;

/// Half-size of the box filter applied around each test point (5x5).
const BOX_HALF: usize = 2;

/// Pixels excluded at each level border so that every orientation and
/// descriptor lookup stays in bounds.
pub const EDGE: usize = 17;

const PATTERN_SEED: u64 = 0x5EED_0F_0B1D;

/// Point pairs compared by each descriptor bit, relative to the keypoint.
static PATTERN: LazyLock<[[(i8, i8); 2]; DESCRIPTOR_BYTES * 8]> = LazyLock::new(|| {
    let mut state = PATTERN_SEED;
    let mut next = move || {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let span = (2 * PATTERN_RADIUS + 1) as u64;
    let mut sample = move || loop {
        let x = (next() % span) as i32 - PATTERN_RADIUS;
        let y = (next() % span) as i32 - PATTERN_RADIUS;
        if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
            return (x as i8, y as i8);
        }
    };

    let mut pattern = [[(0i8, 0i8); 2]; DESCRIPTOR_BYTES * 8];
    for pair in pattern.iter_mut() {
        let a = sample();
        let mut b = sample();
        while b == a {
            b = sample();
        }
        *pair = [a, b];
    }
    pattern
});

/// Feature extraction parameters, shared by registration and matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Maximum number of features kept over all pyramid levels
    pub max_features: usize,
    /// FAST intensity threshold
    pub fast_threshold: u8,
    /// Number of pyramid levels, including full resolution
    pub pyramid_levels: usize,
    /// Downscale factor between consecutive levels
    pub pyramid_scale: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_features: 1000,
            fast_threshold: 20,
            pyramid_levels: 4,
            pyramid_scale: 1.3,
        }
    }
}

impl ExtractorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_features == 0 {
            return Err(ConfigError::invalid("extractor.max_features", "must be at least 1"));
        }
        if self.fast_threshold == 0 {
            return Err(ConfigError::invalid("extractor.fast_threshold", "must be at least 1"));
        }
        if !(1..=8).contains(&self.pyramid_levels) {
            return Err(ConfigError::invalid(
                "extractor.pyramid_levels",
                format!("{} is outside 1..=8", self.pyramid_levels),
            ));
        }
        if !(self.pyramid_scale > 1.0 && self.pyramid_scale <= 2.0) {
            return Err(ConfigError::invalid(
                "extractor.pyramid_scale",
                format!("{} is outside (1.0, 2.0]", self.pyramid_scale),
            ));
        }
        Ok(())
    }
}

/// Detects and describes oriented FAST features.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    config: ExtractorConfig,
}

struct Candidate {
    x: usize,
    y: usize,
    score: f32,
}

impl FeatureExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract up to `max_features` features from `image`.
    ///
    /// Keypoint coordinates are in `image` pixels regardless of the level
    /// they were detected on. The result is ordered by level, then by
    /// descending response.
    pub fn extract(&self, image: &ArrayView2<'_, u8>) -> DescriptorSet {
        let budgets = self.level_budgets();
        let mut features = DescriptorSet::with_capacity(self.config.max_features);

        for (level, budget) in budgets.into_iter().enumerate() {
            if budget == 0 {
                continue;
            }
            let scale = self.config.pyramid_scale.powi(level as i32);
            if level == 0 {
                self.extract_level(image, 0, (1.0, 1.0), budget, &mut features);
                continue;
            }
            let width = (image.ncols() as f32 / scale).round() as usize;
            let height = (image.nrows() as f32 / scale).round() as usize;
            if width <= 2 * EDGE || height <= 2 * EDGE {
                break;
            }
            let scaled = resize(image, width, height);
            let factor = level_factor(image.dim(), (height, width));
            self.extract_level(&scaled.view(), level as u8, factor, budget, &mut features);
        }

        features
    }

    /// Share of `max_features` per level, proportional to level area.
    fn level_budgets(&self) -> Vec<usize> {
        let levels = self.config.pyramid_levels;
        let inv_area = 1.0 / (self.config.pyramid_scale * self.config.pyramid_scale);
        let weights: Vec<f32> = (0..levels).map(|l| inv_area.powi(l as i32)).collect();
        let total: f32 = weights.iter().sum();

        let mut budgets: Vec<usize> = weights
            .iter()
            .map(|w| (self.config.max_features as f32 * w / total).floor() as usize)
            .collect();
        let assigned: usize = budgets.iter().sum();
        budgets[0] += self.config.max_features.saturating_sub(assigned);
        budgets
    }

    fn extract_level(
        &self,
        image: &ArrayView2<'_, u8>,
        octave: u8,
        (fx, fy): (f32, f32),
        budget: usize,
        out: &mut DescriptorSet,
    ) {
        let (h, w) = image.dim();
        if w <= 2 * EDGE || h <= 2 * EDGE {
            return;
        }

        let scores = self.score_map(image);
        let mut candidates = non_max_suppression(&scores);
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        candidates.truncate(budget);
        if candidates.is_empty() {
            return;
        }

        let integral = IntegralImage::from_u8(image);
        for c in candidates {
            let angle = intensity_centroid_angle(image, c.x, c.y);
            let descriptor = steered_descriptor(&integral, c.x, c.y, angle);
            out.push(
                Keypoint {
                    x: c.x as f32 * fx,
                    y: c.y as f32 * fy,
                    angle,
                    response: c.score,
                    octave,
                },
                descriptor,
            );
        }
    }

    /// FAST-9 response for every pixel inside the border, 0 where there is
    /// no corner.
    fn score_map(&self, image: &ArrayView2<'_, u8>) -> Array2<f32> {
        let (h, w) = image.dim();
        let thresh = self.config.fast_threshold as i16;
        let mut scores = Array2::<f32>::zeros((h, w));

        for y in EDGE..(h - EDGE) {
            for x in EDGE..(w - EDGE) {
                let center = image[[y, x]] as i16;
                let at = |i: usize| {
                    let (dx, dy) = CIRCLE_OFFSETS[i];
                    image[[(y as isize + dy) as usize, (x as isize + dx) as usize]] as i16
                };

                // High-speed test on the four cardinal points: a 9-arc always
                // covers at least two of them.
                let cardinals = [at(0), at(4), at(8), at(12)];
                let bright = cardinals.iter().filter(|&&p| p > center + thresh).count();
                let dark = cardinals.iter().filter(|&&p| p < center - thresh).count();
                if bright < 2 && dark < 2 {
                    continue;
                }

                let mut circle = [0i16; 16];
                for (i, value) in circle.iter_mut().enumerate() {
                    *value = at(i);
                }
                if let Some(score) = corner_score(center, &circle, thresh) {
                    scores[[y, x]] = score;
                }
            }
        }
        scores
    }
}

/// Score of a FAST-9 corner, `None` if there is no contiguous arc.
///
/// The score is the sum of `|diff| - threshold` over the pixels of the
/// qualifying class.
/// Per-axis `(x, y)` factors mapping level coordinates back to level 0.
/// Rounding the level size makes them differ slightly.
fn level_factor((rows, cols): (usize, usize), (height, width): (usize, usize)) -> (f32, f32) {
    (cols as f32 / width as f32, rows as f32 / height as f32)
}

fn corner_score(center: i16, circle: &[i16; 16], thresh: i16) -> Option<f32> {
    let mut bright_mask: u16 = 0;
    let mut dark_mask: u16 = 0;
    for (i, &value) in circle.iter().enumerate() {
        let diff = value - center;
        if diff > thresh {
            bright_mask |= 1 << i;
        } else if diff < -thresh {
            dark_mask |= 1 << i;
        }
    }

    let mut best: Option<f32> = None;
    for mask in [bright_mask, dark_mask] {
        if (mask.count_ones() as usize) < ARC_LENGTH || !has_arc(mask) {
            continue;
        }
        let score: f32 = circle
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, &v)| ((v - center).abs() - thresh) as f32)
            .sum();
        best = Some(best.map_or(score, |b: f32| b.max(score)));
    }
    best
}

/// True if the circular 16-bit mask holds `ARC_LENGTH` contiguous set bits.
#[inline]
fn has_arc(mask: u16) -> bool {
    let doubled = (mask as u32) | ((mask as u32) << 16);
    let mut acc = doubled;
    for _ in 1..ARC_LENGTH {
        acc &= acc >> 1;
    }
    acc != 0
}

/// 3x3 non-maximum suppression. Ties keep the first pixel in scan order.
fn non_max_suppression(scores: &Array2<f32>) -> Vec<Candidate> {
    let (h, w) = scores.dim();
    let mut kept = Vec::new();
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let s = scores[[y, x]];
            if s <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'neighbors: for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let n = scores[[(y as isize + dy) as usize, (x as isize + dx) as usize]];
                    let earlier = dy < 0 || (dy == 0 && dx < 0);
                    if n > s || (n == s && earlier) {
                        is_max = false;
                        break 'neighbors;
                    }
                }
            }
            if is_max {
                kept.push(Candidate { x, y, score: s });
            }
        }
    }
    kept
}

/// Orientation of the intensity centroid within a disk around `(x, y)`.
fn intensity_centroid_angle(image: &ArrayView2<'_, u8>, x: usize, y: usize) -> f32 {
    let r = ORIENTATION_RADIUS;
    let mut m01 = 0.0f64;
    let mut m10 = 0.0f64;
    for dy in -r..=r {
        let half = (((r * r - dy * dy) as f64).sqrt()) as isize;
        let row = (y as isize + dy) as usize;
        for dx in -half..=half {
            let v = image[[row, (x as isize + dx) as usize]] as f64;
            m10 += dx as f64 * v;
            m01 += dy as f64 * v;
        }
    }
    m01.atan2(m10) as f32
}

/// 256 box-smoothed intensity comparisons, with the pattern rotated by `angle`.
fn steered_descriptor(integral: &IntegralImage, x: usize, y: usize, angle: f32) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let box_sum = |(px, py): (i8, i8)| {
        let (px, py) = (px as f32, py as f32);
        let rx = (cos * px - sin * py).round() as isize;
        let ry = (sin * px + cos * py).round() as isize;
        let cx = (x as isize + rx) as usize;
        let cy = (y as isize + ry) as usize;
        integral.sum(cx - BOX_HALF, cy - BOX_HALF, 2 * BOX_HALF + 1, 2 * BOX_HALF + 1)
    };

    let mut bytes = [0u8; DESCRIPTOR_BYTES];
    for (bit, [a, b]) in PATTERN.iter().enumerate() {
        if box_sum(*a) < box_sum(*b) {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
    }
    Descriptor(bytes)
}
