use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tracker::Rect;

/// Number of bytes in a binary descriptor (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Stable unique recipe identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeId(Uuid);

impl RecipeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for RecipeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

/// A distinctive location in the reference image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// x coordinate at full resolution
    pub x: f32,
    /// y coordinate at full resolution
    pub y: f32,
    /// Orientation in radians
    pub angle: f32,
    /// Corner response
    pub response: f32,
    /// Pyramid level the keypoint was detected on
    pub octave: u8,
}

/// 256-bit binary appearance signature, compared by Hamming distance.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Ordered `(keypoint, descriptor)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptorSet {
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keypoints: Vec::with_capacity(capacity),
            descriptors: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, keypoint: Keypoint, descriptor: Descriptor) {
        self.keypoints.push(keypoint);
        self.descriptors.push(descriptor);
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Keypoint, &Descriptor)> {
        self.keypoints.iter().zip(self.descriptors.iter())
    }

    /// Shift every keypoint by `(dx, dy)`.
    pub fn translate(&mut self, dx: f32, dy: f32) {
        for kp in &mut self.keypoints {
            kp.x += dx;
            kp.y += dy;
        }
    }

    /// Mean nearest-neighbor Hamming distance, normalized to [0, 1].
    ///
    /// Sets with fewer than two descriptors have no neighbors and score 0.
    pub fn mean_distinctiveness(&self) -> f32 {
        let n = self.descriptors.len();
        if n < 2 {
            return 0.0;
        }
        let total: u64 = self
            .descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| {
                self.descriptors
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, other)| d.distance(other))
                    .min()
                    .unwrap_or(0) as u64
            })
            .sum();
        total as f32 / n as f32 / (DESCRIPTOR_BYTES * 8) as f32
    }
}

/// Width/height of the registered region at registration scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSize {
    pub width: u32,
    pub height: u32,
}

/// Registration quality, recorded once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub keypoint_count: usize,
    pub mean_distinctiveness: f32,
    pub registration_confidence: f32,
}

impl QualityMetrics {
    /// Scores a descriptor set extracted under a `min_keypoints` requirement.
    pub fn assess(descriptors: &DescriptorSet, min_keypoints: usize) -> Self {
        let keypoint_count = descriptors.len();
        let mean_distinctiveness = descriptors.mean_distinctiveness();
        let coverage = (keypoint_count as f32 / (4 * min_keypoints.max(1)) as f32).min(1.0);
        let spread = (mean_distinctiveness / 0.25).min(1.0);
        Self {
            keypoint_count,
            mean_distinctiveness,
            registration_confidence: coverage * spread,
        }
    }
}

/// A registered template.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub id: RecipeId,
    pub name: String,
    /// 1 for a fresh registration, incremented by re-registration.
    pub version: u32,
    /// The recipe this version replaces.
    pub supersedes: Option<RecipeId>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    /// Region of interest in the source frame at registration time.
    pub roi: Rect,
    pub reference_image: Arc<Array2<u8>>,
    pub descriptors: DescriptorSet,
    pub reference_size: ReferenceSize,
    pub quality: QualityMetrics,
}

impl Recipe {
    pub fn summary(&self) -> RecipeSummary {
        RecipeSummary {
            id: self.id,
            name: self.name.clone(),
            version: self.version,
            created_at: self.created_at,
            reference_size: self.reference_size,
            quality: self.quality,
        }
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeSummary {
    pub id: RecipeId,
    pub name: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub reference_size: ReferenceSize,
    pub quality: QualityMetrics,
}
