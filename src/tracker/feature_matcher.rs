//! Feature-based re-detection of a recipe in a frame.

use std::sync::Arc;

use ndarray::{ArrayView2, s};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, TrackLost};
use crate::recipe::Recipe;
use crate::tracker::features::{ExtractorConfig, FeatureExtractor};
use crate::tracker::frame::Frame;
use crate::tracker::homography::{
    Correspondence, RansacConfig, estimate_homography_ransac, is_convex, project_reference,
    quad_geometry,
};
use crate::tracker::localizer::{Localizer, MatchResult, SearchScope};
use crate::tracker::matching::{ratio_test, resolve_conflicts};
use crate::tracker::rect::{Point, Rect};

/// Configuration for [`FeatureMatcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Extraction applied to frames
    pub extractor: ExtractorConfig,
    /// Nearest/second-nearest distance ratio a match must stay below
    pub ratio: f32,
    /// Absolute Hamming distance cap, in bits
    pub max_distance: u32,
    /// RANSAC reprojection threshold in pixels
    pub ransac_threshold: f32,
    pub ransac_max_iterations: usize,
    pub ransac_confidence: f32,
    /// Fixed so that identical input gives identical output
    pub ransac_seed: u64,
    /// Minimum geometric inliers for acceptance
    pub min_inliers: usize,
    /// Plausible projected scale range relative to the reference size
    pub min_scale: f32,
    pub max_scale: f32,
    /// Maximum ratio between horizontal and vertical scale
    pub max_anisotropy: f32,
    /// Inlier count at which support saturates at 1.0
    pub inlier_saturation: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            extractor: ExtractorConfig::default(),
            ratio: 0.75,
            max_distance: 80,
            ransac_threshold: 5.0,
            ransac_max_iterations: 2000,
            ransac_confidence: 0.995,
            ransac_seed: 0x00C0_FFEE,
            min_inliers: 8,
            min_scale: 0.25,
            max_scale: 4.0,
            max_anisotropy: 3.0,
            inlier_saturation: 20,
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.extractor.validate()?;
        if !(self.ratio > 0.0 && self.ratio <= 1.0) {
            return Err(ConfigError::invalid("matcher.ratio", "must be in (0, 1]"));
        }
        if self.max_distance == 0 || self.max_distance > 256 {
            return Err(ConfigError::invalid("matcher.max_distance", "must be in 1..=256"));
        }
        if !(self.ransac_threshold > 0.0) {
            return Err(ConfigError::invalid("matcher.ransac_threshold", "must be positive"));
        }
        if self.ransac_max_iterations == 0 {
            return Err(ConfigError::invalid(
                "matcher.ransac_max_iterations",
                "must be at least 1",
            ));
        }
        if !(self.ransac_confidence > 0.0 && self.ransac_confidence < 1.0) {
            return Err(ConfigError::invalid("matcher.ransac_confidence", "must be in (0, 1)"));
        }
        if self.min_inliers < 4 {
            return Err(ConfigError::invalid(
                "matcher.min_inliers",
                "a homography needs at least 4 inliers",
            ));
        }
        if !(self.min_scale > 0.0 && self.min_scale < self.max_scale) {
            return Err(ConfigError::invalid(
                "matcher.min_scale",
                format!(
                    "need 0 < min_scale < max_scale, got {}..{}",
                    self.min_scale, self.max_scale
                ),
            ));
        }
        if !(self.max_anisotropy >= 1.0) {
            return Err(ConfigError::invalid("matcher.max_anisotropy", "must be at least 1"));
        }
        if self.inlier_saturation == 0 {
            return Err(ConfigError::invalid("matcher.inlier_saturation", "must be at least 1"));
        }
        Ok(())
    }

    fn ransac(&self) -> RansacConfig {
        RansacConfig {
            threshold: self.ransac_threshold as f64,
            max_iterations: self.ransac_max_iterations,
            confidence: self.ransac_confidence as f64,
            seed: self.ransac_seed,
        }
    }
}

/// Re-detects the session recipe from scratch in a whole frame or a
/// neighborhood of it.
///
/// Matching is stateless between calls, so the same frame and scope always
/// produce the same result.
pub struct FeatureMatcher {
    recipe: Arc<Recipe>,
    extractor: FeatureExtractor,
    config: MatcherConfig,
}

impl FeatureMatcher {
    pub fn new(recipe: Arc<Recipe>, config: MatcherConfig) -> Self {
        Self {
            recipe,
            extractor: FeatureExtractor::new(config.extractor.clone()),
            config,
        }
    }

    pub fn recipe(&self) -> &Arc<Recipe> {
        &self.recipe
    }

    /// Match the recipe against `image`, a crop of a `frame_w x frame_h`
    /// frame whose top-left pixel is at `offset`.
    pub fn match_image(
        &self,
        image: &ArrayView2<'_, u8>,
        offset: (f32, f32),
        frame_w: usize,
        frame_h: usize,
    ) -> MatchResult {
        let mut observed = self.extractor.extract(image);
        if observed.is_empty() {
            return MatchResult::not_found();
        }
        observed.translate(offset.0, offset.1);

        let reference = &self.recipe.descriptors;
        let candidates = ratio_test(
            reference.descriptors(),
            observed.descriptors(),
            self.config.ratio,
            self.config.max_distance,
        );
        let survivors = candidates.len();
        let matches = resolve_conflicts(
            candidates,
            reference.descriptors(),
            observed.descriptors(),
            self.config.max_distance,
        );

        let corrs: Vec<Correspondence> = matches
            .iter()
            .map(|m| {
                let src = reference.keypoints()[m.query];
                let dst = observed.keypoints()[m.train];
                Correspondence {
                    src: Point::new(src.x, src.y),
                    dst: Point::new(dst.x, dst.y),
                }
            })
            .collect();
        let distances: Vec<u32> = matches.iter().map(|m| m.distance).collect();

        debug!(
            features = observed.len(),
            ratio_survivors = survivors,
            correspondences = corrs.len(),
            "descriptor matching done"
        );
        self.evaluate_correspondences(&corrs, &distances, survivors, frame_w, frame_h)
    }

    /// Geometric verification and scoring of candidate correspondences.
    ///
    /// `distances[i]` is the Hamming distance behind `corrs[i]`;
    /// `survivors` is the number of matches that passed the ratio test.
    pub fn evaluate_correspondences(
        &self,
        corrs: &[Correspondence],
        distances: &[u32],
        survivors: usize,
        frame_w: usize,
        frame_h: usize,
    ) -> MatchResult {
        if corrs.len() < self.config.min_inliers {
            return MatchResult::not_found();
        }

        let Some(estimate) = estimate_homography_ransac(corrs, &self.config.ransac()) else {
            return MatchResult::not_found();
        };
        if estimate.num_inliers < self.config.min_inliers {
            debug!(inliers = estimate.num_inliers, "too few inliers");
            return MatchResult::not_found();
        }

        let size = self.recipe.reference_size;
        let (ref_w, ref_h) = (size.width as f32, size.height as f32);
        let Some(quad) = project_reference(&estimate.h, ref_w, ref_h) else {
            return MatchResult::not_found();
        };
        if !is_convex(&quad) {
            debug!("projected reference is not convex");
            return MatchResult::not_found();
        }

        let geometry = quad_geometry(&quad, ref_w, ref_h);
        if geometry.scale < self.config.min_scale
            || geometry.scale > self.config.max_scale
            || geometry.anisotropy > self.config.max_anisotropy
        {
            debug!(
                scale = geometry.scale,
                anisotropy = geometry.anisotropy,
                "implausible projected geometry"
            );
            return MatchResult::not_found();
        }

        let Some(region) = Rect::from_points(&quad).and_then(|r| r.clamp_to(frame_w, frame_h))
        else {
            return MatchResult::not_found();
        };

        let inliers = estimate.num_inliers;
        let mean_distance = distances
            .iter()
            .zip(&estimate.inliers)
            .filter(|&(_, &inlier)| inlier)
            .map(|(&d, _)| d as f32)
            .sum::<f32>()
            / inliers as f32;

        let support = (inliers as f32 / self.config.inlier_saturation as f32).min(1.0);
        let inlier_ratio = (inliers as f32 / survivors.max(inliers) as f32).min(1.0);
        let distance_quality =
            (1.0 - mean_distance / self.config.max_distance as f32).clamp(0.0, 1.0);
        let confidence = (support * (0.6 + 0.4 * inlier_ratio) * (0.7 + 0.3 * distance_quality))
            .clamp(0.0, 1.0);

        MatchResult {
            region: Some(region),
            corners: Some(quad),
            confidence,
            inlier_count: inliers,
        }
    }
}

impl Localizer for FeatureMatcher {
    /// `Incremental` has no meaning for a stateless re-detector and is
    /// treated as `FullFrame`.
    fn localize(&mut self, frame: &Frame, scope: SearchScope) -> Result<MatchResult, TrackLost> {
        let (w, h) = (frame.width(), frame.height());
        let pixels = frame.pixels();
        match scope {
            SearchScope::FullFrame | SearchScope::Incremental => {
                Ok(self.match_image(&pixels, (0.0, 0.0), w, h))
            }
            SearchScope::Neighborhood(area) => {
                let Some(area) = area.clamp_to(w, h) else {
                    return Ok(MatchResult::not_found());
                };
                let x0 = area.x.floor().max(0.0) as usize;
                let y0 = area.y.floor().max(0.0) as usize;
                let x1 = ((area.x + area.width).ceil() as usize).min(w);
                let y1 = ((area.y + area.height).ceil() as usize).min(h);
                if x1 <= x0 || y1 <= y0 {
                    return Ok(MatchResult::not_found());
                }
                let crop = pixels.slice(s![y0..y1, x0..x1]);
                Ok(self.match_image(&crop, (x0 as f32, y0 as f32), w, h))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{DescriptorSet, QualityMetrics, ReferenceSize};
    use chrono::Utc;
    use nalgebra::Matrix3;
    use ndarray::Array2;

    use crate::recipe::RecipeId;
    use crate::tracker::homography::project;

    fn recipe(width: u32, height: u32) -> Arc<Recipe> {
        Arc::new(Recipe {
            id: RecipeId::new(),
            name: "board".into(),
            version: 1,
            supersedes: None,
            notes: String::new(),
            created_at: Utc::now(),
            roi: Rect::new(0.0, 0.0, width as f32, height as f32),
            reference_image: Arc::new(Array2::zeros((height as usize, width as usize))),
            descriptors: DescriptorSet::new(),
            reference_size: ReferenceSize { width, height },
            quality: QualityMetrics {
                keypoint_count: 0,
                mean_distinctiveness: 0.0,
                registration_confidence: 0.0,
            },
        })
    }

    /// A 6x5 grid of reference points mapped through `h`.
    fn grid(h: &Matrix3<f64>) -> Vec<Correspondence> {
        let mut corrs = Vec::new();
        for gy in 0..5 {
            for gx in 0..6 {
                let src = Point::new(5.0 + gx as f32 * 18.0, 7.0 + gy as f32 * 21.0);
                let dst = project(h, src).unwrap();
                corrs.push(Correspondence { src, dst });
            }
        }
        corrs
    }

    #[test]
    fn test_scaled_down_target_accepted() {
        let matcher = FeatureMatcher::new(recipe(100, 100), MatcherConfig::default());
        let h = Matrix3::new(0.6, 0.0, 200.0, 0.0, 0.6, 120.0, 0.0, 0.0, 1.0);
        let corrs = grid(&h);
        let distances = vec![10; corrs.len()];
        let result = matcher.evaluate_correspondences(&corrs, &distances, corrs.len(), 640, 480);

        assert!(result.found());
        let region = result.region.unwrap();
        assert!((region.width - 60.0).abs() < 0.5);
        assert!((region.height - 60.0).abs() < 0.5);
        assert_eq!(result.inlier_count, 30);
        assert!(result.confidence > 0.9, "confidence {}", result.confidence);
    }

    #[test]
    fn test_implausible_scale_rejected() {
        let matcher = FeatureMatcher::new(recipe(100, 100), MatcherConfig::default());
        let h = Matrix3::new(0.1, 0.0, 200.0, 0.0, 0.1, 120.0, 0.0, 0.0, 1.0);
        let corrs = grid(&h);
        let distances = vec![10; corrs.len()];
        let result = matcher.evaluate_correspondences(&corrs, &distances, corrs.len(), 640, 480);
        assert!(!result.found());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_too_few_correspondences() {
        let matcher = FeatureMatcher::new(recipe(100, 100), MatcherConfig::default());
        let h = Matrix3::identity();
        let corrs: Vec<_> = grid(&h).into_iter().take(5).collect();
        let result = matcher.evaluate_correspondences(&corrs, &[0; 5], 5, 640, 480);
        assert!(!result.found());
    }

    #[test]
    fn test_region_outside_frame_rejected() {
        let matcher = FeatureMatcher::new(recipe(100, 100), MatcherConfig::default());
        let h = Matrix3::new(1.0, 0.0, 900.0, 0.0, 1.0, 900.0, 0.0, 0.0, 1.0);
        let corrs = grid(&h);
        let result =
            matcher.evaluate_correspondences(&corrs, &vec![0; corrs.len()], corrs.len(), 640, 480);
        assert!(!result.found());
    }

    #[test]
    fn test_confidence_grows_with_support() {
        let matcher = FeatureMatcher::new(recipe(100, 100), MatcherConfig::default());
        let h = Matrix3::identity();
        let all = grid(&h);
        let few: Vec<_> = all.iter().copied().take(10).collect();

        let strong =
            matcher.evaluate_correspondences(&all, &vec![20; all.len()], all.len(), 640, 480);
        let weak =
            matcher.evaluate_correspondences(&few, &vec![20; few.len()], few.len(), 640, 480);
        assert!(strong.found() && weak.found());
        assert!(strong.confidence > weak.confidence);
    }

    #[test]
    fn test_config_validation() {
        assert!(MatcherConfig::default().validate().is_ok());
        let bad = MatcherConfig {
            min_scale: 5.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
