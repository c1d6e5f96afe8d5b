//! Planar homography estimation and plausibility checks.
//!
//! Algorithm: normalized DLT (Hartley 1997).
//!   1. Translate and scale both point sets so their centroid is the origin
//!      and the mean distance from it is sqrt(2).
//!   2. Stack two constraint rows per correspondence into the 9x9 normal
//!      matrix M = A^T * A.
//!   3. The eigenvector of M with the smallest eigenvalue is the vectorized H.
//!   4. Undo the normalization.
//!
//! A RANSAC wrapper samples 4 correspondences at a time and stops early once
//! the inlier ratio makes further sampling unlikely to help.

use nalgebra::{Matrix3, SMatrix, SymmetricEigen, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::tracker::rect::Point;

const SAMPLE_SIZE: usize = 4;

/// A reference-image point and the frame point it was matched to.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    pub src: Point,
    pub dst: Point,
}

#[derive(Debug, Clone)]
pub struct RansacConfig {
    /// Maximum reprojection error in frame pixels for an inlier
    pub threshold: f64,
    /// Upper bound on iterations
    pub max_iterations: usize,
    /// Stop once the probability of having sampled an all-inlier set
    /// exceeds this
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            threshold: 5.0,
            max_iterations: 2000,
            confidence: 0.995,
            seed: 0x00C0_FFEE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HomographyEstimate {
    /// Maps reference coordinates to frame coordinates.
    pub h: Matrix3<f64>,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    pub iterations: usize,
}

/// Direct linear transform over at least four correspondences.
pub fn fit_homography(corrs: &[Correspondence]) -> Option<Matrix3<f64>> {
    if corrs.len() < SAMPLE_SIZE {
        return None;
    }

    let src = Normalization::of(corrs.iter().map(|c| c.src));
    let dst = Normalization::of(corrs.iter().map(|c| c.dst));

    let mut normal = SMatrix::<f64, 9, 9>::zeros();
    for c in corrs {
        let (x, y) = src.apply(c.src);
        let (u, v) = dst.apply(c.dst);
        let rows = [
            [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u],
            [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v],
        ];
        for r in &rows {
            for i in 0..9 {
                for j in 0..9 {
                    normal[(i, j)] += r[i] * r[j];
                }
            }
        }
    }

    let eigen = SymmetricEigen::new(normal);
    let (smallest, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v = eigen.eigenvectors.column(smallest);
    let hn = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let h = dst.inverse_matrix() * hn * src.matrix();
    let scale = h[(2, 2)];
    if !scale.is_finite() || scale.abs() < 1e-12 {
        return None;
    }
    let h = h / scale;
    h.iter().all(|v| v.is_finite()).then_some(h)
}

/// Robust homography; `None` when fewer than four correspondences are given
/// or no sample yields a model.
pub fn estimate_homography_ransac(
    corrs: &[Correspondence],
    config: &RansacConfig,
) -> Option<HomographyEstimate> {
    let n = corrs.len();
    if n < SAMPLE_SIZE {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;
    let mut iterations = 0;
    let mut adaptive_max = config.max_iterations;

    while iterations < adaptive_max {
        iterations += 1;

        let picked = rand::seq::index::sample(&mut rng, n, SAMPLE_SIZE).into_vec();
        let sample: Vec<Correspondence> = picked.iter().map(|&i| corrs[i]).collect();
        if is_degenerate(&sample) {
            continue;
        }
        let Some(h) = fit_homography(&sample) else {
            continue;
        };

        let (inliers, count) = classify(&h, corrs, config.threshold);
        if best.as_ref().is_none_or(|(_, _, c)| count > *c) {
            best = Some((h, inliers, count));

            let w = count as f64 / n as f64;
            if w > 0.0 {
                let p_fail = (1.0 - w.powi(SAMPLE_SIZE as i32)).max(1e-15);
                let k = (1.0 - config.confidence).ln() / p_fail.ln();
                adaptive_max = (k.ceil().max(1.0) as usize).min(config.max_iterations);
            }
        }
    }

    let (h, inliers, count) = best?;

    // Refit on all inliers, keep the refit only if it does not lose support.
    let inlier_corrs: Vec<Correspondence> = corrs
        .iter()
        .zip(&inliers)
        .filter(|&(_, &inlier)| inlier)
        .map(|(c, _)| *c)
        .collect();
    if let Some(refined) = fit_homography(&inlier_corrs) {
        let (refined_inliers, refined_count) = classify(&refined, corrs, config.threshold);
        if refined_count >= count {
            return Some(HomographyEstimate {
                h: refined,
                inliers: refined_inliers,
                num_inliers: refined_count,
                iterations,
            });
        }
    }

    Some(HomographyEstimate {
        h,
        inliers,
        num_inliers: count,
        iterations,
    })
}

/// Apply `h` to `p`; `None` for points mapped to infinity.
pub fn project(h: &Matrix3<f64>, p: Point) -> Option<Point> {
    let v = h * Vector3::new(p.x as f64, p.y as f64, 1.0);
    if v.z.abs() < 1e-12 {
        return None;
    }
    Some(Point::new((v.x / v.z) as f32, (v.y / v.z) as f32))
}

/// Euclidean distance between the projected source point and the destination.
pub fn reprojection_error(h: &Matrix3<f64>, c: &Correspondence) -> f64 {
    match project(h, c.src) {
        Some(p) => (((p.x - c.dst.x) as f64).powi(2) + ((p.y - c.dst.y) as f64).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Project the reference rectangle `[0, w] x [0, h]`, clockwise from the
/// top-left corner. `None` if any corner crosses the horizon.
pub fn project_reference(h: &Matrix3<f64>, width: f32, height: f32) -> Option<[Point; 4]> {
    let corners = [
        Point::new(0.0, 0.0),
        Point::new(width, 0.0),
        Point::new(width, height),
        Point::new(0.0, height),
    ];
    // All corners must stay on the same side of the horizon line.
    let w: Vec<f64> = corners
        .iter()
        .map(|p| h[(2, 0)] * p.x as f64 + h[(2, 1)] * p.y as f64 + h[(2, 2)])
        .collect();
    if !(w.iter().all(|&w| w > 1e-12) || w.iter().all(|&w| w < -1e-12)) {
        return None;
    }
    Some([
        project(h, corners[0])?,
        project(h, corners[1])?,
        project(h, corners[2])?,
        project(h, corners[3])?,
    ])
}

/// Strictly convex, non-self-intersecting quadrilateral.
pub fn is_convex(quad: &[Point; 4]) -> bool {
    let mut sign = 0.0f32;
    for i in 0..4 {
        let a = quad[i];
        let b = quad[(i + 1) % 4];
        let c = quad[(i + 2) % 4];
        let cross = (b.x - a.x) * (c.y - b.y) - (b.y - a.y) * (c.x - b.x);
        if cross.abs() < 1e-6 {
            return false;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Shoelace area of a quadrilateral.
pub fn quad_area(quad: &[Point; 4]) -> f32 {
    let mut twice = 0.0;
    for i in 0..4 {
        let a = quad[i];
        let b = quad[(i + 1) % 4];
        twice += a.x * b.y - b.x * a.y;
    }
    twice.abs() / 2.0
}

/// Size of a projected reference quadrilateral relative to the reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadGeometry {
    /// `sqrt(projected area / reference area)`
    pub scale: f32,
    /// Ratio of the larger to the smaller per-axis side scale, >= 1
    pub anisotropy: f32,
}

pub fn quad_geometry(quad: &[Point; 4], ref_width: f32, ref_height: f32) -> QuadGeometry {
    let len = |a: Point, b: Point| ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt();
    let sx = (len(quad[0], quad[1]) + len(quad[3], quad[2])) / (2.0 * ref_width);
    let sy = (len(quad[0], quad[3]) + len(quad[1], quad[2])) / (2.0 * ref_height);
    let scale = (quad_area(quad) / (ref_width * ref_height)).sqrt();
    let anisotropy = if sx.min(sy) > 0.0 {
        sx.max(sy) / sx.min(sy)
    } else {
        f32::INFINITY
    };
    QuadGeometry { scale, anisotropy }
}

fn classify(h: &Matrix3<f64>, corrs: &[Correspondence], threshold: f64) -> (Vec<bool>, usize) {
    let inliers: Vec<bool> = corrs
        .iter()
        .map(|c| reprojection_error(h, c) < threshold)
        .collect();
    let count = inliers.iter().filter(|&&i| i).count();
    (inliers, count)
}

/// Any three sample points (on either side) nearly collinear.
fn is_degenerate(sample: &[Correspondence]) -> bool {
    let collinear = |a: Point, b: Point, c: Point| {
        ((b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)).abs() < 1.0
    };
    for i in 0..sample.len() {
        for j in (i + 1)..sample.len() {
            for k in (j + 1)..sample.len() {
                let (a, b, c) = (sample[i], sample[j], sample[k]);
                if collinear(a.src, b.src, c.src) || collinear(a.dst, b.dst, c.dst) {
                    return true;
                }
            }
        }
    }
    false
}

/// Hartley conditioning transform.
struct Normalization {
    cx: f64,
    cy: f64,
    scale: f64,
}

impl Normalization {
    fn of(points: impl Iterator<Item = Point> + Clone) -> Self {
        let n = points.clone().count().max(1) as f64;
        let (sx, sy) = points
            .clone()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
        let (cx, cy) = (sx / n, sy / n);
        let mean_dist = points
            .map(|p| ((p.x as f64 - cx).powi(2) + (p.y as f64 - cy).powi(2)).sqrt())
            .sum::<f64>()
            / n;
        let scale = if mean_dist > 1e-15 {
            std::f64::consts::SQRT_2 / mean_dist
        } else {
            1.0
        };
        Self { cx, cy, scale }
    }

    fn apply(&self, p: Point) -> (f64, f64) {
        ((p.x as f64 - self.cx) * self.scale, (p.y as f64 - self.cy) * self.scale)
    }

    fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.scale,
            0.0,
            -self.scale * self.cx,
            0.0,
            self.scale,
            -self.scale * self.cy,
            0.0,
            0.0,
            1.0,
        )
    }

    fn inverse_matrix(&self) -> Matrix3<f64> {
        let inv = 1.0 / self.scale;
        Matrix3::new(inv, 0.0, self.cx, 0.0, inv, self.cy, 0.0, 0.0, 1.0)
    }
}
