//! Constant-velocity Kalman filter over a region center, using ndarray for
//! the state and nalgebra for the 2x2 inverse.
//!
//! State is `[cx, cy, vx, vy]`; the measurement is `[cx, cy]`. Noise is
//! scaled by the region height so that motion is judged relative to target
//! size.

use ndarray::{Array1, Array2};

#[derive(Debug, Clone)]
pub struct MotionModel {
    motion_mat: Array2<f64>,
    update_mat: Array2<f64>,
    std_weight_position: f64,
    std_weight_velocity: f64,
    mean: Array1<f64>,
    covariance: Array2<f64>,
    scale: f64,
}

impl MotionModel {
    /// Start at `(cx, cy)` with zero velocity.
    pub fn new(cx: f32, cy: f32, height: f32) -> Self {
        let ndim = 2;
        let mut motion_mat = Array2::eye(2 * ndim);
        for i in 0..ndim {
            motion_mat[[i, ndim + i]] = 1.0;
        }

        let mut update_mat = Array2::zeros((ndim, 2 * ndim));
        for i in 0..ndim {
            update_mat[[i, i]] = 1.0;
        }

        let std_weight_position = 1.0 / 20.0;
        let std_weight_velocity = 1.0 / 160.0;
        let scale = (height as f64).max(1.0);
        let std = [
            2.0 * std_weight_position * scale,
            2.0 * std_weight_position * scale,
            10.0 * std_weight_velocity * scale,
            10.0 * std_weight_velocity * scale,
        ];
        let mut covariance = Array2::zeros((4, 4));
        for i in 0..4 {
            covariance[[i, i]] = std[i] * std[i];
        }

        Self {
            motion_mat,
            update_mat,
            std_weight_position,
            std_weight_velocity,
            mean: Array1::from_vec(vec![cx as f64, cy as f64, 0.0, 0.0]),
            covariance,
            scale,
        }
    }

    /// Predicted center for the next frame. Advances the filter.
    pub fn predict(&mut self) -> (f32, f32) {
        let std = [
            self.std_weight_position * self.scale,
            self.std_weight_position * self.scale,
            self.std_weight_velocity * self.scale,
            self.std_weight_velocity * self.scale,
        ];
        let mut motion_cov = Array2::zeros((4, 4));
        for i in 0..4 {
            motion_cov[[i, i]] = std[i] * std[i];
        }

        self.mean = self.motion_mat.dot(&self.mean);
        self.covariance =
            self.motion_mat.dot(&self.covariance).dot(&self.motion_mat.t()) + motion_cov;
        self.center()
    }

    /// Fold in a measured center. A singular innovation covariance leaves
    /// the state at the measurement.
    pub fn update(&mut self, cx: f32, cy: f32, height: f32) {
        self.scale = (height as f64).max(1.0);
        let r = self.std_weight_position * self.scale;
        let mut innovation_cov = Array2::zeros((2, 2));
        innovation_cov[[0, 0]] = r * r;
        innovation_cov[[1, 1]] = r * r;

        let projected_mean = self.update_mat.dot(&self.mean);
        let projected_cov =
            self.update_mat.dot(&self.covariance).dot(&self.update_mat.t()) + innovation_cov;
        let innovation = Array1::from_vec(vec![cx as f64, cy as f64]) - projected_mean;

        let Some(s_inv) = invert_2x2(&projected_cov) else {
            self.mean[0] = cx as f64;
            self.mean[1] = cy as f64;
            return;
        };

        // K = P * H^T * S^-1
        let kalman_gain = self.covariance.dot(&self.update_mat.t()).dot(&s_inv);
        self.mean = &self.mean + &kalman_gain.dot(&innovation);
        self.covariance =
            &self.covariance - &kalman_gain.dot(&projected_cov).dot(&kalman_gain.t());
    }

    pub fn center(&self) -> (f32, f32) {
        (self.mean[0] as f32, self.mean[1] as f32)
    }

    pub fn velocity(&self) -> (f32, f32) {
        (self.mean[2] as f32, self.mean[3] as f32)
    }
}

fn invert_2x2(m: &Array2<f64>) -> Option<Array2<f64>> {
    let nm = nalgebra::Matrix2::new(m[[0, 0]], m[[0, 1]], m[[1, 0]], m[[1, 1]]);
    let inv = nm.try_inverse()?;
    let mut res = Array2::zeros((2, 2));
    for i in 0..2 {
        for j in 0..2 {
            res[[i, j]] = inv[(i, j)];
        }
    }
    Some(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_still() {
        let mut model = MotionModel::new(100.0, 200.0, 50.0);
        assert_eq!(model.center(), (100.0, 200.0));
        assert_eq!(model.predict(), (100.0, 200.0));
    }

    #[test]
    fn test_learns_constant_velocity() {
        let mut model = MotionModel::new(0.0, 0.0, 40.0);
        for step in 1..=30 {
            model.predict();
            model.update(3.0 * step as f32, -2.0 * step as f32, 40.0);
        }
        let (vx, vy) = model.velocity();
        assert!((vx - 3.0).abs() < 0.3, "vx {vx}");
        assert!((vy + 2.0).abs() < 0.3, "vy {vy}");

        let (px, py) = model.predict();
        assert!((px - 93.0).abs() < 1.5);
        assert!((py + 62.0).abs() < 1.5);
    }
}
