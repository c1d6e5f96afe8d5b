use serde::{Deserialize, Serialize};

/// A point in frame (or reference image) pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    #[inline]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding region in TLWH form.
///
/// `x`/`y` are the top-left corner; `width`/`height` are in pixels. All
/// tracking output is expressed in this type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    #[inline]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// From corner coordinates `(x1, y1)` top-left and `(x2, y2)` bottom-right.
    #[inline]
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Create a Rect centered on `(cx, cy)`.
    #[inline]
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }

    /// Smallest Rect enclosing all `points`. `None` for an empty slice.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut x1, mut y1, mut x2, mut y2) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            x1 = x1.min(p.x);
            y1 = y1.min(p.y);
            x2 = x2.max(p.x);
            y2 = y2.max(p.y);
        }
        Some(Self::from_tlbr(x1, y1, x2, y2))
    }

    /// Corner coordinates `[x1, y1, x2, y2]`.
    #[inline]
    pub fn to_tlbr(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    /// Get the center point of the region.
    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// True when the region has no usable extent.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    /// Grow by `factor` times the region size on every side.
    ///
    /// `padded(1.0)` on a 10x10 region yields a 30x30 region with the same
    /// center.
    pub fn padded(&self, factor: f32) -> Self {
        let pad_x = self.width * factor;
        let pad_y = self.height * factor;
        Self::new(
            self.x - pad_x,
            self.y - pad_y,
            self.width + 2.0 * pad_x,
            self.height + 2.0 * pad_y,
        )
    }

    /// Scale width and height by `factor` about the center.
    pub fn scaled(&self, factor: f32) -> Self {
        let (cx, cy) = self.center();
        Self::from_center(cx, cy, self.width * factor, self.height * factor)
    }

    /// Intersection with the frame `[0, width) x [0, height)`.
    ///
    /// Returns `None` when nothing of the region lies inside the frame.
    pub fn clamp_to(&self, width: usize, height: usize) -> Option<Self> {
        let [x1, y1, x2, y2] = self.to_tlbr();
        let x1 = x1.max(0.0);
        let y1 = y1.max(0.0);
        let x2 = x2.min(width as f32);
        let y2 = y2.min(height as f32);
        let clamped = Self::from_tlbr(x1, y1, x2, y2);
        (!clamped.is_empty()).then_some(clamped)
    }

    /// Linear blend towards `other`: `weight` 1.0 returns `other`.
    pub fn lerp(&self, other: &Rect, weight: f32) -> Self {
        let keep = 1.0 - weight;
        Self::new(
            keep * self.x + weight * other.x,
            keep * self.y + weight * other.y,
            keep * self.width + weight * other.width,
            keep * self.height + weight * other.height,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tlbr() {
        let rect = Rect::from_tlbr(10.0, 20.0, 40.0, 60.0);
        assert_eq!(rect, Rect::new(10.0, 20.0, 30.0, 40.0));
        assert_eq!(rect.to_tlbr(), [10.0, 20.0, 40.0, 60.0]);
    }

    #[test]
    fn test_from_points() {
        let pts = [
            Point::new(5.0, 9.0),
            Point::new(1.0, 3.0),
            Point::new(7.0, 4.0),
        ];
        assert_eq!(Rect::from_points(&pts), Some(Rect::new(1.0, 3.0, 6.0, 6.0)));
        assert_eq!(Rect::from_points(&[]), None);
    }

    #[test]
    fn test_padded_keeps_center() {
        let rect = Rect::new(10.0, 10.0, 10.0, 20.0);
        let padded = rect.padded(1.0);
        assert_eq!(padded, Rect::new(0.0, -10.0, 30.0, 60.0));
        assert_eq!(padded.center(), rect.center());
    }

    #[test]
    fn test_clamp_to_frame() {
        let rect = Rect::new(-10.0, 5.0, 40.0, 200.0);
        assert_eq!(rect.clamp_to(20, 100), Some(Rect::new(0.0, 5.0, 20.0, 95.0)));

        let outside = Rect::new(50.0, 50.0, 10.0, 10.0);
        assert_eq!(outside.clamp_to(20, 20), None);
    }

    #[test]
    fn test_lerp() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(10.0, 20.0, 20.0, 30.0);
        assert_eq!(a.lerp(&b, 0.5), Rect::new(5.0, 10.0, 15.0, 20.0));
        assert_eq!(a.lerp(&b, 1.0), b);
    }
}
