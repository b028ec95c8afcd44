//! Facial landmark geometry in the standard 68-point scheme.
//!
//! Frames arrive from an external landmark detector once per camera frame.
//! Coordinates are normalized to [0, 1] in both axes. The engine never
//! mutates a frame; it reads the handful of point groups it needs and
//! discards the rest.

use serde::{Deserialize, Serialize};

/// Number of points in the full 68-point annotation scheme.
pub const POINT_COUNT: usize = 68;

/// Points per eye contour (corner, three lid points, corner, lid point).
pub const EYE_POINT_COUNT: usize = 6;

const LEFT_EYE_START: usize = 36;
const RIGHT_EYE_START: usize = 42;
const NOSE_TIP: usize = 30;
const INNER_UPPER_LIP: usize = 62;
const INNER_LOWER_LIP: usize = 66;

/// A single 2D landmark in normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Which eye a contour belongs to, from the subject's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

/// One frame of detected facial landmarks.
///
/// An empty frame means the upstream detector found no face; the caller
/// is expected to skip it rather than treat it as an error. A frame with
/// fewer than [`POINT_COUNT`] points is accepted — individual feature
/// lookups simply return `None` for the groups that are missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LandmarkFrame {
    points: Vec<Point>,
}

impl LandmarkFrame {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// True when the detector reported no face for this frame.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// The six contour points of one eye, if present.
    pub fn eye(&self, eye: Eye) -> Option<[Point; EYE_POINT_COUNT]> {
        let start = match eye {
            Eye::Left => LEFT_EYE_START,
            Eye::Right => RIGHT_EYE_START,
        };
        let slice = self.points.get(start..start + EYE_POINT_COUNT)?;
        slice.try_into().ok()
    }

    /// The nose-tip landmark, if present.
    pub fn nose_tip(&self) -> Option<Point> {
        self.points.get(NOSE_TIP).copied()
    }

    /// The inner upper- and lower-lip landmarks, if both are present.
    pub fn inner_lips(&self) -> Option<(Point, Point)> {
        let upper = self.points.get(INNER_UPPER_LIP)?;
        let lower = self.points.get(INNER_LOWER_LIP)?;
        Some((*upper, *lower))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_has_no_features() {
        let frame = LandmarkFrame::default();
        assert!(frame.is_empty());
        assert!(frame.eye(Eye::Left).is_none());
        assert!(frame.nose_tip().is_none());
        assert!(frame.inner_lips().is_none());
    }

    #[test]
    fn partial_frame_exposes_only_present_groups() {
        // 42 points: left eye present, right eye / lips missing
        let points = vec![Point::new(0.5, 0.5); 42];
        let frame = LandmarkFrame::new(points);
        assert!(frame.eye(Eye::Left).is_some());
        assert!(frame.eye(Eye::Right).is_none());
        assert!(frame.nose_tip().is_some());
        assert!(frame.inner_lips().is_none());
    }

    #[test]
    fn full_frame_exposes_all_groups() {
        let points = vec![Point::new(0.5, 0.5); POINT_COUNT];
        let frame = LandmarkFrame::new(points);
        assert!(frame.eye(Eye::Left).is_some());
        assert!(frame.eye(Eye::Right).is_some());
        assert!(frame.nose_tip().is_some());
        assert!(frame.inner_lips().is_some());
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(0.3, 0.4);
        assert!((a.distance(&b) - 0.5).abs() < 1e-6);
    }
}
