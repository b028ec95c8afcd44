//! Per-frame liveness signals derived from landmark geometry.
//!
//! One [`LandmarkFrame`] reduces to three scalars: how open the eyes are
//! (eye aspect ratio), where the nose tip sits horizontally, and how far
//! apart the inner lips are. Extraction is a pure function of the frame;
//! baseline-relative offsets are computed downstream by the gesture
//! detector, which owns the per-attempt baseline.

use thiserror::Error;

use crate::landmarks::{Eye, LandmarkFrame, Point, EYE_POINT_COUNT};

/// Horizontal nose positions are scaled from normalized [0, 1] coordinates
/// into working units so the turn displacement threshold stays an integer
/// quantity. Eye and mouth distances stay in raw normalized units.
pub const WORKING_SCALE: f32 = 1000.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignalError {
    /// The detector reported no face for this frame. Recoverable — the
    /// caller skips the frame and waits for the next one.
    #[error("no face detected in frame")]
    NoFaceDetected,
}

/// Scalar liveness signals for one frame.
///
/// A feature is `None` when the frame lacked the landmark points needed
/// to compute it. Missing features never abort a session; the gesture
/// detector simply sees nothing to evaluate for that frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalSample {
    /// Mean eye aspect ratio of the available eyes (unitless).
    pub eye_openness: Option<f32>,
    /// Nose-tip x position in working units (normalized x × 1000).
    pub nose_x: Option<f32>,
    /// Vertical inner-lip separation in normalized units.
    pub mouth_openness: Option<f32>,
}

/// Extract the per-frame signals from a landmark frame.
///
/// Returns [`SignalError::NoFaceDetected`] for an empty frame. A frame
/// that has a face but is missing some landmark groups yields a sample
/// with the corresponding features unset.
pub fn extract(frame: &LandmarkFrame) -> Result<SignalSample, SignalError> {
    if frame.is_empty() {
        return Err(SignalError::NoFaceDetected);
    }

    let left = frame.eye(Eye::Left).and_then(|eye| eye_aspect_ratio(&eye));
    let right = frame.eye(Eye::Right).and_then(|eye| eye_aspect_ratio(&eye));
    let eye_openness = match (left, right) {
        (Some(l), Some(r)) => Some((l + r) / 2.0),
        (Some(one), None) | (None, Some(one)) => Some(one),
        (None, None) => None,
    };

    let nose_x = frame.nose_tip().map(|tip| tip.x * WORKING_SCALE);

    let mouth_openness = frame
        .inner_lips()
        .map(|(upper, lower)| (lower.y - upper.y).abs());

    Ok(SignalSample {
        eye_openness,
        nose_x,
        mouth_openness,
    })
}

/// Eye aspect ratio over the standard 6-point eye contour P0..P5:
///
/// ```text
/// EAR = (|P1 P5| + |P2 P4|) / (2 · |P0 P3|)
/// ```
///
/// Returns `None` when the horizontal span is degenerate (coincident
/// corner points), which would otherwise divide by zero.
fn eye_aspect_ratio(eye: &[Point; EYE_POINT_COUNT]) -> Option<f32> {
    let vertical = eye[1].distance(&eye[5]) + eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);
    if horizontal <= f32::EPSILON {
        return None;
    }
    Some(vertical / (2.0 * horizontal))
}
