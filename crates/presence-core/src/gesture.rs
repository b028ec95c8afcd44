//! Gesture detection over per-frame signal samples.
//!
//! A [`GestureDetector`] watches the signal stream for exactly one
//! requested gesture at a time and fires a boolean "satisfied" event.
//! All state is attempt-local: the blink hysteresis, the nose baseline
//! and the adaptive eye baseline are cleared on [`GestureDetector::reset`]
//! so a new challenge always starts from a clean slate.

use serde::{Deserialize, Serialize};

use crate::signal::SignalSample;

/// The closed set of gestures a challenge can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GestureKind {
    Blink,
    TurnLeft,
    TurnRight,
    MouthOpen,
}

impl GestureKind {
    pub const ALL: [GestureKind; 4] = [
        GestureKind::Blink,
        GestureKind::TurnLeft,
        GestureKind::TurnRight,
        GestureKind::MouthOpen,
    ];

    /// Stable string form for logs and IPC.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blink => "blink",
            Self::TurnLeft => "turn-left",
            Self::TurnRight => "turn-right",
            Self::MouthOpen => "mouth-open",
        }
    }

    /// Instruction shown to the subject while this gesture is active.
    pub fn prompt(&self) -> &'static str {
        match self {
            Self::Blink => "Blink your eyes",
            Self::TurnLeft => "Turn your head to the left",
            Self::TurnRight => "Turn your head to the right",
            Self::MouthOpen => "Open your mouth",
        }
    }
}

/// How blink completion is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlinkStrategy {
    /// Two fixed thresholds with hysteresis. The event fires on the
    /// CLOSED→OPEN transition only, so a single dark or blurred frame
    /// cannot count as a blink without a completed close-open cycle.
    FixedThreshold,
    /// A personal resting openness is averaged over the first stable
    /// frames of the attempt; the event fires as soon as openness drops
    /// below `adaptive_blink_ratio ×` that baseline.
    AdaptiveBaseline,
}

/// Detection thresholds. Defaults match the deployed tuning; every value
/// is overridable through daemon configuration.
#[derive(Debug, Clone)]
pub struct GestureConfig {
    pub blink_strategy: BlinkStrategy,
    /// Eye openness below this counts as closed (fixed strategy).
    pub blink_closed_threshold: f32,
    /// Eye openness above this re-opens the eye. Must stay strictly
    /// greater than `blink_closed_threshold` to avoid chatter.
    pub blink_open_threshold: f32,
    /// Fraction of the resting openness that counts as a closure
    /// (adaptive strategy).
    pub adaptive_blink_ratio: f32,
    /// Frames averaged into the adaptive resting baseline.
    pub adaptive_baseline_frames: usize,
    /// Nose displacement from the attempt baseline, in working units,
    /// required for a head turn.
    pub turn_threshold: f32,
    /// Inner-lip separation, in normalized units, required for mouth-open.
    pub mouth_threshold: f32,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            blink_strategy: BlinkStrategy::FixedThreshold,
            blink_closed_threshold: 0.010,
            blink_open_threshold: 0.018,
            adaptive_blink_ratio: 0.6,
            adaptive_baseline_frames: 3,
            turn_threshold: 30.0,
            mouth_threshold: 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EyeState {
    Open,
    Closed,
}

/// Stateful detector for the currently active gesture of one attempt.
#[derive(Debug)]
pub struct GestureDetector {
    config: GestureConfig,
    eye_state: EyeState,
    nose_baseline: Option<f32>,
    eye_baseline: Option<f32>,
    eye_baseline_sum: f32,
    eye_baseline_count: usize,
}

impl GestureDetector {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            eye_state: EyeState::Open,
            nose_baseline: None,
            eye_baseline: None,
            eye_baseline_sum: 0.0,
            eye_baseline_count: 0,
        }
    }

    /// Whether a baseline has been captured for this attempt. Displacement
    /// gestures never evaluate before this returns true.
    pub fn has_baseline(&self) -> bool {
        self.nose_baseline.is_some() || self.eye_baseline.is_some()
    }

    /// Clear all attempt-local state ahead of a new challenge.
    pub fn reset(&mut self) {
        self.eye_state = EyeState::Open;
        self.nose_baseline = None;
        self.eye_baseline = None;
        self.eye_baseline_sum = 0.0;
        self.eye_baseline_count = 0;
    }

    /// Feed one sample for the active gesture. Returns true when the
    /// gesture has just been satisfied.
    pub fn observe(&mut self, kind: GestureKind, sample: &SignalSample) -> bool {
        match kind {
            GestureKind::Blink => self.observe_blink(sample),
            GestureKind::TurnLeft => self.observe_turn(sample, -1.0),
            GestureKind::TurnRight => self.observe_turn(sample, 1.0),
            GestureKind::MouthOpen => self.observe_mouth(sample),
        }
    }

    fn observe_blink(&mut self, sample: &SignalSample) -> bool {
        let Some(openness) = sample.eye_openness else {
            return false;
        };

        match self.config.blink_strategy {
            BlinkStrategy::FixedThreshold => match self.eye_state {
                EyeState::Open => {
                    if openness < self.config.blink_closed_threshold {
                        self.eye_state = EyeState::Closed;
                        tracing::trace!(openness, "eye closed");
                    }
                    false
                }
                EyeState::Closed => {
                    if openness > self.config.blink_open_threshold {
                        self.eye_state = EyeState::Open;
                        tracing::debug!(openness, "blink completed");
                        return true;
                    }
                    false
                }
            },
            BlinkStrategy::AdaptiveBaseline => {
                let Some(baseline) = self.eye_baseline else {
                    // Baseline capture happens before any evaluation.
                    self.eye_baseline_sum += openness;
                    self.eye_baseline_count += 1;
                    if self.eye_baseline_count >= self.config.adaptive_baseline_frames {
                        let baseline = self.eye_baseline_sum / self.eye_baseline_count as f32;
                        self.eye_baseline = Some(baseline);
                        tracing::debug!(baseline, "adaptive blink baseline captured");
                    }
                    return false;
                };
                if baseline > f32::EPSILON && openness < self.config.adaptive_blink_ratio * baseline
                {
                    tracing::debug!(openness, baseline, "adaptive blink detected");
                    return true;
                }
                false
            }
        }
    }

    fn observe_turn(&mut self, sample: &SignalSample, direction: f32) -> bool {
        let Some(nose_x) = sample.nose_x else {
            return false;
        };

        let Some(baseline) = self.nose_baseline else {
            // First informative frame establishes the resting position.
            self.nose_baseline = Some(nose_x);
            tracing::trace!(nose_x, "nose baseline captured");
            return false;
        };

        let offset = nose_x - baseline;
        if offset * direction > self.config.turn_threshold {
            tracing::debug!(offset, "head turn detected");
            return true;
        }
        false
    }

    fn observe_mouth(&mut self, sample: &SignalSample) -> bool {
        // Resting lip separation is near zero, so no baseline is needed.
        match sample.mouth_openness {
            Some(openness) if openness > self.config.mouth_threshold => {
                tracing::debug!(openness, "mouth open detected");
                true
            }
            _ => false,
        }
    }
}
