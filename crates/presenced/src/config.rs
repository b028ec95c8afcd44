use std::path::PathBuf;
use std::time::Duration;

use presence_core::{
    BlinkStrategy, ChallengePlan, GestureConfig, GestureKind, SequencerConfig,
    DEFAULT_MATCH_THRESHOLD,
};

/// Which identity-matching strategy the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherMode {
    /// Embed the captured frame and compare descriptor distances locally.
    Descriptor,
    /// Submit captured frame + reference image to an external
    /// comparison service and take its verdict.
    Compare,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite enrollment database.
    pub db_path: PathBuf,
    /// Descriptor distance below which a face matches.
    pub match_threshold: f32,
    /// Gestures a subject must perform per verification.
    pub required_gestures: usize,
    /// Per-challenge deadline in milliseconds.
    pub challenge_timeout_ms: u64,
    /// Blink detection scheme (`fixed` or `adaptive`). Must stay the
    /// same for one deployment — switching mid-fleet changes what counts
    /// as a blink.
    pub blink_strategy: BlinkStrategy,
    pub blink_closed_threshold: f32,
    pub blink_open_threshold: f32,
    pub adaptive_blink_ratio: f32,
    /// Head-turn displacement in working units.
    pub turn_threshold: f32,
    pub mouth_threshold: f32,
    /// Identity matching strategy.
    pub matcher_mode: MatcherMode,
    /// Embedding service endpoint (descriptor mode).
    pub embed_url: String,
    /// Photo-comparison service endpoint (compare mode).
    pub compare_url: String,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let db_path = std::env::var("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("enrollments.db"));

        let blink_strategy = match std::env::var("PRESENCE_BLINK_STRATEGY").as_deref() {
            Ok("adaptive") => BlinkStrategy::AdaptiveBaseline,
            _ => BlinkStrategy::FixedThreshold,
        };

        let matcher_mode = match std::env::var("PRESENCE_MATCHER").as_deref() {
            Ok("compare") => MatcherMode::Compare,
            _ => MatcherMode::Descriptor,
        };

        Self {
            db_path,
            match_threshold: env_f32("PRESENCE_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            required_gestures: env_usize("PRESENCE_REQUIRED_GESTURES", 4),
            challenge_timeout_ms: env_u64("PRESENCE_CHALLENGE_TIMEOUT_MS", 5000),
            blink_strategy,
            blink_closed_threshold: env_f32("PRESENCE_BLINK_CLOSED_THRESHOLD", 0.010),
            blink_open_threshold: env_f32("PRESENCE_BLINK_OPEN_THRESHOLD", 0.018),
            adaptive_blink_ratio: env_f32("PRESENCE_ADAPTIVE_BLINK_RATIO", 0.6),
            turn_threshold: env_f32("PRESENCE_TURN_THRESHOLD", 30.0),
            mouth_threshold: env_f32("PRESENCE_MOUTH_THRESHOLD", 0.02),
            matcher_mode,
            embed_url: std::env::var("PRESENCE_EMBED_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7601/embed".to_string()),
            compare_url: std::env::var("PRESENCE_COMPARE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7601/compare".to_string()),
            session_bus: std::env::var("PRESENCE_SESSION_BUS").is_ok(),
        }
    }

    /// Gesture thresholds for the core detector.
    pub fn gesture_config(&self) -> GestureConfig {
        GestureConfig {
            blink_strategy: self.blink_strategy,
            blink_closed_threshold: self.blink_closed_threshold,
            blink_open_threshold: self.blink_open_threshold,
            adaptive_blink_ratio: self.adaptive_blink_ratio,
            turn_threshold: self.turn_threshold,
            mouth_threshold: self.mouth_threshold,
            ..GestureConfig::default()
        }
    }

    /// Challenge selection and timing for the core sequencer.
    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            required: self.required_gestures,
            pool: GestureKind::ALL.to_vec(),
            timeout: Duration::from_millis(self.challenge_timeout_ms),
            plan: ChallengePlan::Random,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
