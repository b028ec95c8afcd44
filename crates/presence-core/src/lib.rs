//! Presence core — liveness and identity verification.
//!
//! Turns a stream of per-frame facial landmarks into a pass/fail
//! liveness decision via a challenge-response protocol, then matches a
//! frame captured at the pass instant against an enrolled identity.
//!
//! Data flows one way:
//!
//! ```text
//! LandmarkFrame → signal::extract → GestureDetector → ChallengeSequencer
//!                                       → SessionDriver → IdentityMatcher → Phase
//! ```
//!
//! The crate owns no I/O: landmark frames are pushed in by an external
//! detector, the still image comes from a [`matcher::FrameCapture`]
//! collaborator, and matching goes through [`matcher::IdentityMatcher`].
//! Everything is testable with a paused clock and stub collaborators.

pub mod gesture;
pub mod landmarks;
pub mod matcher;
pub mod sequencer;
pub mod session;
pub mod signal;

pub use gesture::{BlinkStrategy, GestureConfig, GestureDetector, GestureKind};
pub use landmarks::{LandmarkFrame, Point};
pub use matcher::{
    CaptureError, CapturedFrame, DescriptorMatcher, Embedding, EmbeddingExtractor, FrameCapture,
    IdentityMatcher, MatchError, MatchVerdict, Reference, DEFAULT_MATCH_THRESHOLD, DESCRIPTOR_DIM,
};
pub use sequencer::{Challenge, ChallengePlan, ChallengeSequencer, SequencerConfig, SequencerState};
pub use session::{Phase, SessionDriver, SessionStatus};
pub use signal::{SignalError, SignalSample};
