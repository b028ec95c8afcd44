//! The capture & match coordinator.
//!
//! [`SessionDriver`] owns one verification attempt end to end: it feeds
//! landmark frames into the challenge sequencer, races the per-challenge
//! deadline against gesture completion, freezes a single frame at the
//! moment liveness passes, and runs the identity matcher to a terminal
//! VERIFIED or REJECTED. All state transitions happen inside this one
//! task; callers interact through a frame channel, a retry channel and a
//! watch channel of status snapshots.
//!
//! A retry that lands while the matcher call is still pending drops the
//! in-flight future, so a stale verdict can never overwrite the state of
//! the restarted attempt.

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::landmarks::LandmarkFrame;
use crate::matcher::{CapturedFrame, FrameCapture, IdentityMatcher, Reference};
use crate::sequencer::{ChallengeSequencer, SequencerState};
use crate::signal::{self, SignalError};

/// Externally visible lifecycle of a verification session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Liveness challenges in progress.
    Running,
    /// Liveness passed; identity verdict pending.
    Matching,
    /// Terminal: the subject is live and matches the enrolled identity.
    Verified,
    /// Terminal: identity did not match (or the matcher failed).
    Rejected,
    /// Terminal: a challenge timed out. Exits only via retry.
    Failed,
}

/// Snapshot of session progress, published on every transition. Drives
/// the "step N of M, current instruction" progress surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub phase: Phase,
    /// 1-based index of the active challenge while running.
    pub step: usize,
    pub required: usize,
    pub prompt: Option<&'static str>,
    /// Matcher distance, present once a verdict arrived.
    pub distance: Option<f32>,
}

impl Phase {
    /// Stable string form for logs and IPC.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Matching => "MATCHING",
            Self::Verified => "VERIFIED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        }
    }
}

enum LivenessOutcome {
    Passed,
    Failed,
}

enum MatchOutcome {
    Terminal(Phase, Option<f32>),
    Retried,
}

/// Drives one verification attempt. Construct with a started sequencer,
/// then hand the returned future to the runtime.
pub struct SessionDriver<C, M> {
    sequencer: ChallengeSequencer,
    capture: C,
    matcher: M,
    reference: Reference,
    status: watch::Sender<SessionStatus>,
}

impl<C: FrameCapture, M: IdentityMatcher> SessionDriver<C, M> {
    pub fn new(
        sequencer: ChallengeSequencer,
        capture: C,
        matcher: M,
        reference: Reference,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let initial = SessionStatus {
            phase: Phase::Running,
            step: 1,
            required: sequencer.required(),
            prompt: sequencer.current_challenge().map(|c| c.prompt),
            distance: None,
        };
        let (status, status_rx) = watch::channel(initial);
        (
            Self {
                sequencer,
                capture,
                matcher,
                reference,
                status,
            },
            status_rx,
        )
    }

    /// Run the session to a terminal phase.
    ///
    /// `frames` delivers landmark frames from the external detector; the
    /// daemon keeps it at capacity 1 and drops frames when the driver is
    /// busy, since only the latest pose matters. `retries` carries the
    /// explicit retry action. The future resolves once the session is
    /// decided and no retry can arrive any more.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<LandmarkFrame>,
        mut retries: mpsc::Receiver<()>,
    ) -> Phase {
        loop {
            match self.run_liveness(&mut frames, &mut retries).await {
                LivenessOutcome::Passed => {}
                LivenessOutcome::Failed => {
                    self.publish(Phase::Failed, None);
                    match retries.recv().await {
                        Some(()) => {
                            self.sequencer.retry(now());
                            self.publish_running();
                            continue;
                        }
                        // No retry can ever arrive — the attempt stays failed.
                        None => return Phase::Failed,
                    }
                }
            }

            // Liveness passed: freeze exactly one frame at this instant
            // and stop all gesture evaluation.
            let frame = match self.capture.capture() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "frame capture failed at liveness pass");
                    self.publish(Phase::Rejected, None);
                    return Phase::Rejected;
                }
            };
            tracing::info!(
                bytes = frame.data.len(),
                width = frame.width,
                height = frame.height,
                "frame captured for identity match"
            );
            self.publish(Phase::Matching, None);

            match self.run_match(&frame, &mut retries).await {
                MatchOutcome::Terminal(phase, distance) => {
                    self.publish(phase, distance);
                    return phase;
                }
                MatchOutcome::Retried => {
                    self.publish_running();
                    continue;
                }
            }
        }
    }

    /// Run the challenge loop until the sequencer leaves RUNNING.
    async fn run_liveness(
        &mut self,
        frames: &mut mpsc::Receiver<LandmarkFrame>,
        retries: &mut mpsc::Receiver<()>,
    ) -> LivenessOutcome {
        let mut frames_open = true;
        let mut retries_open = true;
        loop {
            match self.sequencer.state() {
                SequencerState::Running => {}
                SequencerState::Passed => return LivenessOutcome::Passed,
                SequencerState::Failed => return LivenessOutcome::Failed,
            }

            let deadline = Instant::from_std(self.sequencer.deadline());
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    self.sequencer.on_tick(now());
                }
                maybe = frames.recv(), if frames_open => match maybe {
                    Some(frame) => self.handle_frame(&frame),
                    // Detector stream ended; the deadline will decide.
                    None => frames_open = false,
                },
                maybe = retries.recv(), if retries_open => match maybe {
                    Some(()) => {
                        self.sequencer.retry(now());
                        self.publish_running();
                    }
                    None => retries_open = false,
                },
            }
        }
    }

    fn handle_frame(&mut self, frame: &LandmarkFrame) {
        let sample = match signal::extract(frame) {
            Ok(sample) => sample,
            Err(SignalError::NoFaceDetected) => {
                tracing::trace!("no face in frame, skipped");
                return;
            }
        };

        let before = self.sequencer.satisfied();
        self.sequencer.on_frame(&sample, now());
        if self.sequencer.satisfied() != before
            && self.sequencer.state() == SequencerState::Running
        {
            self.publish_running();
        }
    }

    /// Await the identity verdict, cancelling the call if a retry lands
    /// first.
    async fn run_match(
        &mut self,
        frame: &CapturedFrame,
        retries: &mut mpsc::Receiver<()>,
    ) -> MatchOutcome {
        let compare = self.matcher.compare(frame, &self.reference);
        tokio::pin!(compare);
        let mut retries_open = true;

        loop {
            tokio::select! {
                result = &mut compare => {
                    return match result {
                        Ok(verdict) if verdict.matched => {
                            tracing::info!(distance = verdict.distance, "identity verified");
                            MatchOutcome::Terminal(Phase::Verified, Some(verdict.distance))
                        }
                        Ok(verdict) => {
                            tracing::info!(distance = verdict.distance, "identity rejected");
                            MatchOutcome::Terminal(Phase::Rejected, Some(verdict.distance))
                        }
                        Err(e) => {
                            // A matcher failure degrades to REJECTED and is
                            // never retried automatically.
                            tracing::warn!(error = %e, "identity match failed");
                            MatchOutcome::Terminal(Phase::Rejected, None)
                        }
                    };
                }
                maybe = retries.recv(), if retries_open => match maybe {
                    Some(()) => {
                        tracing::info!("retry during match, discarding pending verdict");
                        self.sequencer.retry(now());
                        return MatchOutcome::Retried;
                    }
                    None => retries_open = false,
                },
            }
        }
    }

    fn publish_running(&self) {
        self.publish(Phase::Running, None);
    }

    fn publish(&self, phase: Phase, distance: Option<f32>) {
        let step = match phase {
            Phase::Running => (self.sequencer.satisfied() + 1).min(self.sequencer.required()),
            _ => self.sequencer.satisfied(),
        };
        let _ = self.status.send(SessionStatus {
            phase,
            step,
            required: self.sequencer.required(),
            prompt: self.sequencer.current_challenge().map(|c| c.prompt),
            distance,
        });
    }
}

/// Current time in the runtime's clock domain (respects a paused test
/// clock, unlike `std::time::Instant::now`).
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::gesture::{GestureConfig, GestureKind};
    use crate::landmarks::{Point, POINT_COUNT};
    use crate::matcher::{
        CaptureError, Embedding, MatchError, MatchVerdict, DESCRIPTOR_DIM,
    };
    use crate::sequencer::{ChallengePlan, SequencerConfig};

    const STEP_TIMEOUT: Duration = Duration::from_millis(5000);

    // ── Frame builders ───────────────────────────────────────────────────

    fn set_eye(points: &mut [Point], start: usize, ear: f32) {
        // Corners 0.06 apart; vertical lid separation = ear × 0.06 makes
        // the extracted EAR exactly `ear`.
        let gap = ear * 0.06;
        points[start] = Point::new(0.40, 0.50);
        points[start + 3] = Point::new(0.46, 0.50);
        points[start + 1] = Point::new(0.42, 0.50 - gap / 2.0);
        points[start + 5] = Point::new(0.42, 0.50 + gap / 2.0);
        points[start + 2] = Point::new(0.44, 0.50 - gap / 2.0);
        points[start + 4] = Point::new(0.44, 0.50 + gap / 2.0);
    }

    /// A full face frame with the given eye aspect ratio, nose x position
    /// (working units) and inner-lip separation.
    fn face(ear: f32, nose_x: f32, mouth: f32) -> LandmarkFrame {
        let mut points = vec![Point::new(0.1, 0.1); POINT_COUNT];
        set_eye(&mut points, 36, ear);
        set_eye(&mut points, 42, ear);
        points[30] = Point::new(nose_x / 1000.0, 0.45);
        points[62] = Point::new(0.5, 0.60);
        points[66] = Point::new(0.5, 0.60 + mouth);
        LandmarkFrame::new(points)
    }

    fn neutral() -> LandmarkFrame {
        face(0.03, 500.0, 0.0)
    }

    // ── Stub collaborators ───────────────────────────────────────────────

    struct StubCapture;

    impl FrameCapture for StubCapture {
        fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
            Ok(CapturedFrame {
                data: vec![0xFF, 0xD8, 0xFF],
                width: 320,
                height: 240,
            })
        }
    }

    struct FailingCapture;

    impl FrameCapture for FailingCapture {
        fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
            Err(CaptureError::NoFrame)
        }
    }

    struct StubMatcher {
        matched: bool,
        distance: f32,
        delay: Duration,
        fail: bool,
    }

    impl StubMatcher {
        fn verdict(matched: bool, distance: f32) -> Self {
            Self {
                matched,
                distance,
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                matched: false,
                distance: 0.0,
                delay: Duration::ZERO,
                fail: true,
            }
        }
    }

    impl IdentityMatcher for StubMatcher {
        fn compare(
            &self,
            _frame: &CapturedFrame,
            _reference: &Reference,
        ) -> impl std::future::Future<Output = Result<MatchVerdict, MatchError>> + Send {
            let (matched, distance, delay, fail) =
                (self.matched, self.distance, self.delay, self.fail);
            async move {
                if !delay.is_zero() {
                    time::sleep(delay).await;
                }
                if fail {
                    return Err(MatchError::ServiceUnavailable("stub offline".into()));
                }
                Ok(MatchVerdict { matched, distance })
            }
        }
    }

    /// First call hangs far beyond the test horizon and would report a
    /// non-match; later calls answer instantly with a match.
    struct SlowThenInstantMatcher {
        calls: Arc<AtomicUsize>,
    }

    impl IdentityMatcher for SlowThenInstantMatcher {
        fn compare(
            &self,
            _frame: &CapturedFrame,
            _reference: &Reference,
        ) -> impl std::future::Future<Output = Result<MatchVerdict, MatchError>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    time::sleep(Duration::from_secs(3600)).await;
                    Ok(MatchVerdict {
                        matched: false,
                        distance: 0.99,
                    })
                } else {
                    Ok(MatchVerdict {
                        matched: true,
                        distance: 0.20,
                    })
                }
            }
        }
    }

    fn reference() -> Reference {
        Reference::Descriptor(Embedding::new(vec![0.0; DESCRIPTOR_DIM]))
    }

    fn sequencer(kinds: &[GestureKind]) -> ChallengeSequencer {
        let config = SequencerConfig {
            plan: ChallengePlan::Fixed(kinds.to_vec()),
            timeout: STEP_TIMEOUT,
            ..Default::default()
        };
        ChallengeSequencer::start(config, GestureConfig::default(), now())
    }

    async fn feed(tx: &mpsc::Sender<LandmarkFrame>, frame: LandmarkFrame) {
        tx.send(frame).await.unwrap();
        // Let the driver drain the frame before the clock moves on.
        time::sleep(Duration::from_millis(1)).await;
    }

    // ── Scenarios ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn full_gesture_sequence_ends_verified() {
        let seq = sequencer(&[
            GestureKind::Blink,
            GestureKind::TurnLeft,
            GestureKind::TurnRight,
            GestureKind::MouthOpen,
        ]);
        let (driver, status) =
            SessionDriver::new(seq, StubCapture, StubMatcher::verdict(true, 0.31), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (_retry_tx, retry_rx) = mpsc::channel(1);
        let started = Instant::now();
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        // t ≈ 500 ms: blink (close then reopen)
        time::sleep(Duration::from_millis(500)).await;
        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        // t ≈ 1500 ms: turn left (baseline, then -40 units)
        time::sleep(Duration::from_millis(998)).await;
        feed(&frames_tx, face(0.03, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.03, 460.0, 0.0)).await;

        // t ≈ 2500 ms: turn right
        time::sleep(Duration::from_millis(998)).await;
        feed(&frames_tx, face(0.03, 480.0, 0.0)).await;
        feed(&frames_tx, face(0.03, 520.0, 0.0)).await;

        // t ≈ 3500 ms: mouth open
        time::sleep(Duration::from_millis(998)).await;
        feed(&frames_tx, face(0.03, 500.0, 0.04)).await;

        let phase = handle.await.unwrap();
        assert_eq!(phase, Phase::Verified);

        let last = status.borrow();
        assert_eq!(last.phase, Phase::Verified);
        assert_eq!(last.step, 4);
        assert_eq!(last.required, 4);
        assert_eq!(last.distance, Some(0.31));

        // Liveness concluded around the mouth-open frame, well inside the
        // per-step timeout.
        let elapsed = Instant::now() - started;
        assert!(elapsed >= Duration::from_millis(3500));
        assert!(elapsed < Duration::from_millis(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn no_gesture_within_timeout_ends_failed() {
        let seq = sequencer(&[GestureKind::Blink]);
        let (driver, status) =
            SessionDriver::new(seq, StubCapture, StubMatcher::verdict(true, 0.1), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (retry_tx, retry_rx) = mpsc::channel(1);
        let started = Instant::now();
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        // Frames arrive, but none completes a blink cycle
        for _ in 0..4 {
            time::sleep(Duration::from_millis(1000)).await;
            feed(&frames_tx, neutral()).await;
        }

        drop(retry_tx);
        let phase = handle.await.unwrap();
        assert_eq!(phase, Phase::Failed);
        assert_eq!(status.borrow().phase, Phase::Failed);
        assert!(Instant::now() - started >= STEP_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn matched_verdict_ends_verified() {
        let seq = sequencer(&[GestureKind::Blink]);
        let (driver, status) =
            SessionDriver::new(seq, StubCapture, StubMatcher::verdict(true, 0.31), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (_retry_tx, retry_rx) = mpsc::channel(1);
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        assert_eq!(handle.await.unwrap(), Phase::Verified);
        assert_eq!(status.borrow().distance, Some(0.31));
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_verdict_ends_rejected() {
        let seq = sequencer(&[GestureKind::Blink]);
        let (driver, status) =
            SessionDriver::new(seq, StubCapture, StubMatcher::verdict(false, 0.72), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (_retry_tx, retry_rx) = mpsc::channel(1);
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        assert_eq!(handle.await.unwrap(), Phase::Rejected);
        assert_eq!(status.borrow().distance, Some(0.72));
    }

    #[tokio::test(start_paused = true)]
    async fn matcher_failure_degrades_to_rejected() {
        let seq = sequencer(&[GestureKind::Blink]);
        let (driver, status) =
            SessionDriver::new(seq, StubCapture, StubMatcher::failing(), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (_retry_tx, retry_rx) = mpsc::channel(1);
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        assert_eq!(handle.await.unwrap(), Phase::Rejected);
        assert_eq!(status.borrow().distance, None);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_failure_degrades_to_rejected() {
        let seq = sequencer(&[GestureKind::Blink]);
        let (driver, _status) =
            SessionDriver::new(seq, FailingCapture, StubMatcher::verdict(true, 0.1), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (_retry_tx, retry_rx) = mpsc::channel(1);
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        assert_eq!(handle.await.unwrap(), Phase::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_timeout_restarts_and_verifies() {
        let seq = sequencer(&[GestureKind::Blink]);
        let (driver, status) =
            SessionDriver::new(seq, StubCapture, StubMatcher::verdict(true, 0.25), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (retry_tx, retry_rx) = mpsc::channel(1);
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        // Let the first attempt time out
        time::sleep(STEP_TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(status.borrow().phase, Phase::Failed);

        retry_tx.send(()).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(status.borrow().phase, Phase::Running);
        assert_eq!(status.borrow().step, 1);

        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        assert_eq!(handle.await.unwrap(), Phase::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_during_matching_discards_stale_verdict() {
        let calls = Arc::new(AtomicUsize::new(0));
        let matcher = SlowThenInstantMatcher {
            calls: calls.clone(),
        };
        let seq = sequencer(&[GestureKind::Blink]);
        let (driver, status) = SessionDriver::new(seq, StubCapture, matcher, reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (retry_tx, retry_rx) = mpsc::channel(1);
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        // First attempt reaches MATCHING; the verdict is pending
        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;
        assert_eq!(status.borrow().phase, Phase::Matching);

        // Retry cancels the pending call and restarts liveness
        retry_tx.send(()).await.unwrap();
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(status.borrow().phase, Phase::Running);

        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        // The stale non-match from the first call never lands
        assert_eq!(handle.await.unwrap(), Phase::Verified);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_face_frames_are_skipped_not_fatal() {
        let seq = sequencer(&[GestureKind::Blink]);
        let (driver, _status) =
            SessionDriver::new(seq, StubCapture, StubMatcher::verdict(true, 0.1), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (_retry_tx, retry_rx) = mpsc::channel(1);
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        // Empty frames (no face) interleave with the blink and change
        // nothing
        feed(&frames_tx, LandmarkFrame::default()).await;
        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, LandmarkFrame::default()).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        assert_eq!(handle.await.unwrap(), Phase::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_published_per_satisfied_gesture() {
        let seq = sequencer(&[GestureKind::Blink, GestureKind::MouthOpen]);
        let (driver, mut status) =
            SessionDriver::new(seq, StubCapture, StubMatcher::verdict(true, 0.1), reference());
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (_retry_tx, retry_rx) = mpsc::channel(1);
        let handle = tokio::spawn(driver.run(frames_rx, retry_rx));

        assert_eq!(status.borrow().step, 1);
        assert_eq!(
            status.borrow().prompt,
            Some(GestureKind::Blink.prompt())
        );

        feed(&frames_tx, face(0.004, 500.0, 0.0)).await;
        feed(&frames_tx, face(0.030, 500.0, 0.0)).await;

        status.changed().await.unwrap();
        {
            let snapshot = status.borrow();
            assert_eq!(snapshot.step, 2);
            assert_eq!(snapshot.prompt, Some(GestureKind::MouthOpen.prompt()));
        }

        feed(&frames_tx, face(0.03, 500.0, 0.04)).await;
        assert_eq!(handle.await.unwrap(), Phase::Verified);
    }
}
