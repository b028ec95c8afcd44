//! The verification engine task.
//!
//! One tokio task owns all session state. D-Bus handlers talk to it
//! through a clone-safe [`EngineHandle`]; frames, retries and status
//! queries are messages, so no lock is ever held across an await.
//!
//! At most one session runs at a time. Starting a new verification
//! while another is active drops the old session's channels, which
//! winds the old driver down to a terminal phase on its own.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use presence_core::{
    CaptureError, CapturedFrame, ChallengeSequencer, FrameCapture, GestureConfig, IdentityMatcher,
    LandmarkFrame, Phase, Reference, SequencerConfig, SessionDriver, SessionStatus,
};

use crate::rate_limiter::RateLimiter;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    RateLimited(String),
    #[error("no verification session is active")]
    NoSession,
    #[error("engine task exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine task.
enum EngineRequest {
    StartVerify {
        user: String,
        reference: Reference,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Frame {
        landmarks: LandmarkFrame,
        snapshot: Option<CapturedFrame>,
    },
    Retry {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Option<SessionStatus>>,
    },
    SessionEnded {
        id: u64,
        user: String,
        phase: Phase,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Start a verification session for a user. Returns once the
    /// session is running; progress is observed via [`Self::status`].
    pub async fn start_verify(
        &self,
        user: String,
        reference: Reference,
    ) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::StartVerify {
                user,
                reference,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Deliver one landmark frame, optionally refreshing the snapshot
    /// used for capture. Dropped without error when no session is
    /// active or the driver is busy — only the latest pose matters.
    pub async fn push_frame(&self, landmarks: LandmarkFrame, snapshot: Option<CapturedFrame>) {
        let _ = self
            .tx
            .send(EngineRequest::Frame {
                landmarks,
                snapshot,
            })
            .await;
    }

    /// Request an explicit retry of the active session.
    pub async fn retry(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Retry { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Latest status snapshot: the active session's progress, or the
    /// final snapshot of the last ended session.
    pub async fn status(&self) -> Result<Option<SessionStatus>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Serves the most recently pushed video frame to the session driver
/// at capture time.
struct LatestFrameCapture {
    slot: Arc<Mutex<Option<CapturedFrame>>>,
}

impl FrameCapture for LatestFrameCapture {
    fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
        self.slot
            .lock()
            .map_err(|_| CaptureError::CameraUnavailable("snapshot slot poisoned".into()))?
            .clone()
            .ok_or(CaptureError::NoFrame)
    }
}

struct ActiveSession {
    id: u64,
    user: String,
    frames_tx: mpsc::Sender<LandmarkFrame>,
    retry_tx: mpsc::Sender<()>,
    status_rx: watch::Receiver<SessionStatus>,
    snapshot: Arc<Mutex<Option<CapturedFrame>>>,
}

struct Engine<M> {
    matcher: M,
    gesture_config: GestureConfig,
    sequencer_config: SequencerConfig,
    limiter: RateLimiter,
    active: Option<ActiveSession>,
    /// Final snapshot of the most recently ended session, kept so
    /// clients polling after the verdict still see it.
    last_status: Option<SessionStatus>,
    next_id: u64,
    tx: mpsc::Sender<EngineRequest>,
}

/// Spawn the engine task and return a handle to it.
pub fn spawn_engine<M>(
    matcher: M,
    gesture_config: GestureConfig,
    sequencer_config: SequencerConfig,
) -> EngineHandle
where
    M: IdentityMatcher + Clone + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    let mut engine = Engine {
        matcher,
        gesture_config,
        sequencer_config,
        limiter: RateLimiter::new(),
        active: None,
        last_status: None,
        next_id: 0,
        tx: tx.clone(),
    };

    tokio::spawn(async move {
        tracing::info!("engine task started");
        while let Some(req) = rx.recv().await {
            engine.handle(req).await;
        }
        tracing::info!("engine task exiting");
    });

    EngineHandle { tx }
}

impl<M> Engine<M>
where
    M: IdentityMatcher + Clone + Send + Sync + 'static,
{
    async fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::StartVerify {
                user,
                reference,
                reply,
            } => {
                let _ = reply.send(self.start_session(user, reference));
            }
            EngineRequest::Frame {
                landmarks,
                snapshot,
            } => {
                let Some(active) = &self.active else {
                    return;
                };
                if let Some(frame) = snapshot {
                    if let Ok(mut slot) = active.snapshot.lock() {
                        *slot = Some(frame);
                    }
                }
                // Capacity-1 channel: when the driver is busy the frame
                // is dropped, never queued.
                let _ = active.frames_tx.try_send(landmarks);
            }
            EngineRequest::Retry { reply } => {
                let result = match &self.active {
                    Some(active) => {
                        let _ = active.retry_tx.try_send(());
                        Ok(())
                    }
                    None => Err(EngineError::NoSession),
                };
                let _ = reply.send(result);
            }
            EngineRequest::Status { reply } => {
                let status = self
                    .active
                    .as_ref()
                    .map(|active| active.status_rx.borrow().clone())
                    .or_else(|| self.last_status.clone());
                let _ = reply.send(status);
            }
            EngineRequest::SessionEnded { id, user, phase } => {
                match phase {
                    Phase::Verified => self.limiter.record_success(&user),
                    Phase::Rejected => self.limiter.record_rejection(&user),
                    _ => {}
                }
                // A stale id means the session was already replaced.
                if self.active.as_ref().is_some_and(|a| a.id == id) {
                    let ended = self.active.take();
                    self.last_status = ended.map(|a| a.status_rx.borrow().clone());
                }
                tracing::info!(user, phase = phase.as_str(), "session ended");
            }
        }
    }

    fn start_session(&mut self, user: String, reference: Reference) -> Result<(), EngineError> {
        self.limiter.check(&user).map_err(EngineError::RateLimited)?;

        if let Some(old) = self.active.take() {
            tracing::warn!(
                old_user = old.user,
                new_user = user,
                "replacing active session"
            );
            // Dropping the channels here lets the old driver reach a
            // terminal phase on its own.
        }

        self.last_status = None;
        self.next_id += 1;
        let id = self.next_id;

        let sequencer = ChallengeSequencer::start(
            self.sequencer_config.clone(),
            self.gesture_config.clone(),
            std::time::Instant::now(),
        );

        let snapshot = Arc::new(Mutex::new(None));
        let capture = LatestFrameCapture {
            slot: Arc::clone(&snapshot),
        };

        let (driver, status_rx) =
            SessionDriver::new(sequencer, capture, self.matcher.clone(), reference);

        let (frames_tx, frames_rx) = mpsc::channel(1);
        let (retry_tx, retry_rx) = mpsc::channel(1);

        let engine_tx = self.tx.clone();
        let session_user = user.clone();
        tokio::spawn(async move {
            let phase = driver.run(frames_rx, retry_rx).await;
            let _ = engine_tx
                .send(EngineRequest::SessionEnded {
                    id,
                    user: session_user,
                    phase,
                })
                .await;
        });

        tracing::info!(user, session = id, "verification session started");
        self.active = Some(ActiveSession {
            id,
            user,
            frames_tx,
            retry_tx,
            status_rx,
            snapshot,
        });
        Ok(())
    }
}
