use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

use presence_core::{CapturedFrame, Embedding, LandmarkFrame, Point};

use crate::config::{Config, MatcherMode};
use crate::engine::EngineHandle;
use crate::store::EnrollmentStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: EnrollmentStore,
}

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
pub struct PresenceService {
    pub state: Arc<Mutex<AppState>>,
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Enroll a face descriptor for the given user.
    ///
    /// `descriptor_json` is a JSON array of 128 floats. Returns the
    /// UUID of the new enrollment.
    async fn enroll(
        &self,
        user: &str,
        label: &str,
        descriptor_json: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(user, label, "enroll requested");

        let values: Vec<f32> = serde_json::from_str(descriptor_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad descriptor JSON: {e}")))?;

        let state = self.state.lock().await;
        let id = state
            .store
            .insert_descriptor(user, label, &Embedding::new(values))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "enroll: store insert failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        tracing::info!(enrollment = %id, user, label, "enrolled descriptor");
        Ok(id)
    }

    /// Enroll a reference photo URL for the given user, for use with
    /// the external comparison service.
    async fn enroll_photo(
        &self,
        user: &str,
        label: &str,
        photo_url: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(user, label, "enroll_photo requested");

        let state = self.state.lock().await;
        let id = state
            .store
            .insert_photo(user, label, photo_url)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "enroll_photo: store insert failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        tracing::info!(enrollment = %id, user, label, "enrolled photo reference");
        Ok(id)
    }

    /// Start a verification session for the given user.
    ///
    /// Returns once the session is running; callers stream landmark
    /// frames via `push_frame` and poll progress via `session`.
    async fn verify(&self, user: &str) -> zbus::fdo::Result<()> {
        tracing::info!(user, "verify requested");

        let (engine, reference) = {
            let state = self.state.lock().await;
            let reference = state.store.reference_for_user(user).await.map_err(|e| {
                tracing::error!(error = %e, "verify: reference fetch failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;
            (state.engine.clone(), reference)
        };

        let Some(reference) = reference else {
            tracing::warn!(user, "verify: no enrollment");
            return Err(zbus::fdo::Error::Failed(format!(
                "no enrollment for user '{user}'"
            )));
        };

        engine
            .start_verify(user.to_string(), reference)
            .await
            .map_err(|e| {
                tracing::warn!(user, error = %e, "verify refused");
                zbus::fdo::Error::Failed(e.to_string())
            })
    }

    /// Deliver one landmark frame to the active session.
    ///
    /// `points_json` is a JSON array of `{"x": f, "y": f}` objects in
    /// normalized coordinates; an empty array means no face was
    /// detected. `snapshot` carries the encoded video frame the
    /// landmarks came from and may be empty when the source has no
    /// image for this tick.
    async fn push_frame(
        &self,
        points_json: &str,
        snapshot: Vec<u8>,
        width: u32,
        height: u32,
    ) -> zbus::fdo::Result<()> {
        let points: Vec<Point> = serde_json::from_str(points_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad landmarks JSON: {e}")))?;

        let frame = if snapshot.is_empty() {
            None
        } else {
            Some(CapturedFrame {
                data: snapshot,
                width,
                height,
            })
        };

        let engine = self.state.lock().await.engine.clone();
        engine.push_frame(LandmarkFrame::new(points), frame).await;
        Ok(())
    }

    /// Retry the active session after a liveness failure.
    async fn retry(&self) -> zbus::fdo::Result<()> {
        tracing::info!("retry requested");
        let engine = self.state.lock().await.engine.clone();
        engine
            .retry()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Progress of the active session as JSON (the final snapshot of
    /// the last session once it ends), or `null` when none has run.
    async fn session(&self) -> zbus::fdo::Result<String> {
        let engine = self.state.lock().await.engine.clone();
        let status = engine
            .status()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let enrollments = state.store.count_all().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrollments": enrollments,
            "matcher": match state.config.matcher_mode {
                MatcherMode::Descriptor => "descriptor",
                MatcherMode::Compare => "compare",
            },
            "match_threshold": state.config.match_threshold,
            "required_gestures": state.config.required_gestures,
            "challenge_timeout_ms": state.config.challenge_timeout_ms,
        })
        .to_string())
    }

    /// List enrollments for the given user as JSON.
    async fn list_enrollments(&self, user: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user, "list_enrollments requested");
        let state = self.state.lock().await;
        let enrollments = state
            .store
            .list_by_user(user)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&enrollments).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Remove an enrollment by ID (scoped to user).
    async fn remove_enrollment(&self, user: &str, enrollment_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(user, enrollment_id, "remove_enrollment requested");
        let state = self.state.lock().await;
        let removed = state
            .store
            .remove(user, enrollment_id)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if removed {
            tracing::info!(enrollment_id, "enrollment removed");
        } else {
            tracing::warn!(enrollment_id, user, "enrollment not found or not owned by user");
        }
        Ok(removed)
    }
}
