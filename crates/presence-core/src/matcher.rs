//! Identity matching against an enrolled reference.
//!
//! Two strategies satisfy the same contract: in-process descriptor
//! distance (a fixed-length embedding compared against the enrolled
//! one) and deferral to an external photo-comparison service. The
//! session driver only sees [`IdentityMatcher`]; which strategy backs
//! it is a deployment choice.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a face descriptor vector.
pub const DESCRIPTOR_DIM: usize = 128;

/// Default descriptor distance below which two faces count as the same
/// person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum MatchError {
    /// The external matcher could not be reached or answered with an
    /// error. The session maps this to REJECTED; it is never retried
    /// automatically.
    #[error("identity match service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("embedding extraction failed: {0}")]
    Extraction(String),
    #[error("descriptor dimension mismatch: got {got}, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },
    #[error("reference kind not supported by this matcher")]
    UnsupportedReference,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The video source is gone. Before a session starts this is a
    /// precondition failure; at capture time it degrades the session to
    /// REJECTED.
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("no frame available to capture")]
    NoFrame,
}

/// A fixed-length face descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance to another descriptor of the same length.
    pub fn distance(&self, other: &Embedding) -> Result<f32, MatchError> {
        if self.values.len() != other.values.len() {
            return Err(MatchError::DimensionMismatch {
                got: self.values.len(),
                expected: other.values.len(),
            });
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        Ok(sum.sqrt())
    }
}

/// A still image frozen at the moment liveness passed. Never mutated
/// after capture.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// The enrolled identity evidence the matcher compares against.
#[derive(Debug, Clone)]
pub enum Reference {
    Descriptor(Embedding),
    ImageUrl(String),
}

/// Terminal result of one identity comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchVerdict {
    pub matched: bool,
    pub distance: f32,
}

/// Returns a single still image from the active video source at the
/// time of the call.
pub trait FrameCapture: Send {
    fn capture(&mut self) -> Result<CapturedFrame, CaptureError>;
}

/// Computes a fixed-length descriptor from a captured frame. External
/// collaborator — typically an embedding model behind a service.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(
        &self,
        frame: &CapturedFrame,
    ) -> impl Future<Output = Result<Embedding, MatchError>> + Send;
}

/// Compares a captured frame against the enrolled reference.
pub trait IdentityMatcher: Send + Sync {
    fn compare(
        &self,
        frame: &CapturedFrame,
        reference: &Reference,
    ) -> impl Future<Output = Result<MatchVerdict, MatchError>> + Send;
}

/// Descriptor-distance matching: embed the captured frame and compare
/// by Euclidean distance to the enrolled descriptor.
#[derive(Clone)]
pub struct DescriptorMatcher<E> {
    extractor: E,
    threshold: f32,
}

impl<E> DescriptorMatcher<E> {
    pub fn new(extractor: E, threshold: f32) -> Self {
        Self {
            extractor,
            threshold,
        }
    }
}

impl<E: EmbeddingExtractor> IdentityMatcher for DescriptorMatcher<E> {
    fn compare(
        &self,
        frame: &CapturedFrame,
        reference: &Reference,
    ) -> impl Future<Output = Result<MatchVerdict, MatchError>> + Send {
        async move {
            let Reference::Descriptor(enrolled) = reference else {
                return Err(MatchError::UnsupportedReference);
            };
            let live = self.extractor.extract(frame).await?;
            let distance = live.distance(enrolled)?;
            tracing::debug!(distance, threshold = self.threshold, "descriptor compared");
            Ok(MatchVerdict {
                matched: distance < self.threshold,
                distance,
            })
        }
    }
}
