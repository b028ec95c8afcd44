//! HTTP clients for the embedding and photo-comparison services.
//!
//! Both endpoints take the captured frame as base64 JPEG/PNG bytes.
//! Requests run on the blocking pool so the engine task never stalls
//! on network I/O.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::future::Future;

use presence_core::{
    CapturedFrame, Embedding, EmbeddingExtractor, IdentityMatcher, MatchError, MatchVerdict,
    Reference, DESCRIPTOR_DIM,
};

/// Extracts face descriptors from an embedding service.
///
/// `POST {url}` with `{"image": "<base64>"}`, expects
/// `{"descriptor": [f32; 128]}`.
#[derive(Clone)]
pub struct HttpEmbeddingExtractor {
    url: String,
}

impl HttpEmbeddingExtractor {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[derive(Deserialize)]
struct EmbedResponse {
    descriptor: Vec<f32>,
}

impl EmbeddingExtractor for HttpEmbeddingExtractor {
    fn extract(
        &self,
        frame: &CapturedFrame,
    ) -> impl Future<Output = Result<Embedding, MatchError>> + Send {
        let url = self.url.clone();
        let image = BASE64.encode(&frame.data);

        async move {
            let response: EmbedResponse = tokio::task::spawn_blocking(move || {
                let payload = serde_json::json!({ "image": image });
                let resp = ureq::post(&url)
                    .send_json(&payload)
                    .map_err(|e| MatchError::ServiceUnavailable(e.to_string()))?;
                resp.into_body()
                    .read_json::<EmbedResponse>()
                    .map_err(|e| MatchError::Extraction(e.to_string()))
            })
            .await
            .map_err(|e| MatchError::Extraction(format!("embed task panicked: {e}")))??;

            if response.descriptor.len() != DESCRIPTOR_DIM {
                return Err(MatchError::DimensionMismatch {
                    got: response.descriptor.len(),
                    expected: DESCRIPTOR_DIM,
                });
            }

            Ok(Embedding::new(response.descriptor))
        }
    }
}

/// Defers the match verdict to an external photo-comparison service.
///
/// `POST {url}` with `{"image": "<base64>", "reference_url": "..."}`,
/// expects `{"match": bool, "distance": f32}`.
#[derive(Clone)]
pub struct HttpCompareMatcher {
    url: String,
}

impl HttpCompareMatcher {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[derive(Deserialize)]
struct CompareResponse {
    #[serde(rename = "match")]
    matched: bool,
    #[serde(default)]
    distance: f32,
}

impl IdentityMatcher for HttpCompareMatcher {
    fn compare(
        &self,
        frame: &CapturedFrame,
        reference: &Reference,
    ) -> impl Future<Output = Result<MatchVerdict, MatchError>> + Send {
        let url = self.url.clone();
        let image = BASE64.encode(&frame.data);
        let reference_url = match reference {
            Reference::ImageUrl(u) => Ok(u.clone()),
            Reference::Descriptor(_) => Err(MatchError::UnsupportedReference),
        };

        async move {
            let reference_url = reference_url?;

            let response: CompareResponse = tokio::task::spawn_blocking(move || {
                let payload = serde_json::json!({
                    "image": image,
                    "reference_url": reference_url,
                });
                let resp = ureq::post(&url)
                    .send_json(&payload)
                    .map_err(|e| MatchError::ServiceUnavailable(e.to_string()))?;
                resp.into_body()
                    .read_json::<CompareResponse>()
                    .map_err(|e| MatchError::ServiceUnavailable(e.to_string()))
            })
            .await
            .map_err(|e| MatchError::ServiceUnavailable(format!("compare task panicked: {e}")))??;

            tracing::debug!(
                matched = response.matched,
                distance = response.distance,
                "comparison service answered"
            );

            Ok(MatchVerdict {
                matched: response.matched,
                distance: response.distance,
            })
        }
    }
}

/// The configured identity-matching strategy, behind one matcher type
/// so the engine stays monomorphic.
#[derive(Clone)]
pub enum MatcherBackend {
    Descriptor(presence_core::DescriptorMatcher<HttpEmbeddingExtractor>),
    Compare(HttpCompareMatcher),
}

impl MatcherBackend {
    pub fn from_config(config: &crate::config::Config) -> Self {
        match config.matcher_mode {
            crate::config::MatcherMode::Descriptor => {
                Self::Descriptor(presence_core::DescriptorMatcher::new(
                    HttpEmbeddingExtractor::new(config.embed_url.clone()),
                    config.match_threshold,
                ))
            }
            crate::config::MatcherMode::Compare => {
                Self::Compare(HttpCompareMatcher::new(config.compare_url.clone()))
            }
        }
    }
}

impl IdentityMatcher for MatcherBackend {
    fn compare(
        &self,
        frame: &CapturedFrame,
        reference: &Reference,
    ) -> impl Future<Output = Result<MatchVerdict, MatchError>> + Send {
        async move {
            match self {
                Self::Descriptor(matcher) => matcher.compare(frame, reference).await,
                Self::Compare(matcher) => matcher.compare(frame, reference).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_response_reads_match_field() {
        let parsed: CompareResponse =
            serde_json::from_str(r#"{"match": true, "distance": 0.31}"#).unwrap();
        assert!(parsed.matched);
        assert!((parsed.distance - 0.31).abs() < 1e-6);
    }

    #[test]
    fn compare_response_distance_is_optional() {
        let parsed: CompareResponse = serde_json::from_str(r#"{"match": false}"#).unwrap();
        assert!(!parsed.matched);
        assert_eq!(parsed.distance, 0.0);
    }

    #[tokio::test]
    async fn compare_matcher_requires_photo_reference() {
        let matcher = HttpCompareMatcher::new("http://127.0.0.1:1/compare".into());
        let frame = CapturedFrame {
            data: vec![0u8; 8],
            width: 2,
            height: 2,
        };
        let err = matcher
            .compare(
                &frame,
                &Reference::Descriptor(Embedding::new(vec![0.0; DESCRIPTOR_DIM])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::UnsupportedReference));
    }
}
