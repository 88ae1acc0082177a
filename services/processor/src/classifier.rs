//! Classifier gateway.
//!
//! Frames are split into contiguous chunks of at most `batch_size`, each
//! chunk is one request to the classification backend, and up to
//! `max_in_flight` chunks run at once. Results are put back in frame order
//! before anything downstream sees them. A failed chunk only fails its own
//! frames.

use crate::config::ClassifierConfig;
use crate::job::{BoundingBox, Detection, LabelScore};
use crate::object_store::ObjectLocator;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors from a classification request.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Classification request failed: {0}")]
    Request(String),

    #[error("Classifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),

    #[error("Classifier returned {actual} results for {expected} images")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Confidence {confidence} for image {position} is outside [0, 1]")]
    ConfidenceOutOfRange { position: usize, confidence: f32 },
}

impl From<reqwest::Error> for ClassifierError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

/// An image handed to the classifier, by value or by storage reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    Inline(Bytes),
    Stored(ObjectLocator),
}

/// Per-image classifier verdict.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
    #[serde(default)]
    pub labels: Vec<LabelScore>,
    #[serde(default)]
    pub boxes: Vec<BoundingBox>,
}

impl Classification {
    pub fn into_detection(self, frame_index: u64) -> Detection {
        Detection {
            frame_index,
            label: self.label,
            confidence: self.confidence,
            labels: self.labels,
            boxes: self.boxes,
        }
    }
}

/// External classification capability: one result per input, in input order.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, batch: &[ImageInput]) -> Result<Vec<Classification>, ClassifierError>;
}

/// One frame queued for classification.
#[derive(Debug, Clone)]
pub struct ClassifierInput {
    pub frame_index: u64,
    pub image: ImageInput,
}

/// Contiguous chunks of at most `batch_size` items, in order.
pub fn partition<T>(items: &[T], batch_size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(batch_size.max(1))
}

/// Gateway output, already in frame-index order.
#[derive(Debug, Default)]
pub struct ClassificationOutcome {
    pub detections: Vec<Detection>,
    /// Frames whose chunk failed
    pub unclassified: Vec<u64>,
    pub chunks: usize,
    pub failed_chunks: usize,
}

/// Drives a [`Classifier`] over a job's frames.
pub struct ClassifierGateway {
    classifier: Arc<dyn Classifier>,
    batch_size: usize,
    max_in_flight: usize,
}

impl ClassifierGateway {
    pub fn new(classifier: Arc<dyn Classifier>, batch_size: usize, max_in_flight: usize) -> Self {
        Self {
            classifier,
            batch_size: batch_size.max(1),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Classify every frame. Never fails as a whole; failed chunks are reported
    /// in [`ClassificationOutcome::unclassified`].
    #[instrument(skip(self, frames), fields(frames = frames.len()))]
    pub async fn classify_frames(&self, frames: &[ClassifierInput]) -> ClassificationOutcome {
        let chunks: Vec<&[ClassifierInput]> = partition(frames, self.batch_size).collect();

        let mut results: Vec<(usize, Result<Vec<Classification>, ClassifierError>)> =
            stream::iter(chunks.iter().enumerate())
                .map(|(chunk_no, chunk)| async move {
                    let images: Vec<ImageInput> = chunk.iter().map(|f| f.image.clone()).collect();
                    let result = self.classify_chunk(&images).await;
                    (chunk_no, result)
                })
                .buffer_unordered(self.max_in_flight)
                .collect()
                .await;
        results.sort_by_key(|(chunk_no, _)| *chunk_no);

        let mut outcome = ClassificationOutcome {
            chunks: chunks.len(),
            ..Default::default()
        };

        for ((chunk_no, result), chunk) in results.into_iter().zip(&chunks) {
            match result {
                Ok(classifications) => {
                    outcome.detections.extend(
                        classifications
                            .into_iter()
                            .zip(chunk.iter())
                            .map(|(c, frame)| c.into_detection(frame.frame_index)),
                    );
                }
                Err(e) => {
                    warn!(
                        chunk = chunk_no,
                        first_frame = chunk.first().map(|f| f.frame_index),
                        size = chunk.len(),
                        error = %e,
                        "Classification chunk failed"
                    );
                    metrics::counter!("vigil.chunks.failed").increment(1);
                    outcome.failed_chunks += 1;
                    outcome.unclassified.extend(chunk.iter().map(|f| f.frame_index));
                }
            }
        }

        info!(
            chunks = outcome.chunks,
            failed_chunks = outcome.failed_chunks,
            classified = outcome.detections.len(),
            "Classification finished"
        );

        outcome
    }

    async fn classify_chunk(&self, images: &[ImageInput]) -> Result<Vec<Classification>, ClassifierError> {
        let classifications = self.classifier.classify(images).await?;

        if classifications.len() != images.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: images.len(),
                actual: classifications.len(),
            });
        }
        if let Some((position, c)) = classifications
            .iter()
            .enumerate()
            .find(|(_, c)| !(0.0..=1.0).contains(&c.confidence))
        {
            return Err(ClassifierError::ConfidenceOutOfRange {
                position,
                confidence: c.confidence,
            });
        }

        debug!(images = images.len(), "Chunk classified");
        Ok(classifications)
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    instances: Vec<PredictInstance<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum PredictInstance<'a> {
    Inline { image_base64: String },
    Stored { bucket: &'a str, key: &'a str },
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predictions: Vec<Classification>,
}

/// Classifier reached over HTTP/JSON.
///
/// Request: `{"model": ..., "instances": [{"image_base64": ...} | {"bucket": ..., "key": ...}]}`.
/// Response: `{"predictions": [{"label": ..., "confidence": ..., "labels": [...], "boxes": [...]}]}`.
pub struct HttpClassifier {
    http: reqwest::Client,
    endpoint: String,
    model_id: Option<String>,
    api_token: Option<String>,
}

impl HttpClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        info!(endpoint = %config.endpoint, model = ?config.model_id, "Classifier client initialized");

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model_id: config.model_id.clone(),
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, batch: &[ImageInput]) -> Result<Vec<Classification>, ClassifierError> {
        let instances = batch
            .iter()
            .map(|image| match image {
                ImageInput::Inline(bytes) => PredictInstance::Inline {
                    image_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
                },
                ImageInput::Stored(object) => PredictInstance::Stored {
                    bucket: &object.container,
                    key: &object.key,
                },
            })
            .collect();
        let body = PredictRequest {
            model: self.model_id.as_deref(),
            instances,
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;
        Ok(parsed.predictions)
    }
}
