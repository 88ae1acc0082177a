//! Trigger documents naming the video a job should process.
//!
//! Three shapes are accepted:
//! - an S3 event notification (`Records[0].s3.bucket.name` / `Records[0].s3.object.key`)
//! - `{"source_locator": {"container": ..., "key": ...}}`
//! - `{"input_bucket": ..., "key": ...}`
//!
//! The `trigger.container` / `trigger.key` config pair overrides whatever the
//! document says.

use crate::config::TriggerOverride;
use crate::object_store::ObjectLocator;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Invalid trigger document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Trigger does not name a source video")]
    MissingSource,

    #[error("Object key is not valid UTF-8 after decoding: {0}")]
    KeyEncoding(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TriggerDocument {
    S3Event {
        #[serde(rename = "Records")]
        records: Vec<S3Record>,
    },
    Direct {
        source_locator: ObjectLocator,
    },
    Orchestrator {
        input_bucket: String,
        key: String,
    },
}

#[derive(Debug, Deserialize)]
struct S3Record {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

/// Keys in S3 event notifications are form-encoded.
fn decode_event_key(raw: &str) -> Result<String, TriggerError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| TriggerError::KeyEncoding(e.to_string()))
}

fn parse_document(document: &str) -> Result<ObjectLocator, TriggerError> {
    match serde_json::from_str::<TriggerDocument>(document)? {
        TriggerDocument::S3Event { records } => {
            let record = records.into_iter().next().ok_or(TriggerError::MissingSource)?;
            Ok(ObjectLocator::new(
                record.s3.bucket.name,
                decode_event_key(&record.s3.object.key)?,
            ))
        }
        TriggerDocument::Direct { source_locator } => Ok(source_locator),
        TriggerDocument::Orchestrator { input_bucket, key } => Ok(ObjectLocator::new(input_bucket, key)),
    }
}

/// Resolve the source video from an optional trigger document and the override pair.
pub fn resolve_source(
    document: Option<&str>,
    overrides: &TriggerOverride,
) -> Result<ObjectLocator, TriggerError> {
    if let (Some(container), Some(key)) = (&overrides.container, &overrides.key) {
        return Ok(ObjectLocator::new(container.clone(), key.clone()));
    }

    let document = document
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or(TriggerError::MissingSource)?;
    let mut source = parse_document(document)?;

    if let Some(container) = &overrides.container {
        source.container = container.clone();
    }
    if let Some(key) = &overrides.key {
        source.key = key.clone();
    }

    if source.container.is_empty() || source.key.is_empty() {
        return Err(TriggerError::MissingSource);
    }
    Ok(source)
}
