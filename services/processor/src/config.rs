//! Configuration management for the video event processor.
//!
//! Values are loaded from defaults, optional config files and environment
//! variables (prefixed with `VIGIL`, sections separated by `__`).

use crate::frame_selector::{SelectionPolicy, SelectionStrategy};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling for one S3 `DeleteObjects` request.
pub const MAX_DELETE_BATCH: usize = 1000;

/// Main configuration for the processor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Frame sampling configuration
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Classifier gateway configuration
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Event selection configuration
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Local resource limits
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Alert notification configuration
    #[serde(default)]
    pub notification: NotificationConfig,
    /// Explicit source override, used when not driven by a storage event
    #[serde(default)]
    pub trigger: TriggerOverride,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port, exporter disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Bucket for sampled frames; the source video's bucket when unset
    #[serde(default)]
    pub frame_bucket: Option<String>,
    /// Key prefix under which each job writes its frames
    #[serde(default = "default_frame_prefix")]
    pub frame_prefix: String,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Keys per delete request
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
    /// Delete requests in flight
    #[serde(default = "default_delete_concurrency")]
    pub delete_concurrency: usize,
}

/// Which decoder backs the frame sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// External ffmpeg/ffprobe processes
    Ffmpeg,
    /// In-process GStreamer pipeline (requires the `gstreamer` feature)
    Gstreamer,
}

/// Frame sampling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Frames to keep per second of source video
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Source frame rate assumed when the decoder cannot report one
    #[serde(default = "default_fallback_source_fps")]
    pub fallback_source_fps: f64,
    /// JPEG quality for emitted frames (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Decoder implementation
    #[serde(default = "default_decoder")]
    pub decoder: DecoderKind,
    /// ffmpeg binary (name on PATH or absolute path)
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,
    /// ffprobe binary (name on PATH or absolute path)
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,
}

/// Classifier gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Inference endpoint accepting batched classification requests
    #[serde(default)]
    pub endpoint: String,
    /// Model identifier forwarded with each request
    #[serde(default)]
    pub model_id: Option<String>,
    /// Bearer token for the inference endpoint
    #[serde(default)]
    pub api_token: Option<String>,
    /// Frames per request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Requests in flight
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Send frame bytes inline instead of storage references
    #[serde(default = "default_true")]
    pub inline_images: bool,
}

/// Event selection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    /// Label that marks a frame as part of an event
    #[serde(default = "default_target_label")]
    pub target_label: String,
    /// Minimum confidence for an event frame (inclusive)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Retention strategy
    #[serde(default)]
    pub strategy: SelectionStrategy,
}

/// Local resource limits
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    /// Largest source video accepted, checked before download
    #[serde(default = "default_max_video_size_bytes")]
    pub max_video_size_bytes: u64,
    /// Local bytes a job may hold at any instant
    #[serde(default = "default_ephemeral_ceiling_bytes")]
    pub ephemeral_ceiling_bytes: u64,
    /// Parent directory for per-job working directories
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Whole-job timeout in seconds
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

/// Alert notification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// SNS topic for event alerts; alerts are disabled when unset
    #[serde(default)]
    pub topic_arn: Option<String>,
    /// Subject line prefix
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

/// Explicit `{container, key}` pair overriding any trigger document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerOverride {
    pub container: Option<String>,
    pub key: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "vigil-processor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_frame_prefix() -> String {
    "frames".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    86_400 // 24 hours
}

fn default_delete_batch_size() -> usize {
    MAX_DELETE_BATCH
}

fn default_delete_concurrency() -> usize {
    4
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_fallback_source_fps() -> f64 {
    30.0
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_decoder() -> DecoderKind {
    DecoderKind::Ffmpeg
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_batch_size() -> usize {
    4
}

fn default_max_in_flight() -> usize {
    2
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_target_label() -> String {
    "crash".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.9
}

fn default_max_video_size_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_ephemeral_ceiling_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_work_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_job_timeout_secs() -> u64 {
    900
}

fn default_subject_prefix() -> String {
    "Event detected".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            frame_bucket: None,
            frame_prefix: default_frame_prefix(),
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            delete_batch_size: default_delete_batch_size(),
            delete_concurrency: default_delete_concurrency(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            fallback_source_fps: default_fallback_source_fps(),
            jpeg_quality: default_jpeg_quality(),
            decoder: default_decoder(),
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model_id: None,
            api_token: None,
            batch_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
            request_timeout_secs: default_request_timeout_secs(),
            inline_images: true,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            target_label: default_target_label(),
            confidence_threshold: default_confidence_threshold(),
            strategy: SelectionStrategy::default(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_video_size_bytes: default_max_video_size_bytes(),
            ephemeral_ceiling_bytes: default_ephemeral_ceiling_bytes(),
            work_root: default_work_root(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            topic_arn: None,
            subject_prefix: default_subject_prefix(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/processor").required(false))
            .add_source(config::File::with_name("/etc/vigil/processor").required(false))
            // VIGIL__SAMPLING__SAMPLE_RATE -> sampling.sample_rate
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.classifier.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "classifier.endpoint".to_string(),
            ));
        }

        if !(self.sampling.sample_rate > 0.0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.sample_rate".to_string(),
                message: "Sample rate must be greater than 0".to_string(),
            });
        }

        if !(self.sampling.fallback_source_fps > 0.0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.fallback_source_fps".to_string(),
                message: "Fallback FPS must be greater than 0".to_string(),
            });
        }

        if self.sampling.jpeg_quality == 0 || self.sampling.jpeg_quality > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.classifier.batch_size == 0 || self.classifier.max_in_flight == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "classifier.batch_size/max_in_flight".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.classifier.request_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "classifier.request_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.resources.job_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "resources.job_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.selection.confidence_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "selection.confidence_threshold".to_string(),
                message: "Threshold must be within [0, 1]".to_string(),
            });
        }

        if self.selection.target_label.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "selection.target_label".to_string(),
            ));
        }

        if self.storage.delete_batch_size == 0 || self.storage.delete_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.delete_batch_size/delete_concurrency".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.resources.max_video_size_bytes > self.resources.ephemeral_ceiling_bytes {
            return Err(ConfigValidationError::InvalidValue {
                field: "resources.max_video_size_bytes".to_string(),
                message: "Must not exceed resources.ephemeral_ceiling_bytes".to_string(),
            });
        }

        if cfg!(not(feature = "gstreamer")) && self.sampling.decoder == DecoderKind::Gstreamer {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.decoder".to_string(),
                message: "Built without the gstreamer feature".to_string(),
            });
        }

        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_expiry_secs)
    }

    /// Get the whole-job timeout as Duration
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.resources.job_timeout_secs)
    }

    /// Keys per delete request, clamped to the S3 limit
    pub fn delete_batch_size(&self) -> usize {
        self.storage.delete_batch_size.min(MAX_DELETE_BATCH)
    }

    /// Selection policy for this process
    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            target_label: self.selection.target_label.clone(),
            confidence_threshold: self.selection.confidence_threshold,
            strategy: self.selection.strategy,
        }
    }
}

impl ClassifierConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.classifier.endpoint = "http://classifier:8080/v1/classify".to_string();
        config
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_sample_rate(), 1.0);
        assert_eq!(default_fallback_source_fps(), 30.0);
        assert_eq!(default_batch_size(), 4);
        assert_eq!(default_confidence_threshold(), 0.9);
        assert_eq!(default_target_label(), "crash");
        assert_eq!(default_delete_batch_size(), 1000);
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert_ok!(config.validate());
    }

    #[test]
    fn test_missing_classifier_endpoint() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_threshold() {
        let mut config = create_test_config();
        config.selection.confidence_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = create_test_config();
        config.resources.job_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { ref field, .. }) if field == "resources.job_timeout_secs"
        ));

        let mut config = create_test_config();
        config.classifier.request_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { ref field, .. }) if field == "classifier.request_timeout_secs"
        ));
    }

    #[test]
    fn test_video_limit_must_fit_ceiling() {
        let mut config = create_test_config();
        config.resources.max_video_size_bytes = config.resources.ephemeral_ceiling_bytes + 1;
        assert_err!(config.validate());
    }

    #[test]
    fn test_delete_batch_size_is_clamped() {
        let mut config = create_test_config();
        config.storage.delete_batch_size = 5000;
        assert_eq!(config.delete_batch_size(), MAX_DELETE_BATCH);
        config.storage.delete_batch_size = 10;
        assert_eq!(config.delete_batch_size(), 10);
    }

    #[test]
    fn test_strategy_deserializes_kebab_case() {
        let selection: SelectionConfig =
            serde_json::from_str(r#"{"strategy": "multi-or-nothing"}"#).unwrap();
        assert_eq!(selection.strategy, SelectionStrategy::MultiOrNothing);
        assert_eq!(selection.target_label, "crash");
    }
}
