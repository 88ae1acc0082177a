//! Vigil Processor
//!
//! Event-frame extraction for uploaded videos. A job takes one video from
//! object storage, samples frames at a fixed rate, classifies them through an
//! external inference endpoint, keeps only the frames that show the target
//! event and deletes the rest. When anything is kept, an alert with
//! time-limited links is published.
//!
//! ## Features
//!
//! - **Bounded Local Footprint**: Source size is checked from metadata before
//!   download; every staged byte is reserved against a per-job ceiling and the
//!   workspace is removed on every exit path
//! - **Pluggable Decoding**: ffmpeg subprocess decoder by default, in-process
//!   GStreamer behind the `gstreamer` feature
//! - **Chunked Classification**: Fixed-size batches with bounded concurrency;
//!   a failed chunk degrades the job instead of failing it
//! - **Event Selection**: `single-best` or `multi-or-nothing` retention
//! - **Batched Retention**: Rejected frames are deleted in bounded batches with
//!   one retry; survivors are reported, never silently dropped
//!
//! ## Architecture
//!
//! ```text
//! Trigger (S3 event / JSON / config)
//!        │
//!        ▼
//! ┌──────────────┐  head + download  ┌──────────────┐
//! │ Resource     │◀──────────────────│ Source       │
//! │ Guard        │                   │ Bucket       │
//! └──────────────┘                   └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐   put frames      ┌──────────────┐
//! │ Frame        │──────────────────▶│ Frame        │
//! │ Sampler      │                   │ Bucket       │◀─────┐
//! └──────────────┘                   └──────────────┘      │
//!        │                                  ▲              │ delete
//!        ▼                                  │ presign      │ rejected
//! ┌──────────────┐   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ Classifier   │──▶│ Frame        │─▶│ Alert        │  │ Retention    │
//! │ Gateway      │   │ Selector     │─┐│ Dispatcher   │  │ Manager      │
//! └──────────────┘   └──────────────┘ │└──────────────┘  └──────────────┘
//!                                     └─────────────────────────▲
//! ```

pub mod alert;
pub mod classifier;
pub mod config;
pub mod frame_selector;
pub mod job;
pub mod object_store;
pub mod pipeline;
pub mod resource_guard;
pub mod retention;
pub mod s3_store;
pub mod sampler;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use alert::{AlertDispatcher, AlertOutcome, Notifier, SnsNotifier};
pub use classifier::{Classifier, ClassifierGateway, HttpClassifier};
pub use config::Config;
pub use frame_selector::{select, SelectionPolicy, SelectionStrategy};
pub use job::{Job, JobError, JobResult, JobStatus};
pub use object_store::{ObjectLocator, ObjectStore};
pub use pipeline::{JobRunner, PipelineContext};
pub use s3_store::S3Store;
pub use sampler::{DecoderFactory, FrameSampler};
