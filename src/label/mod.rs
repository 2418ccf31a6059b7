//! The labeling round.
//!
//! - [`batcher::LabelBatcher`]: batches samples, bounds concurrency, retries
//!   transient failures and applies the uncertainty policy.
//! - [`cache::LabelCache`]: content-addressed, single-flight result cache.
//! - [`service`]: the [`LabelService`] seam and its vision-language model
//!   implementation.
//! - [`validate`]: response normalization and schema checks.

pub mod batcher;
pub mod cache;
pub mod media;
pub mod service;
pub mod types;
pub mod validate;

pub use batcher::{LabelBatcher, PreparedRequest};
pub use cache::{cache_key, FetchOutcome, LabelCache};
pub use media::{encode_sample, EncodedClip, EncodedMedia};
pub use service::{LabelError, LabelRequest, LabelService, VlmLabelService};
pub use types::{DslOp, LabelRecord, LabelResult, LabelStatus, Uncertainty};
pub use validate::{parse_label, Violation};
