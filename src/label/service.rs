//! The remote labeling service seam.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::debug;

use super::media::EncodedMedia;
use crate::clip::ClipSample;
use crate::config::{LabelerConfig, ModelConfig};
use crate::error::SkipReason;
use crate::model::api::{ApiError, LlmClient};
use crate::model::prompt::labeling_messages;
use crate::vocab::Vocabulary;

/// Environment variables consulted, in order, when no API key is configured.
pub const API_KEY_VARS: [&str; 2] = ["CLIPFORGE_API_KEY", "OPENAI_API_KEY"];

/// Why one labeling attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    /// Network or service-side error; the same request may succeed later.
    #[error("transient service failure: {0}")]
    Transient(String),
    /// The response does not satisfy the label schema. Never retried.
    #[error("schema violation in `{field}`: {message}")]
    SchemaViolation { field: String, message: String },
    /// The service refused the request. Never retried.
    #[error("service rejected request: {0}")]
    Rejected(String),
}

impl LabelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn skip_reason(&self) -> SkipReason {
        match self {
            Self::Transient(_) => SkipReason::TransientServiceFailure,
            Self::SchemaViolation { .. } => SkipReason::SchemaViolation,
            Self::Rejected(_) => SkipReason::ServiceRejected,
        }
    }
}

impl From<ApiError> for LabelError {
    fn from(err: ApiError) -> Self {
        if err.is_retryable() {
            Self::Transient(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}

/// Everything the service needs to label one sample.
#[derive(Debug, Clone, Copy)]
pub struct LabelRequest<'a> {
    pub sample: &'a ClipSample,
    pub media: &'a EncodedMedia,
}

/// A labeling backend: returns the raw response body for one sample.
///
/// Validation happens in the caller, so implementations only report
/// transport-level outcomes.
#[allow(async_fn_in_trait)]
pub trait LabelService {
    async fn label(&self, request: LabelRequest<'_>) -> Result<String, LabelError>;
}

// ---------------------------------------------------------------------------
// Vision-language model backend
// ---------------------------------------------------------------------------

/// Labels samples with a vision-language model behind an OpenAI-compatible
/// chat endpoint.
pub struct VlmLabelService {
    client: LlmClient,
    model_id: String,
    vocab: Arc<Vocabulary>,
    config: LabelerConfig,
}

impl VlmLabelService {
    pub fn new(model: &ModelConfig, config: LabelerConfig, vocab: Arc<Vocabulary>) -> Result<Self> {
        let api_key = resolve_api_key(&model.api_key);
        let client = LlmClient::new(
            &model.api_base,
            &api_key,
            Duration::from_secs(config.timeout_secs),
        )
        .context("Failed to create labeling client")?;

        Ok(Self {
            client,
            model_id: model.model_id.clone(),
            vocab,
            config,
        })
    }
}

impl LabelService for VlmLabelService {
    async fn label(&self, request: LabelRequest<'_>) -> Result<String, LabelError> {
        let messages = labeling_messages(
            self.config.system_prompt.as_deref(),
            request.sample,
            request.media,
            &self.vocab,
            self.config.include_enums,
        );

        let resp = self
            .client
            .chat_completion(
                &self.model_id,
                &messages,
                self.config.temperature,
                self.config.max_tokens,
            )
            .await?;

        debug!(
            sample_id = %request.sample.sample_id,
            completion_tokens = resp.usage.completion_tokens,
            "Labeling response received"
        );

        resp.first_text()
            .ok_or_else(|| LabelError::Transient("response had no choices".into()))
    }
}

/// The configured key, or the first non-empty key from the environment.
pub fn resolve_api_key(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    API_KEY_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_default()
}
