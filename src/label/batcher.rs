//! Batched labeling rounds.
//!
//! Samples are grouped into fixed-size batches. Several batches run at once
//! (`max_in_flight_batches`) and every network call holds a permit from a
//! shared semaphore (`max_concurrent_requests`). Items inside a batch are
//! independent: one item retrying or failing never holds up or aborts the
//! others.

use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::cache::{cache_key, FetchOutcome, LabelCache};
use super::media::{encode_sample, EncodedMedia};
use super::service::{LabelError, LabelRequest, LabelService};
use super::types::{LabelRecord, LabelStatus, Uncertainty};
use super::validate::{parse_label, Violation};
use crate::clip::ClipSample;
use crate::config::LabelerConfig;
use crate::error::{Outcome, Skip};
use crate::vocab::Vocabulary;

/// Media and cache key of a sample, ready to be sent.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub media: EncodedMedia,
    pub cache_key: String,
}

pub struct LabelBatcher<S> {
    service: S,
    cache: LabelCache,
    vocab: Arc<Vocabulary>,
    config: LabelerConfig,
    schema_version: String,
    permits: Semaphore,
}

impl<S: LabelService> LabelBatcher<S> {
    pub fn new(
        service: S,
        cache: LabelCache,
        vocab: Arc<Vocabulary>,
        config: LabelerConfig,
        schema_version: impl Into<String>,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrent_requests.max(1));
        Self {
            service,
            cache,
            vocab,
            config,
            schema_version: schema_version.into(),
            permits,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Labels at or above this uncertainty are excluded.
    pub fn exclusion_threshold(&self) -> Option<Uncertainty> {
        self.config.exclude_uncertainty_at_or_above
    }

    pub fn vocab_version(&self) -> &str {
        &self.vocab.version
    }

    /// Label every sample. `on_batch` sees each batch's records as soon as
    /// the batch completes; the returned records are ordered by sample id.
    pub async fn run<F>(&self, samples: &[ClipSample], mut on_batch: F) -> Result<Vec<LabelRecord>>
    where
        F: FnMut(&[LabelRecord]) -> Result<()>,
    {
        let batch_size = self.config.batch_size.max(1);
        let total_batches = samples.len().div_ceil(batch_size);
        info!(
            samples = samples.len(),
            batches = total_batches,
            batch_size,
            "Starting labeling round"
        );

        let mut in_flight = stream::iter(samples.chunks(batch_size).enumerate())
            .map(|(index, batch)| self.label_batch(index, batch))
            .buffer_unordered(self.config.max_in_flight_batches.max(1));

        let mut records = Vec::with_capacity(samples.len());
        while let Some(batch) = in_flight.next().await {
            on_batch(&batch)?;
            records.extend(batch);
        }
        records.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));

        let accepted = records
            .iter()
            .filter(|r| r.status == LabelStatus::Accepted)
            .count();
        let cache_hits = records.iter().filter(|r| r.from_cache).count();
        info!(
            labeled = records.len(),
            accepted,
            cache_hits,
            "Labeling round complete"
        );
        Ok(records)
    }

    /// Encode and key every sample without calling the service.
    pub async fn dry_run(&self, samples: &[ClipSample]) -> Vec<(String, Outcome<PreparedRequest>)> {
        let mut prepared = Vec::with_capacity(samples.len());
        for sample in samples {
            prepared.push((sample.sample_id.clone(), self.prepare(sample).await));
        }
        prepared
    }

    pub async fn prepare(&self, sample: &ClipSample) -> Outcome<PreparedRequest> {
        let media = encode_sample(
            sample,
            &self.config.mime_type,
            self.config.include_future_windows,
        )
        .await?;
        let cache_key = cache_key(
            &self.config.cache_key,
            sample,
            &media.fingerprint,
            &self.schema_version,
            &self.vocab.version,
        );
        Ok(PreparedRequest { media, cache_key })
    }

    async fn label_batch(&self, index: usize, batch: &[ClipSample]) -> Vec<LabelRecord> {
        let records = futures::future::join_all(batch.iter().map(|s| self.label_one(s))).await;
        debug!(
            batch = index,
            items = records.len(),
            failed = records
                .iter()
                .filter(|r| r.status == LabelStatus::Failed)
                .count(),
            "Batch complete"
        );
        records
    }

    async fn label_one(&self, sample: &ClipSample) -> LabelRecord {
        let mut record = LabelRecord {
            sample_id: sample.sample_id.clone(),
            episode_id: sample.episode_id.clone(),
            anchor_t: sample.anchor,
            status: LabelStatus::Failed,
            cache_key: String::new(),
            task_id: sample.task_key().map(str::to_string),
            label: None,
            skip: None,
            invalid_field: None,
            attempts: 0,
            transient_failures: 0,
            from_cache: false,
        };

        let prepared = match self.prepare(sample).await {
            Ok(prepared) => prepared,
            Err(skip) => {
                warn!(sample_id = %sample.sample_id, reason = %skip.reason, detail = %skip.detail, "Skipping sample");
                record.skip = Some(skip);
                return record;
            }
        };
        record.cache_key = prepared.cache_key.clone();

        let (outcome, hit) = self
            .cache
            .get_or_fetch(&prepared.cache_key, || {
                self.fetch_with_retries(sample, &prepared.media)
            })
            .await;
        record.from_cache = hit;
        if !hit {
            record.attempts = outcome.attempts;
            record.transient_failures = outcome.transient_failures;
        }

        match outcome.result {
            Ok(label) => {
                if let Some(task) = &label.mid_step_id {
                    record.task_id = Some(task.clone());
                }
                record.label = Some(label);
                record.status = LabelStatus::Accepted;
                record.apply_uncertainty_threshold(self.config.exclude_uncertainty_at_or_above);
            }
            Err(err) => {
                if let LabelError::SchemaViolation { field, .. } = &err {
                    record.invalid_field = Some(field.clone());
                }
                warn!(sample_id = %sample.sample_id, error = %err, "Sample failed labeling");
                record.skip = Some(Skip::new(err.skip_reason(), err.to_string()));
            }
        }
        record
    }

    /// Call the service until it yields a valid label, a non-retryable
    /// error, or the attempt budget runs out.
    async fn fetch_with_retries(&self, sample: &ClipSample, media: &EncodedMedia) -> FetchOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut transient_failures = 0;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let response = match self.permits.acquire().await {
                Ok(_permit) => self.service.label(LabelRequest { sample, media }).await,
                Err(_) => Err(LabelError::Transient("request limiter closed".into())),
            };
            let result = response
                .and_then(|raw| parse_label(&raw, &self.vocab).map_err(schema_violation));

            match result {
                Ok(label) => {
                    return FetchOutcome {
                        result: Ok(label),
                        attempts: attempt,
                        transient_failures,
                    }
                }
                Err(err) if err.is_retryable() => {
                    transient_failures += 1;
                    let delay = self.config.backoff_after(attempt);
                    warn!(
                        sample_id = %sample.sample_id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient labeling failure"
                    );
                    tokio::time::sleep(delay).await;
                    if attempt >= max_attempts {
                        return FetchOutcome {
                            result: Err(err),
                            attempts: attempt,
                            transient_failures,
                        };
                    }
                }
                Err(err) => {
                    return FetchOutcome {
                        result: Err(err),
                        attempts: attempt,
                        transient_failures,
                    }
                }
            }
        }
    }
}

fn schema_violation(violations: Vec<Violation>) -> LabelError {
    let field = violations
        .first()
        .map(|v| v.field.clone())
        .unwrap_or_default();
    let message = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    LabelError::SchemaViolation { field, message }
}
