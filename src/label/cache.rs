//! Content-addressed label cache with single-flight semantics.
//!
//! Each key maps to one shared [`OnceCell`]. The first caller for a key runs
//! the fetch; concurrent callers for the same key wait on that cell instead of
//! issuing their own request. Valid labels are also appended to a JSONL store
//! so later runs start warm.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::service::LabelError;
use super::types::LabelResult;
use crate::clip::ClipSample;
use crate::config::CacheKeyPart;
use crate::dataset::writer::JsonlWriter;
use crate::digest::joined_hex;

/// Result of labeling one cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub result: Result<LabelResult, LabelError>,
    /// Network attempts spent; zero when loaded from the persistent store.
    pub attempts: usize,
    /// Transient failures seen along the way, including recovered ones.
    pub transient_failures: usize,
}

/// One line of `label_cache.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    label: LabelResult,
}

type Slot = Arc<OnceCell<FetchOutcome>>;

pub struct LabelCache {
    slots: Mutex<HashMap<String, Slot>>,
    store: Option<Mutex<JsonlWriter>>,
}

impl LabelCache {
    /// A cache that lives only for this process.
    pub fn in_memory() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Load the persistent store at `path` (if any) and append to it.
    pub fn open(path: &Path) -> Result<Self> {
        let mut slots = HashMap::new();
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CacheEntry>(line) {
                    Ok(entry) => {
                        let outcome = FetchOutcome {
                            result: Ok(entry.label),
                            attempts: 0,
                            transient_failures: 0,
                        };
                        slots.insert(entry.key, Arc::new(OnceCell::new_with(Some(outcome))));
                    }
                    Err(e) => warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Ignoring unreadable cache line"
                    ),
                }
            }
        }
        info!(path = %path.display(), entries = slots.len(), "Opened label cache");

        Ok(Self {
            slots: Mutex::new(slots),
            store: Some(Mutex::new(JsonlWriter::append(path)?)),
        })
    }

    /// Number of keys with a settled outcome.
    pub fn len(&self) -> usize {
        self.lock_slots()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the outcome for `key`, running `fetch` only if no other caller
    /// has done so. The flag is `true` when the outcome was not fetched by
    /// this call.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> (FetchOutcome, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchOutcome>,
    {
        let slot = {
            let mut slots = self.lock_slots();
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut fetched = false;
        let fetched_flag = &mut fetched;
        let outcome = slot
            .get_or_init(|| async move {
                *fetched_flag = true;
                let outcome = fetch().await;
                if let Ok(label) = &outcome.result {
                    self.persist(key, label);
                }
                outcome
            })
            .await
            .clone();

        if !fetched {
            debug!(key, "Label cache hit");
        }
        (outcome, !fetched)
    }

    fn persist(&self, key: &str, label: &LabelResult) {
        let Some(store) = &self.store else {
            return;
        };
        let entry = CacheEntry {
            key: key.to_string(),
            label: label.clone(),
        };
        let mut writer = store.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write(&entry).and_then(|_| writer.flush()) {
            warn!(key, error = %e, "Failed to persist cache entry");
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build the cache key of a sample from the configured components.
pub fn cache_key(
    parts: &[CacheKeyPart],
    sample: &ClipSample,
    media_fingerprint: &str,
    schema_version: &str,
    vocab_version: &str,
) -> String {
    let components: Vec<String> = parts
        .iter()
        .map(|part| match part {
            CacheKeyPart::Media => format!("media={media_fingerprint}"),
            CacheKeyPart::Goal => format!("goal={}", sample.goal.as_deref().unwrap_or("")),
            CacheKeyPart::Task => format!("task={}", sample.task_key().unwrap_or("")),
            CacheKeyPart::SchemaVersion => format!("schema={schema_version}"),
            CacheKeyPart::VocabVersion => format!("vocab={vocab_version}"),
        })
        .collect();
    joined_hex(&components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::types::fixtures::label;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn ok_outcome() -> FetchOutcome {
        FetchOutcome {
            result: Ok(label(&["ATTACK"], &["enemy_dead"], 6)),
            attempts: 1,
            transient_failures: 0,
        }
    }

    #[tokio::test]
    async fn test_second_lookup_is_hit() {
        let cache = LabelCache::in_memory();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let (_, hit) = cache
            .get_or_fetch("k", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ok_outcome()
            })
            .await;
        assert!(!hit);

        let (outcome, hit) = cache
            .get_or_fetch("k", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ok_outcome()
            })
            .await;
        assert!(hit);
        assert!(outcome.result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_key_single_flight() {
        let cache = LabelCache::in_memory();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let fetch = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            ok_outcome()
        };
        let (a, b, c) = tokio::join!(
            cache.get_or_fetch("same", fetch),
            cache.get_or_fetch("same", fetch),
            cache.get_or_fetch("other", fetch),
        );

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(a.0, b.0);
        assert_eq!([a.1, b.1].iter().filter(|hit| **hit).count(), 1);
        assert!(!c.1);
    }

    #[tokio::test]
    async fn test_persistent_store_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("label_cache.jsonl");
        {
            let cache = LabelCache::open(&path).unwrap();
            cache.get_or_fetch("k1", || async { ok_outcome() }).await;
            cache
                .get_or_fetch("k2", || async {
                    FetchOutcome {
                        result: Err(LabelError::Transient("timeout".into())),
                        attempts: 3,
                        transient_failures: 3,
                    }
                })
                .await;
        }

        let reopened = LabelCache::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let (outcome, hit) = reopened
            .get_or_fetch("k1", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ok_outcome()
            })
            .await;
        assert!(hit);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cache_key_components() {
        use crate::clip::{HistoryWindows, LookaheadWindows};
        let mut sample = ClipSample {
            sample_id: "ep_t000120".into(),
            episode_id: "ep".into(),
            anchor: 120,
            frames_root: "frames".into(),
            history: HistoryWindows::default(),
            lookahead: LookaheadWindows::default(),
            action: "W".into(),
            goal: Some("reach gate".into()),
            instruct: None,
            task_id: Some("gate".into()),
            step_id: None,
            step_text: None,
        };
        let parts = [
            CacheKeyPart::Media,
            CacheKeyPart::Goal,
            CacheKeyPart::Task,
            CacheKeyPart::SchemaVersion,
        ];
        let a = cache_key(&parts, &sample, "fp", "v1", "vocab-a");
        // Vocab version is not part of the default key.
        assert_eq!(a, cache_key(&parts, &sample, "fp", "v1", "vocab-b"));
        assert_ne!(a, cache_key(&parts, &sample, "fp2", "v1", "vocab-a"));
        assert_ne!(a, cache_key(&parts, &sample, "fp", "v2", "vocab-a"));
        sample.goal = Some("other".into());
        assert_ne!(a, cache_key(&parts, &sample, "fp", "v1", "vocab-a"));
    }
}
