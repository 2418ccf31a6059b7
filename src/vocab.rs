//! Fixed vocabularies for label validation.
//!
//! Loaded once per process into an immutable [`Vocabulary`] and shared by
//! reference. The `version` string is a short content hash, so any edit to
//! the tables changes it (and, when configured, the label cache key).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use crate::digest::sha256_hex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vocabulary {
    /// Full operator definitions as authored, shown to the labeler.
    pub ops: Vec<Value>,
    pub op_names: BTreeSet<String>,
    pub done_evidence: Vec<String>,
    pub fallback_actions: Vec<String>,
    /// Known task identifiers; empty when no task table is provided.
    pub tasks: Vec<String>,
    pub version: String,
}

impl Vocabulary {
    /// Load `dsl_ops.json`, `done_evidence.json`, `fall_back.json` and the
    /// optional `tasks.json` from `dir`.
    pub fn load(dir: &Path) -> Result<Arc<Self>> {
        let ops_doc = read_doc(&dir.join("dsl_ops.json"))?;
        let evidence_doc = read_doc(&dir.join("done_evidence.json"))?;
        let fallback_doc = read_doc(&dir.join("fall_back.json"))?;
        let tasks_path = dir.join("tasks.json");
        let tasks_doc = if tasks_path.exists() {
            Some(read_doc(&tasks_path)?)
        } else {
            None
        };

        let ops: Vec<Value> = ops_doc
            .get("ops")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let vocab = Self::from_parts(
            ops,
            string_list(&evidence_doc, &["done_evidence", "evidence"]),
            string_list(&fallback_doc, &["fallback_actions", "fallbacks"]),
            tasks_doc
                .map(|doc| string_list(&doc, &["tasks"]))
                .unwrap_or_default(),
        );

        info!(
            dir = %dir.display(),
            ops = vocab.op_names.len(),
            evidence = vocab.done_evidence.len(),
            fallbacks = vocab.fallback_actions.len(),
            tasks = vocab.tasks.len(),
            version = %vocab.version,
            "Loaded vocabulary"
        );
        Ok(Arc::new(vocab))
    }

    /// Build a vocabulary from in-memory tables.
    pub fn from_parts(
        ops: Vec<Value>,
        done_evidence: Vec<String>,
        fallback_actions: Vec<String>,
        tasks: Vec<String>,
    ) -> Self {
        let op_names = ops
            .iter()
            .filter_map(|entry| entry.get("op"))
            .map(|op| match op {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();

        let canonical = serde_json::json!({
            "ops": ops,
            "done_evidence": done_evidence,
            "fallback_actions": fallback_actions,
            "tasks": tasks,
        });
        let digest = sha256_hex(canonical.to_string().as_bytes());
        let version = format!("vocab-{}", &digest[..12]);

        Self {
            ops,
            op_names,
            done_evidence,
            fallback_actions,
            tasks,
            version,
        }
    }

    // Empty tables accept everything.

    pub fn knows_op(&self, op: &str) -> bool {
        self.op_names.is_empty() || self.op_names.contains(op)
    }

    pub fn knows_evidence(&self, tag: &str) -> bool {
        self.done_evidence.is_empty() || self.done_evidence.iter().any(|e| e == tag)
    }

    pub fn knows_fallback(&self, action: &str) -> bool {
        self.fallback_actions.is_empty() || self.fallback_actions.iter().any(|f| f == action)
    }

    pub fn knows_task(&self, task: &str) -> bool {
        self.tasks.is_empty() || self.tasks.iter().any(|t| t == task)
    }
}

fn read_doc(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read vocabulary {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse vocabulary {}", path.display()))
}

/// First list found under any of `keys`, stringified.
fn string_list(doc: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|key| doc.get(*key).and_then(Value::as_array))
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}
