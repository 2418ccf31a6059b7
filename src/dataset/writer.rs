//! Crash-consistent output files.
//!
//! JSONL streams are written one complete line per `write_all`, so a killed
//! process leaves at most one partial trailing line; reopening a stream for
//! append cuts that tail off. Reports are replaced atomically via a temp file
//! and rename.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

/// Line-oriented JSON writer.
#[derive(Debug)]
pub struct JsonlWriter {
    file: File,
    path: PathBuf,
    written: usize,
}

impl JsonlWriter {
    /// Create (or truncate) `path`.
    pub fn create(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    /// Open `path` for appending, dropping any partial trailing line.
    pub fn append(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let valid_len = contents
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);
        if valid_len < contents.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = contents.len() - valid_len,
                "Truncating partial trailing line"
            );
            file.set_len(valid_len as u64)
                .with_context(|| format!("Failed to truncate {}", path.display()))?;
        }
        file.seek(SeekFrom::Start(valid_len as u64))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    /// Serialize `record` and write it as one line.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .with_context(|| format!("Failed to serialize record for {}", self.path.display()))?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .with_context(|| format!("Failed to flush {}", self.path.display()))
    }

    /// Lines written through this handle.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write `value` as pretty JSON, replacing `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}
