//! Session directory loading.
//!
//! Layout of one session directory:
//!
//! ```text
//! <episode>/
//!   manifest.json      optional capture configuration
//!   frames/            pre-extracted, numbered frame images
//!   actions.txt        one action record per line (blank = missing)
//!   mid_steps.jsonl    optional segment annotations
//!   goals.txt          optional per-frame goal text
//!   instructs.txt      optional per-frame instruction text
//!   events.jsonl       optional gameplay events
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::types::{FrameEvent, Segment, Session, SessionManifest};
use crate::config::AlignerConfig;

/// List the session directories under `root`, sorted by name.
///
/// An unreadable root is fatal for the whole run.
pub fn discover_sessions(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read session root {}", root.display()))?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", root.display()))?;
        let path = entry.path();
        if path.is_dir() && path.join("actions.txt").exists() {
            dirs.push(path);
        }
    }
    dirs.sort();

    info!(root = %root.display(), sessions = dirs.len(), "Discovered sessions");
    Ok(dirs)
}

/// Load one session directory into memory.
///
/// Frame images are only listed, never decoded.
pub fn load_session(dir: &Path, config: &AlignerConfig) -> Result<Session> {
    let manifest_path = dir.join("manifest.json");
    let manifest: SessionManifest = if manifest_path.exists() {
        read_json(&manifest_path)?
    } else {
        SessionManifest::default()
    };

    let episode_id = manifest.episode_id.clone().unwrap_or_else(|| {
        dir.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "episode".to_string())
    });

    let frames_root = dir.join("frames");
    let base = manifest.frame_index_base.unwrap_or(config.frame_index_base);
    let frames = list_frames(&frames_root, base)?;
    let actions = read_lines(&dir.join("actions.txt"))?;
    let goals = read_optional_lines(&dir.join("goals.txt"))?;
    let instructs = read_optional_lines(&dir.join("instructs.txt"))?;
    let segments = read_jsonl_optional::<Segment>(&dir.join("mid_steps.jsonl"))?;
    let events = read_jsonl_optional::<FrameEvent>(&dir.join("events.jsonl"))?;

    if frames.len() != actions.len() {
        warn!(
            episode = %episode_id,
            frames = frames.len(),
            actions = actions.len(),
            "Frame and action counts differ"
        );
    }

    debug!(
        episode = %episode_id,
        frames = frames.len(),
        actions = actions.len(),
        segments = segments.len(),
        events = events.len(),
        "Loaded session"
    );

    Ok(Session {
        episode_id,
        frames_root,
        manifest,
        frames,
        actions,
        goals,
        instructs,
        segments,
        events,
    })
}

/// Longest run of missing frame numbers tolerated between two frame files.
/// Files numbered past a larger gap are treated as strays.
const MAX_FRAME_GAP: usize = 1024;

/// Index the frame directory by position.
///
/// Numeric file stems (`000001.jpg`) map to `stem - base`, so a missing file
/// leaves a hole instead of shifting later frames. Non-numeric files are
/// ignored, unless no stem is numeric at all, in which case the files are
/// indexed by sorted position.
fn list_frames(frames_dir: &Path, base: usize) -> Result<Vec<Option<PathBuf>>> {
    let entries = std::fs::read_dir(frames_dir)
        .with_context(|| format!("Failed to read frames directory {}", frames_dir.display()))?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut numbered: BTreeMap<usize, PathBuf> = BTreeMap::new();
    let mut unnumbered = 0;
    for path in &files {
        let index = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<usize>().ok())
            .and_then(|n| n.checked_sub(base));
        match index {
            Some(index) => {
                if numbered.contains_key(&index) {
                    warn!(index, path = %path.display(), "Duplicate frame index, keeping first");
                } else {
                    numbered.insert(index, path.clone());
                }
            }
            None => unnumbered += 1,
        }
    }

    if numbered.is_empty() {
        return Ok(files.into_iter().map(Some).collect());
    }
    if unnumbered > 0 {
        warn!(dir = %frames_dir.display(), unnumbered, "Ignoring frame files without a numeric stem");
    }

    let mut frames: Vec<Option<PathBuf>> = Vec::with_capacity(numbered.len());
    for (index, path) in numbered {
        if index > frames.len() + MAX_FRAME_GAP {
            warn!(index, path = %path.display(), "Frame number far past the sequence, ignoring the rest");
            break;
        }
        frames.resize(index, None);
        frames.push(Some(path));
    }
    Ok(frames)
}

/// Read a positional text stream; blank lines are holes.
fn read_lines(path: &Path) -> Result<Vec<Option<String>>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(text
        .lines()
        .map(|line| {
            let line = line.trim();
            (!line.is_empty()).then(|| line.to_string())
        })
        .collect())
}

fn read_optional_lines(path: &Path) -> Result<Vec<Option<String>>> {
    if path.exists() {
        read_lines(path)
    } else {
        Ok(Vec::new())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Read every non-blank line of a JSONL file.
pub fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut out = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => out.push(record),
            Err(e) => bail!("{}:{}: {e}", path.display(), line_no + 1),
        }
    }
    Ok(out)
}

fn read_jsonl_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if path.exists() {
        read_jsonl(path)
    } else {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_session(dir: &Path, frame_numbers: &[usize], actions: &str) {
        let frames = dir.join("frames");
        std::fs::create_dir_all(&frames).unwrap();
        for n in frame_numbers {
            std::fs::write(frames.join(format!("{n:06}.jpg")), b"jpg").unwrap();
        }
        std::fs::write(dir.join("actions.txt"), actions).unwrap();
    }

    #[test]
    fn test_missing_frame_file_leaves_hole() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("ep1");
        write_session(&dir, &[1, 2, 4], "a\nb\nc\nd\n");

        let session = load_session(&dir, &AlignerConfig::default()).unwrap();
        assert_eq!(session.episode_id, "ep1");
        assert_eq!(session.frames.len(), 4);
        assert!(session.frames[2].is_none());
        assert!(session.frames[3].is_some());
        assert_eq!(session.action(3), Some("d"));
    }

    #[test]
    fn test_stray_frame_files_are_ignored() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("ep1");
        write_session(&dir, &[1, 2, 3], "a\nb\nc\n");
        let frames = dir.join("frames");
        std::fs::write(frames.join("99999999.jpg"), b"jpg").unwrap();
        std::fs::write(frames.join("thumbnail.jpg"), b"jpg").unwrap();

        let session = load_session(&dir, &AlignerConfig::default()).unwrap();
        assert_eq!(session.frames.len(), 3);
        assert!(session.frames.iter().all(Option::is_some));
        assert!(session.frame_path(2).unwrap().ends_with("000003.jpg"));
    }

    #[test]
    fn test_blank_action_line_is_hole() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("ep1");
        write_session(&dir, &[1, 2, 3], "a\n\nc\n");

        let session = load_session(&dir, &AlignerConfig::default()).unwrap();
        assert_eq!(session.action(1), None);
        assert_eq!(session.action(2), Some("c"));
        assert!(!session.is_aligned(1));
    }

    #[test]
    fn test_manifest_and_segments() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("raw");
        write_session(&dir, &[1, 2, 3, 4], "a\nb\nc\nd\n");
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"episode_id": "boss_run", "fps": 2, "task_id": "boss"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("mid_steps.jsonl"),
            "{\"start_frame\":0,\"end_frame\":1,\"mid_step_id\":\"walk\",\"mid_step_text\":\"walk in\"}\n\
             {\"start_frame\":2,\"end_frame\":3,\"mid_step_id\":\"fight\",\"mid_step_text\":\"fight\"}\n",
        )
        .unwrap();
        std::fs::write(dir.join("events.jsonl"), "{\"frame\":3,\"class\":\"death\"}\n").unwrap();

        let session = load_session(&dir, &AlignerConfig::default()).unwrap();
        assert_eq!(session.episode_id, "boss_run");
        assert_eq!(session.segments.len(), 2);
        assert_eq!(session.segments[1].step_id.as_deref(), Some("fight"));
        assert_eq!(session.events_at(3).collect::<Vec<_>>(), vec!["death"]);
    }

    #[test]
    fn test_discover_sessions_requires_actions() {
        let tmp = tempdir().unwrap();
        write_session(&tmp.path().join("b"), &[1], "a\n");
        write_session(&tmp.path().join("a"), &[1], "a\n");
        std::fs::create_dir_all(tmp.path().join("not_a_session")).unwrap();

        let dirs = discover_sessions(tmp.path()).unwrap();
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("a"));
    }

    #[test]
    fn test_unreadable_root_is_error() {
        let tmp = tempdir().unwrap();
        assert!(discover_sessions(&tmp.path().join("missing")).is_err());
    }
}
