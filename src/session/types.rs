//! Core session data types.
//!
//! A [`Session`] is one recorded episode: frames and action records indexed
//! `0..N-1`, where frame `i` and action `i` denote the same instant, plus the
//! manually annotated segment boundaries and any per-frame side streams.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Capture configuration stored next to a session as `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    /// Episode identifier; defaults to the session directory name.
    #[serde(default)]
    pub episode_id: Option<String>,
    /// Capture rate of the frame stream (default: 2).
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Overrides the configured number of the first frame file.
    #[serde(default)]
    pub frame_index_base: Option<usize>,
    /// Coarse task identifier for the whole episode, if known.
    #[serde(default)]
    pub task_id: Option<String>,
}

fn default_fps() -> u32 {
    2
}

impl Default for SessionManifest {
    fn default() -> Self {
        Self {
            episode_id: None,
            fps: default_fps(),
            frame_index_base: None,
            task_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Segments and events
// ---------------------------------------------------------------------------

/// A manually annotated range sharing one coarse task step.
///
/// Bounds are inclusive. Clip windows may never cross a segment edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "start_frame")]
    pub start: usize,
    #[serde(rename = "end_frame")]
    pub end: usize,
    #[serde(rename = "mid_step_id", default)]
    pub step_id: Option<String>,
    #[serde(rename = "mid_step_text", default)]
    pub step_text: Option<String>,
}

impl Segment {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            step_id: None,
            step_text: None,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }

    /// Number of frames covered.
    pub fn frame_count(&self) -> usize {
        self.end + 1 - self.start
    }
}

/// A gameplay event observed at one frame (death, menu, an evidence tag, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub frame: usize,
    pub class: String,
    /// Detector confidence, when the event source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One recorded episode, positionally indexed.
///
/// Every per-index stream is a `Vec<Option<_>>` so that a hole (a missing
/// frame file, a blank action line) keeps the positions of everything after
/// it intact.
#[derive(Debug, Clone)]
pub struct Session {
    pub episode_id: String,
    /// Directory frame paths are reported relative to.
    pub frames_root: PathBuf,
    pub manifest: SessionManifest,
    pub frames: Vec<Option<PathBuf>>,
    pub actions: Vec<Option<String>>,
    pub goals: Vec<Option<String>>,
    pub instructs: Vec<Option<String>>,
    /// Declared segments; empty means one implicit segment over the episode.
    pub segments: Vec<Segment>,
    pub events: Vec<FrameEvent>,
}

impl Session {
    /// Create a session from frame paths and action records.
    pub fn new(
        episode_id: impl Into<String>,
        frames_root: impl Into<PathBuf>,
        frames: Vec<Option<PathBuf>>,
        actions: Vec<Option<String>>,
    ) -> Self {
        Self {
            episode_id: episode_id.into(),
            frames_root: frames_root.into(),
            manifest: SessionManifest::default(),
            frames,
            actions,
            goals: Vec::new(),
            instructs: Vec::new(),
            segments: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Number of positions covered by either stream.
    pub fn len(&self) -> usize {
        self.frames.len().max(self.actions.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frame_path(&self, index: usize) -> Option<&Path> {
        self.frames.get(index).and_then(|f| f.as_deref())
    }

    pub fn action(&self, index: usize) -> Option<&str> {
        self.actions.get(index).and_then(|a| a.as_deref())
    }

    pub fn goal(&self, index: usize) -> Option<&str> {
        self.goals.get(index).and_then(|g| g.as_deref())
    }

    pub fn instruct(&self, index: usize) -> Option<&str> {
        self.instructs.get(index).and_then(|i| i.as_deref())
    }

    /// Whether both a frame and an action record exist at `index`.
    pub fn is_aligned(&self, index: usize) -> bool {
        self.frame_path(index).is_some() && self.action(index).is_some()
    }

    /// The first index in `start..=end` that lacks a frame or an action.
    pub fn first_gap(&self, start: usize, end: usize) -> Option<usize> {
        (start..=end).find(|&i| !self.is_aligned(i))
    }

    /// Declared segments, or a single implicit segment when none are declared.
    pub fn effective_segments(&self) -> Vec<Segment> {
        if self.segments.is_empty() && !self.is_empty() {
            vec![Segment::new(0, self.len() - 1)]
        } else {
            self.segments.clone()
        }
    }

    /// Frame path relative to the frames root, as written into output records.
    pub fn relative_frame(&self, index: usize) -> Option<String> {
        let path = self.frame_path(index)?;
        let rel = path.strip_prefix(&self.frames_root).unwrap_or(path);
        Some(rel.to_string_lossy().into_owned())
    }

    /// Event classes recorded at `index`.
    pub fn events_at(&self, index: usize) -> impl Iterator<Item = &str> {
        self.events_with_confidence_at(index).map(|e| e.class.as_str())
    }

    /// Events recorded at `index`.
    pub fn events_with_confidence_at(&self, index: usize) -> impl Iterator<Item = &FrameEvent> {
        self.events.iter().filter(move |e| e.frame == index)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A fully aligned in-memory session with `n` frames and a single segment.
    pub fn aligned_session(episode_id: &str, n: usize) -> Session {
        let frames = (0..n)
            .map(|i| Some(PathBuf::from(format!("frames/{:06}.jpg", i + 1))))
            .collect();
        let actions = (0..n).map(|i| Some(format!("act_{i}"))).collect();
        Session::new(episode_id, "frames", frames, actions)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::aligned_session;
    use super::*;

    #[test]
    fn test_implicit_segment_covers_episode() {
        let session = aligned_session("ep", 10);
        let segs = session.effective_segments();
        assert_eq!(segs, vec![Segment::new(0, 9)]);
    }

    #[test]
    fn test_first_gap_reports_missing_frame() {
        let mut session = aligned_session("ep", 10);
        session.frames[4] = None;
        assert_eq!(session.first_gap(0, 9), Some(4));
        assert_eq!(session.first_gap(5, 9), None);
    }

    #[test]
    fn test_first_gap_past_end() {
        let session = aligned_session("ep", 10);
        assert_eq!(session.first_gap(8, 11), Some(10));
    }

    #[test]
    fn test_relative_frame_strips_root() {
        let session = aligned_session("ep", 2);
        assert_eq!(session.relative_frame(1).as_deref(), Some("000002.jpg"));
        assert_eq!(session.relative_frame(5), None);
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: SessionManifest = serde_json::from_str("{}").unwrap();
        assert_eq!(manifest.fps, 2);
        assert!(manifest.episode_id.is_none());
    }
}
