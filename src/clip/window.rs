//! Window geometry around an anchor frame.
//!
//! For anchor `t` with the default geometry:
//!
//! ```text
//! near past      t-7 ..= t             8 contiguous indices
//! long past      t-120 ..= t step 4    31 indices, oldest first
//! near future    t ..= t+7             label-only
//! long future    t ..= t+120 step 4    label-only
//! ```
//!
//! History windows feed both training branches. Lookahead windows live in a
//! separate type so that training-input builders cannot reach them.

use serde::{Deserialize, Serialize};

use crate::config::SamplerConfig;

/// Resolved frame indices of one window plus their paths relative to the
/// session's frames root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub indices: Vec<usize>,
    pub frames: Vec<String>,
}

impl Window {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The last (most recent) frame path in the window.
    pub fn last_frame(&self) -> Option<&str> {
        self.frames.last().map(String::as_str)
    }
}

/// Windows that look back from the anchor. Safe for training input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryWindows {
    #[serde(rename = "recent_clip")]
    pub near_past: Window,
    #[serde(rename = "summary_clip")]
    pub long_past: Window,
}

/// Windows that look forward from the anchor. Only the labeling request may
/// read these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookaheadWindows {
    #[serde(rename = "lookahead_clip")]
    pub near_future: Window,
    #[serde(rename = "lookahead_summary_clip")]
    pub long_future: Window,
}

/// Which of the four windows an index list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    NearPast,
    LongPast,
    NearFuture,
    LongFuture,
}

impl WindowKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::NearPast => "recent_clip",
            Self::LongPast => "summary_clip",
            Self::NearFuture => "lookahead_clip",
            Self::LongFuture => "lookahead_summary_clip",
        }
    }
}

/// Window shape derived from the sampler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub near: usize,
    pub span: usize,
    pub stride: usize,
}

impl WindowGeometry {
    pub fn from_config(config: &SamplerConfig) -> Self {
        Self {
            near: config.near_window.max(1),
            span: config.summary_span,
            stride: config.summary_stride.max(1),
        }
    }

    /// Indices of `kind` around `t`, or `None` when the window would start
    /// before index 0.
    pub fn indices(&self, kind: WindowKind, t: usize) -> Option<Vec<usize>> {
        match kind {
            WindowKind::NearPast => {
                let start = t.checked_sub(self.near - 1)?;
                Some((start..=t).collect())
            }
            WindowKind::LongPast => {
                let start = t.checked_sub(self.span)?;
                Some((start..=t).step_by(self.stride).collect())
            }
            WindowKind::NearFuture => Some((t..t + self.near).collect()),
            WindowKind::LongFuture => Some((t..=t + self.span).step_by(self.stride).collect()),
        }
    }
}

impl Default for WindowGeometry {
    fn default() -> Self {
        Self::from_config(&SamplerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_past_is_eight_contiguous_ending_at_anchor() {
        let g = WindowGeometry::default();
        let w = g.indices(WindowKind::NearPast, 130).unwrap();
        assert_eq!(w, (123..=130).collect::<Vec<_>>());
    }

    #[test]
    fn test_long_past_spacing() {
        let g = WindowGeometry::default();
        let w = g.indices(WindowKind::LongPast, 130).unwrap();
        assert_eq!(w.first(), Some(&10));
        assert_eq!(w.last(), Some(&130));
        assert_eq!(w.len(), 31);
        assert!(w.windows(2).all(|p| p[1] - p[0] == 4));
    }

    #[test]
    fn test_future_windows_mirror_forward() {
        let g = WindowGeometry::default();
        assert_eq!(
            g.indices(WindowKind::NearFuture, 10).unwrap(),
            (10..=17).collect::<Vec<_>>()
        );
        let lf = g.indices(WindowKind::LongFuture, 10).unwrap();
        assert_eq!(lf.first(), Some(&10));
        assert_eq!(lf.last(), Some(&130));
    }

    #[test]
    fn test_window_before_zero_is_none() {
        let g = WindowGeometry::default();
        assert!(g.indices(WindowKind::NearPast, 3).is_none());
        assert!(g.indices(WindowKind::LongPast, 100).is_none());
    }

    #[test]
    fn test_serialized_names() {
        let history = HistoryWindows::default();
        let json = serde_json::to_value(&history).unwrap();
        assert!(json.get("recent_clip").is_some());
        assert!(json.get("summary_clip").is_some());
    }
}
