//! Clip samples: fixed-shape multi-window views around anchor frames.

pub mod sampler;
pub mod types;
pub mod window;

pub use sampler::{export_clips, ClipSampler};
pub use types::{ClipSample, EpisodeSamples, SampleSkip};
pub use window::{HistoryWindows, LookaheadWindows, Window, WindowGeometry, WindowKind};
