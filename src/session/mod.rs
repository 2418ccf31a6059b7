//! Recorded sessions and frame/action alignment.
//!
//! - [`types`]: the positionally indexed [`Session`] and its segments.
//! - [`loader`]: reads session directories from disk.
//! - [`align`]: the [`FrameActionAligner`] that validates segments and
//!   records drop decisions.

pub mod align;
pub mod loader;
pub mod types;

pub use align::{AlignedSegment, EpisodeAlignment, FrameActionAligner, SegmentDrop};
pub use loader::{discover_sessions, load_session};
pub use types::{FrameEvent, Segment, Session, SessionManifest};
