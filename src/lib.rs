//! clipforge: turns recorded 2 FPS gameplay sessions into planner and
//! controller training datasets.
//!
//! The pipeline aligns frames with action records, samples fixed-shape
//! multi-window clips, labels them with a vision-language model, groups
//! labeled frames into plan spans and assembles the two training streams
//! together with a build report.

pub mod clip;
pub mod config;
pub mod dataset;
pub mod digest;
pub mod error;
pub mod label;
pub mod model;
pub mod retrieval;
pub mod session;
pub mod span;
pub mod vocab;
