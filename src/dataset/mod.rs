//! Dataset assembly: planner and controller streams plus the build report.
//!
//! - [`assembler::DatasetAssembler`]: runs the extract, label and build
//!   stages over a session root.
//! - [`planner`] and [`controller`]: record builders for the two branches.
//! - [`report::BuildReport`]: counts and distributions of one run.
//! - [`writer`]: JSONL and atomic JSON output.

pub mod assembler;
pub mod controller;
pub mod planner;
pub mod report;
pub mod writer;

pub use assembler::{all_samples, DatasetAssembler, Episode};
pub use controller::{build_controller_records, ControllerInput, ControllerRecord, ControllerTarget};
pub use planner::{build_planner_record, PlannerInput, PlannerRecord, PlannerTarget};
pub use report::{stage, stream, BuildReport, LabelCounts, LengthStats, RetrievalCounts};
pub use writer::{write_json_atomic, JsonlWriter};
