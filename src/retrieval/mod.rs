//! Retrieval field construction for planner samples.

pub mod constructor;
pub mod history;
pub mod similarity;

pub use constructor::{
    EntrySource, RetrievalConstructor, RetrievalFilters, RetrievalQuery, RetrievalSnapshot,
    RetrievedEntry,
};
pub use history::{load_side_index, HistoryCorpus, HistoryEntry, SideEntry};
pub use similarity::{cosine_similarity, metric_for, SimilarityMetric, TermCosine, TokenJaccard};
