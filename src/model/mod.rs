//! Model client for the remote labeling service.
//!
//! - [`api::LlmClient`]: OpenAI-compatible chat completion client with
//!   multimodal (text + image) user messages.
//! - [`prompt`]: the labeling conversation templates.

pub mod api;
pub mod prompt;

pub use api::{ApiError, ChatMessage, ChatResponse, Choice, ContentPart, LlmClient, Usage};
