pub mod chat;
pub mod constants;
pub mod error;
pub mod llm_interaction;
pub mod manifest;
pub mod prompt;
pub mod response;

pub use chat::{ChatCommand, ChatOutcome, ChatParticipant, ChatRequest, ChatResult, Followup};
pub use error::{Result, SnkrError};
pub use llm_interaction::{ChatModel, ModelProvider, ModelSelector, OllamaProvider};
pub use manifest::{DependencyListing, DependencyTable, Workspace};
pub use response::{RecordingStream, ResponseStream, TerminalStream};
