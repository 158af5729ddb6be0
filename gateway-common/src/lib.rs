//! LLM Gateway Common Types
//!
//! OpenAI-compatible wire types shared by the gateway and its tests.

pub mod chat;
pub mod models;
pub mod stream;

pub use chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, StopSequence, ToolCall,
    ToolFunction, Usage,
};
pub use models::{ErrorBody, ErrorDetail, ModelObject, ModelsResponse};
pub use stream::{ChatCompletionChunk, ChunkChoice, Delta, STREAM_DONE};
