//! Model access layer
//!
//! Groups (endpoint + key + proxy + capability flags), the chat message
//! structures sent to them and the HTTP client speaking the
//! OpenAI-compatible chat completion protocol. Retry and fallback policy
//! lives with the caller in [`crate::agent`].

mod client;
mod messages;

pub use client::{
    HttpModelClient, ModelClient, ModelError, ModelGroupConfig, ModelResponse, StreamDelta,
};
pub use messages::{fit_image, ChatMessage, MessageSegment, IMAGE_EMBED_LIMIT};
