// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message types for the llama DDS topics.
//!
//! These are the owned, native records that travel over the three topics.
//! Each topic type implements [`hdds::DdsTrait`] with a hand-written CDR2
//! layout (see [`cdr`]): length-prefixed null-terminated strings,
//! length-prefixed sequences, optionals as sequences of length 0 or 1.
//!
//! Field order is the wire contract. Do not reorder.

mod cdr;

use serde::{Deserialize, Serialize};

/// Roles accepted in [`ChatMessage::role`]. Unknown roles pass through
/// verbatim; interpretation is the consumer's business.
pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// One message in a chat conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Chat completion request published by clients.
///
/// `request_id` is a UUID v4 string correlating every response sample of the
/// session back to this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub request_id: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: i32,
    pub stream: bool,
    pub top_p: Option<f32>,
    pub n: Option<i32>,
    pub stop: Option<Vec<String>>,
}

impl Default for ChatCompletionRequest {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            model: String::new(),
            messages: Vec::new(),
            temperature: 0.7,
            max_tokens: 256,
            stream: false,
            top_p: None,
            n: None,
            stop: None,
        }
    }
}

/// One response sample of a session.
///
/// Streaming sessions emit zero or more samples with `is_final = false`
/// followed by exactly one with `is_final = true` (content may be empty).
/// Non-streaming sessions emit a single terminal sample carrying the full
/// generated text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub request_id: String,
    pub model: String,
    pub content: String,
    /// "stop", "length" or "error". `None` on non-terminal chunks.
    /// Encoded as an empty string on the wire.
    pub finish_reason: Option<String>,
    pub is_final: bool,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

/// Periodic server heartbeat.
///
/// `ready = true` implies a model is loaded and
/// `slots_idle + slots_processing` equals the configured slot count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub slots_idle: i32,
    pub slots_processing: i32,
    pub model_loaded: String,
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req = ChatCompletionRequest::default();
        assert_eq!(req.temperature, 0.7);
        assert_eq!(req.max_tokens, 256);
        assert!(!req.stream);
        assert!(req.top_p.is_none());
        assert!(req.stop.is_none());
    }

    #[test]
    fn test_chat_message_new() {
        let msg = ChatMessage::new(ROLE_USER, "What is 2+2?");
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content, "What is 2+2?");
    }
}
