// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Narrow interface to the external inference engine.
//!
//! The bridge never talks to the model directly. It consumes four seams the
//! host server already has: a tokenizer, an optional chat template, the task
//! queue, and the per-task result queue. The dispatch loop drives these and
//! nothing else, so the engine stays swappable (and mockable in tests).

use std::time::Duration;

use crate::msg::ChatMessage;

/// Sampling parameters forwarded with a task.
///
/// Only the fields the wire request carries; everything else keeps the
/// engine's own defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub n_predict: i32,
    pub stop: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: None,
            n_predict: 50,
            stop: Vec::new(),
        }
    }
}

/// A completion task handed to the engine's queue.
#[derive(Debug, Clone)]
pub struct InferenceTask {
    pub id: i32,
    pub tokens: Vec<i32>,
    pub params: SamplingParams,
}

/// Why the engine stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// End-of-sequence token produced.
    Eos,
    /// Token budget exhausted.
    Limit,
    /// A stop word matched.
    Word,
    /// Not stopped (progress results).
    None,
}

/// One result popped from the engine's response queue.
#[derive(Debug, Clone)]
pub enum TaskResult {
    /// Terminal result. In streaming sessions `content` carries only
    /// trailing text not yet delivered as a partial; otherwise it carries
    /// the full generated text.
    Final {
        content: String,
        n_prompt_tokens: i32,
        n_decoded: i32,
        stop: StopKind,
    },
    /// Intermediate chunk.
    Partial {
        content: String,
        n_prompt_tokens: i32,
        n_decoded: i32,
    },
    /// Engine-side failure; terminates the session.
    Error { message: String },
}

/// Turns a prompt string into model tokens.
pub trait PromptTokenizer: Send + Sync {
    fn tokenize(&self, prompt: &str) -> std::result::Result<Vec<i32>, String>;
}

/// Renders a conversation into the loaded model's prompt convention.
///
/// Absent (router / model-less mode) the dispatch falls back to a generic
/// `<|role|>` block template.
pub trait ChatTemplate: Send + Sync {
    fn render(&self, messages: &[ChatMessage]) -> String;
}

/// The engine's inbound task queue.
pub trait TaskQueue: Send + Sync {
    /// Allocate a fresh task id.
    fn new_id(&self) -> i32;
    /// Submit a task. Takes ownership; the queue moves it to a worker slot.
    fn post(&self, task: InferenceTask);
}

/// The engine's outbound result queue.
pub trait ResponseQueue: Send + Sync {
    /// Register interest in a task id before posting the task, so no result
    /// can slip through the gap.
    fn add_waiting_task_id(&self, task_id: i32);
    /// Block up to `timeout` for the next result of `task_id`.
    /// `None` means no progress yet.
    fn recv_with_timeout(&self, task_id: i32, timeout: Duration) -> Option<TaskResult>;
    /// Drop interest; call exactly once when the session ends.
    fn remove_waiting_task_id(&self, task_id: i32);
}
