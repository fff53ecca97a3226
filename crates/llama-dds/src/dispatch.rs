// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatch loop: drains the bridge and drives the inference engine.
//!
//! One long-lived thread runs [`Dispatcher::run`]. Per request it renders a
//! prompt, tokenizes, posts a task to the engine queue and then relays every
//! engine result back onto the response topic, tagged with the originating
//! request id. Streaming sessions publish each partial immediately;
//! non-streaming sessions accumulate and publish a single terminal sample.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::bridge::DdsBridge;
use crate::engine::{
    ChatTemplate, InferenceTask, PromptTokenizer, ResponseQueue, SamplingParams, StopKind,
    TaskQueue, TaskResult,
};
use crate::msg::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage};

/// How long one engine poll may block before the deadline is re-checked.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Bridge wait used by the poll loop; bounds shutdown latency.
const POLL_WAIT: Duration = Duration::from_millis(100);

/// The engine seams the dispatcher drives.
pub struct EngineHandles {
    pub tokenizer: Arc<dyn PromptTokenizer>,
    /// `None` in router / model-less mode; the fallback template is used.
    pub template: Option<Arc<dyn ChatTemplate>>,
    pub tasks: Arc<dyn TaskQueue>,
    pub results: Arc<dyn ResponseQueue>,
}

/// Per-server dispatcher; `run` is the body of the polling thread.
pub struct Dispatcher {
    bridge: Arc<DdsBridge>,
    engine: EngineHandles,
    model_name: String,
}

impl Dispatcher {
    pub fn new(bridge: Arc<DdsBridge>, engine: EngineHandles, model_name: impl Into<String>) -> Self {
        Self {
            bridge,
            engine,
            model_name: model_name.into(),
        }
    }

    /// Poll loop: block briefly on the bridge, then process one request.
    /// Exits after the current iteration once `running` goes false.
    pub fn run(&self, running: &AtomicBool) {
        info!("[dispatch] polling thread started");
        while running.load(Ordering::Acquire) {
            self.bridge.wait_for_request(POLL_WAIT);
            if let Some(request) = self.bridge.try_pop() {
                self.process_request(&request);
            }
        }
        info!("[dispatch] polling thread stopped");
    }

    /// Run one request through the engine, publishing every produced sample
    /// under the request's id. Always ends the session with exactly one
    /// `is_final = true` sample.
    pub fn process_request(&self, request: &ChatCompletionRequest) {
        debug!("[dispatch] processing request {}", request.request_id);

        let prompt = match &self.engine.template {
            Some(template) => template.render(&request.messages),
            None => fallback_prompt(&request.messages),
        };

        let tokens = match self.engine.tokenizer.tokenize(&prompt) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            Ok(_) => {
                error!(
                    "[dispatch] tokenizer produced no tokens for {}",
                    request.request_id
                );
                self.send_terminal(
                    request,
                    "[Error: failed to tokenize prompt: empty token sequence]".to_string(),
                    "error",
                    0,
                    0,
                );
                return;
            }
            Err(e) => {
                error!("[dispatch] failed to tokenize prompt: {}", e);
                self.send_terminal(
                    request,
                    format!("[Error: failed to tokenize prompt: {}]", e),
                    "error",
                    0,
                    0,
                );
                return;
            }
        };
        debug!("[dispatch] tokenized to {} tokens", tokens.len());

        let task_id = self.engine.tasks.new_id();
        // Registered before posting so no result can slip through the gap.
        self.engine.results.add_waiting_task_id(task_id);
        self.engine.tasks.post(InferenceTask {
            id: task_id,
            tokens,
            params: sampling_params(request),
        });
        debug!(
            "[dispatch] posted task {} (stream={})",
            task_id, request.stream
        );

        self.receive_results(request, task_id);
        self.engine.results.remove_waiting_task_id(task_id);
    }

    /// Relay engine results until the terminal one, the engine errors, or
    /// the per-request deadline expires. Computed once per request.
    fn receive_results(&self, request: &ChatCompletionRequest, task_id: i32) {
        let deadline = Instant::now() + self.bridge.dds_timeout();

        let mut generated = String::new();
        let mut prompt_tokens = 0;
        let mut completion_tokens = 0;
        let mut finish_reason = "stop";
        let mut finished = false;

        while !finished {
            if Instant::now() > deadline {
                warn!(
                    "[dispatch] deadline ({:?}) hit waiting for task {}",
                    self.bridge.dds_timeout(),
                    task_id
                );
                // Synthetic terminal: a silent stall would leave the client
                // with an open session and no protocol-level recourse.
                generated = "[timeout]".to_string();
                finish_reason = "error";
                break;
            }

            let Some(result) = self.engine.results.recv_with_timeout(task_id, RECV_TIMEOUT) else {
                debug!("[dispatch] no progress on task {} yet", task_id);
                continue;
            };

            match result {
                TaskResult::Final {
                    content,
                    n_prompt_tokens,
                    n_decoded,
                    stop,
                } => {
                    prompt_tokens = n_prompt_tokens;
                    completion_tokens = n_decoded;
                    finish_reason = finish_reason_label(stop);
                    if request.stream {
                        // Trailing content goes out as one more chunk; the
                        // terminal sample itself stays empty.
                        if !content.is_empty() {
                            self.send_chunk(request, content, prompt_tokens, completion_tokens);
                        }
                        generated.clear();
                    } else if !content.is_empty() {
                        generated = content;
                    }
                    finished = true;
                }
                TaskResult::Partial {
                    content,
                    n_prompt_tokens,
                    n_decoded,
                } => {
                    prompt_tokens = n_prompt_tokens;
                    completion_tokens = n_decoded;
                    if request.stream {
                        if !content.is_empty() {
                            self.send_chunk(request, content, prompt_tokens, completion_tokens);
                        }
                    } else {
                        generated.push_str(&content);
                    }
                }
                TaskResult::Error { message } => {
                    error!("[dispatch] task {} failed: {}", task_id, message);
                    generated = format!("[Error: {}]", message);
                    finish_reason = "error";
                    finished = true;
                }
            }
        }

        self.send_terminal(
            request,
            generated,
            finish_reason,
            prompt_tokens,
            completion_tokens,
        );
    }

    fn model_for(&self, request: &ChatCompletionRequest) -> String {
        if request.model.is_empty() {
            self.model_name.clone()
        } else {
            request.model.clone()
        }
    }

    fn send_chunk(
        &self,
        request: &ChatCompletionRequest,
        content: String,
        prompt_tokens: i32,
        completion_tokens: i32,
    ) {
        debug!(
            "[dispatch] streamed chunk for {}: {} chars (n_decoded={})",
            request.request_id,
            content.len(),
            completion_tokens
        );
        self.bridge.send_response(&ChatCompletionResponse {
            request_id: request.request_id.clone(),
            model: self.model_for(request),
            content,
            finish_reason: None,
            is_final: false,
            prompt_tokens,
            completion_tokens,
        });
    }

    fn send_terminal(
        &self,
        request: &ChatCompletionRequest,
        content: String,
        finish_reason: &str,
        prompt_tokens: i32,
        completion_tokens: i32,
    ) {
        self.bridge.send_response(&ChatCompletionResponse {
            request_id: request.request_id.clone(),
            model: self.model_for(request),
            content,
            finish_reason: Some(finish_reason.to_string()),
            is_final: true,
            prompt_tokens,
            completion_tokens,
        });
        debug!("[dispatch] session {} closed", request.request_id);
    }
}

/// Map an engine stop code onto the wire finish reason.
fn finish_reason_label(stop: StopKind) -> &'static str {
    match stop {
        StopKind::Limit => "length",
        StopKind::Eos | StopKind::Word | StopKind::None => "stop",
    }
}

/// Sampling parameters from the request, with the documented fallbacks:
/// temperature 0.7 when unset, 50 predicted tokens when unset, top_p only
/// when strictly inside (0, 1).
fn sampling_params(request: &ChatCompletionRequest) -> SamplingParams {
    SamplingParams {
        temperature: if request.temperature > 0.0 {
            request.temperature
        } else {
            0.7
        },
        top_p: request.top_p.filter(|p| *p > 0.0 && *p < 1.0),
        n_predict: if request.max_tokens > 0 {
            request.max_tokens
        } else {
            50
        },
        stop: request.stop.clone().unwrap_or_default(),
    }
}

/// Deterministic prompt for router / model-less mode: one
/// `<|role|>\ncontent\n<|end|>\n` block per message and a trailing
/// assistant marker. Unknown roles are skipped.
pub fn fallback_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::with_capacity(256);
    for msg in messages {
        let marker = match msg.role.as_str() {
            "system" => "<|system|>",
            "user" => "<|user|>",
            "assistant" => "<|assistant|>",
            _ => continue,
        };
        prompt.push_str(marker);
        prompt.push('\n');
        prompt.push_str(&msg.content);
        prompt.push('\n');
        prompt.push_str("<|end|>\n");
    }
    prompt.push_str("<|assistant|>\n");
    prompt
}
