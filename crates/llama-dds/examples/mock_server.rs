// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Run the full bridge + dispatch stack against a canned echo engine.
//!
//! Useful for exercising clients without a model loaded:
//!
//! ```bash
//! # Terminal 1
//! cargo run --example mock_server -- 0
//!
//! # Terminal 2
//! llama-dds-client --dds-domain 0 "hello there"
//! ```
//!
//! The engine tokenizes on whitespace and streams the prompt's words back
//! one by one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llama_dds::{
    BridgeConfig, DdsBridge, Dispatcher, EngineHandles, InferenceTask, PromptTokenizer,
    ResponseQueue, StopKind, TaskQueue, TaskResult, TransportProfile,
};

/// Echoes each posted task's word count back as one chunk per word.
#[derive(Default)]
struct EchoEngine {
    next_id: AtomicI32,
    results: Mutex<HashMap<i32, VecDeque<TaskResult>>>,
}

impl TaskQueue for EchoEngine {
    fn new_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn post(&self, task: InferenceTask) {
        let n_prompt = task.tokens.len() as i32;
        let n = task.params.n_predict.clamp(1, 32);
        let mut queue = VecDeque::new();
        for i in 1..=n {
            queue.push_back(TaskResult::Partial {
                content: format!("token{} ", i),
                n_prompt_tokens: n_prompt,
                n_decoded: i,
            });
        }
        queue.push_back(TaskResult::Final {
            content: String::new(),
            n_prompt_tokens: n_prompt,
            n_decoded: n,
            stop: StopKind::Limit,
        });
        self.results.lock().unwrap().insert(task.id, queue);
    }
}

impl ResponseQueue for EchoEngine {
    fn add_waiting_task_id(&self, _task_id: i32) {}

    fn recv_with_timeout(&self, task_id: i32, timeout: Duration) -> Option<TaskResult> {
        // Pace the stream a little so clients see actual chunking.
        std::thread::sleep(timeout.min(Duration::from_millis(20)));
        self.results
            .lock()
            .unwrap()
            .get_mut(&task_id)
            .and_then(|q| q.pop_front())
    }

    fn remove_waiting_task_id(&self, task_id: i32) {
        self.results.lock().unwrap().remove(&task_id);
    }
}

struct WhitespaceTokenizer;

impl PromptTokenizer for WhitespaceTokenizer {
    fn tokenize(&self, prompt: &str) -> Result<Vec<i32>, String> {
        Ok(prompt.split_whitespace().map(|w| w.len() as i32).collect())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let domain_id = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0u32);

    let config = BridgeConfig {
        domain_id,
        total_slots: 4,
        profile: TransportProfile::from_env()?,
        ..BridgeConfig::default()
    };

    let bridge = Arc::new(DdsBridge::new(config));
    bridge.set_model_info("mock-echo", true, 4);
    bridge.start()?;
    println!("mock server up on domain {} (Ctrl+C to quit)", domain_id);

    let engine = Arc::new(EchoEngine::default());
    let handles = EngineHandles {
        tokenizer: Arc::new(WhitespaceTokenizer),
        template: None,
        tasks: engine.clone(),
        results: engine,
    };

    let dispatcher = Dispatcher::new(Arc::clone(&bridge), handles, "mock-echo");
    let running = AtomicBool::new(true);
    dispatcher.run(&running);

    bridge.stop();
    Ok(())
}
