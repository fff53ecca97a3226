// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end bridge tests over intra-process transport.
//!
//! A full server stack (transport + bridge + dispatch) runs against a
//! scripted engine; a client transport publishes requests and collects the
//! correlated response samples.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use llama_dds::{
    BridgeConfig, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, DdsBridge,
    DdsTransport, Dispatcher, EngineHandles, InferenceTask, ProfileKind, PromptTokenizer,
    ResponseQueue, ServerStatus, StopKind, TaskQueue, TaskResult, TransportProfile,
};

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// What the engine does with a posted task.
#[derive(Clone)]
enum Script {
    /// Emit `chunks` partials covering `text`, then an empty final.
    Chunked { text: String, chunks: usize },
    /// Emit a single final carrying the whole text (no partials).
    OneShot { text: String },
    /// Emit one error result.
    Fail { message: String },
    /// Emit nothing; the dispatcher must hit its deadline.
    Silent,
}

struct ScriptedEngine {
    script: Script,
    next_id: AtomicI32,
    waiting: Mutex<HashSet<i32>>,
    results: Mutex<HashMap<i32, VecDeque<TaskResult>>>,
}

impl ScriptedEngine {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            next_id: AtomicI32::new(1),
            waiting: Mutex::new(HashSet::new()),
            results: Mutex::new(HashMap::new()),
        })
    }

    fn waiting_count(&self) -> usize {
        self.waiting.lock().unwrap().len()
    }

    fn script_results(&self, n_prompt: i32) -> VecDeque<TaskResult> {
        let mut queue = VecDeque::new();
        match &self.script {
            Script::Chunked { text, chunks } => {
                let pieces = split_chunks(text, *chunks);
                let mut decoded = 0;
                for piece in &pieces {
                    decoded += 1;
                    queue.push_back(TaskResult::Partial {
                        content: piece.clone(),
                        n_prompt_tokens: n_prompt,
                        n_decoded: decoded,
                    });
                }
                queue.push_back(TaskResult::Final {
                    content: String::new(),
                    n_prompt_tokens: n_prompt,
                    n_decoded: decoded,
                    stop: StopKind::Eos,
                });
            }
            Script::OneShot { text } => {
                queue.push_back(TaskResult::Final {
                    content: text.clone(),
                    n_prompt_tokens: n_prompt,
                    n_decoded: text.split_whitespace().count().max(1) as i32,
                    stop: StopKind::Limit,
                });
            }
            Script::Fail { message } => {
                queue.push_back(TaskResult::Error {
                    message: message.clone(),
                });
            }
            Script::Silent => {}
        }
        queue
    }
}

fn split_chunks(text: &str, chunks: usize) -> Vec<String> {
    let bytes: Vec<char> = text.chars().collect();
    let size = bytes.len().div_ceil(chunks.max(1));
    bytes
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

impl TaskQueue for ScriptedEngine {
    fn new_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn post(&self, task: InferenceTask) {
        let n_prompt = task.tokens.len() as i32;
        self.results
            .lock()
            .unwrap()
            .insert(task.id, self.script_results(n_prompt));
    }
}

impl ResponseQueue for ScriptedEngine {
    fn add_waiting_task_id(&self, task_id: i32) {
        self.waiting.lock().unwrap().insert(task_id);
    }

    fn recv_with_timeout(&self, task_id: i32, timeout: Duration) -> Option<TaskResult> {
        let next = self
            .results
            .lock()
            .unwrap()
            .get_mut(&task_id)
            .and_then(|q| q.pop_front());
        if next.is_none() {
            std::thread::sleep(timeout.min(Duration::from_millis(50)));
        }
        next
    }

    fn remove_waiting_task_id(&self, task_id: i32) {
        self.waiting.lock().unwrap().remove(&task_id);
        self.results.lock().unwrap().remove(&task_id);
    }
}

struct WhitespaceTokenizer {
    fail: bool,
}

impl PromptTokenizer for WhitespaceTokenizer {
    fn tokenize(&self, prompt: &str) -> Result<Vec<i32>, String> {
        if self.fail {
            return Err("vocabulary unavailable".to_string());
        }
        Ok(prompt.split_whitespace().map(|w| w.len() as i32).collect())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestServer {
    bridge: Arc<DdsBridge>,
    engine: Arc<ScriptedEngine>,
    running: Arc<AtomicBool>,
    dispatch_thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(domain_id: u32, script: Script) -> Self {
        Self::start_with(domain_id, script, false, Duration::from_secs(10))
    }

    fn start_with(
        domain_id: u32,
        script: Script,
        tokenizer_fails: bool,
        dds_timeout: Duration,
    ) -> Self {
        let config = BridgeConfig {
            domain_id,
            dds_timeout,
            total_slots: 4,
            profile: intra_profile(),
            ..BridgeConfig::default()
        };
        let bridge = Arc::new(DdsBridge::new(config));
        bridge.set_model_info("tinyllama", true, 4);
        bridge.start().expect("bridge should start");

        let engine = ScriptedEngine::new(script);
        let handles = EngineHandles {
            tokenizer: Arc::new(WhitespaceTokenizer {
                fail: tokenizer_fails,
            }),
            template: None,
            tasks: engine.clone(),
            results: engine.clone(),
        };
        let dispatcher = Dispatcher::new(Arc::clone(&bridge), handles, "tinyllama");

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let dispatch_thread = std::thread::spawn(move || {
            dispatcher.run(&thread_running);
        });

        Self {
            bridge,
            engine,
            running,
            dispatch_thread: Some(dispatch_thread),
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.bridge.stop();
        if let Some(handle) = self.dispatch_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TestClient {
    transport: DdsTransport,
    responses: Arc<Mutex<Vec<ChatCompletionResponse>>>,
    statuses: Arc<Mutex<Vec<ServerStatus>>>,
}

impl TestClient {
    fn start(domain_id: u32) -> Self {
        let transport = DdsTransport::new(domain_id, intra_profile());
        let responses: Arc<Mutex<Vec<ChatCompletionResponse>>> = Arc::default();
        let statuses: Arc<Mutex<Vec<ServerStatus>>> = Arc::default();

        let r = Arc::clone(&responses);
        let s = Arc::clone(&statuses);
        transport
            .start_client(
                move |resp| r.lock().unwrap().push(resp),
                move |status| s.lock().unwrap().push(status),
            )
            .expect("client should start");

        Self {
            transport,
            responses,
            statuses,
        }
    }

    fn session(&self, request_id: &str) -> Vec<ChatCompletionResponse> {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect()
    }

    /// Wait until the session for `request_id` has a terminal sample.
    fn wait_for_terminal(&self, request_id: &str, timeout: Duration) -> Vec<ChatCompletionResponse> {
        let deadline = Instant::now() + timeout;
        loop {
            let session = self.session(request_id);
            if session.iter().any(|r| r.is_final) {
                return session;
            }
            assert!(
                Instant::now() < deadline,
                "no terminal sample for {} within {:?}",
                request_id,
                timeout
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn intra_profile() -> TransportProfile {
    TransportProfile {
        kind: ProfileKind::IntraProcess,
        ..TransportProfile::default()
    }
}

fn user_request(id: &str, text: &str, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        request_id: id.to_string(),
        model: "tinyllama".to_string(),
        messages: vec![ChatMessage::new("user", text)],
        max_tokens: 100,
        stream,
        ..Default::default()
    }
}

fn settle() {
    // Intra-process binding is quick; give the endpoints a moment anyway.
    std::thread::sleep(Duration::from_millis(200));
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_non_streaming_round_trip() {
    let mut server = TestServer::start(30, Script::OneShot { text: "4".into() });
    let client = TestClient::start(30);
    settle();

    client
        .transport
        .send_request(&user_request("u1", "What is 2+2?", false))
        .expect("send should succeed");

    let session = client.wait_for_terminal("u1", Duration::from_secs(5));
    assert_eq!(session.len(), 1, "non-streaming session is a single sample");

    let terminal = &session[0];
    assert_eq!(terminal.request_id, "u1");
    assert!(terminal.is_final);
    assert_eq!(terminal.content, "4");
    assert_eq!(terminal.finish_reason.as_deref(), Some("length"));
    assert!(terminal.completion_tokens >= 1);
    assert!(terminal.prompt_tokens >= 1);

    // The waiting-set entry is dropped right after the terminal goes out.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server.engine.waiting_count(), 0, "waiting set must drain");
    server.stop();
    client.transport.stop_client();
}

#[test]
fn test_streaming_session_order() {
    let text = "neural networks learn representations from data".to_string();
    let mut server = TestServer::start(
        31,
        Script::Chunked {
            text: text.clone(),
            chunks: 5,
        },
    );
    let client = TestClient::start(31);
    settle();

    client
        .transport
        .send_request(&user_request("u2", "Write about neural networks", true))
        .expect("send should succeed");

    let session = client.wait_for_terminal("u2", Duration::from_secs(5));
    assert!(session.len() >= 2, "expected partials plus a terminal");

    // The terminal is the last sample of the session, exactly once.
    assert_eq!(session.iter().filter(|r| r.is_final).count(), 1);
    let terminal = session.last().expect("session is non-empty");
    assert!(terminal.is_final);
    assert!(terminal.content.is_empty());
    assert_eq!(terminal.finish_reason.as_deref(), Some("stop"));

    // Partials reassemble the full text, token counts never decrease.
    let mut assembled = String::new();
    let mut last_count = 0;
    for sample in &session {
        assert!(sample.completion_tokens >= last_count);
        last_count = sample.completion_tokens;
        if !sample.is_final {
            assert!(sample.finish_reason.is_none());
            assembled.push_str(&sample.content);
        }
    }
    assert_eq!(assembled, text);

    server.stop();
    client.transport.stop_client();
}

#[test]
fn test_concurrent_sessions_stay_isolated() {
    let text = "streamed reply text".to_string();
    let mut server = TestServer::start(
        32,
        Script::Chunked {
            text: text.clone(),
            chunks: 3,
        },
    );
    let client = TestClient::start(32);
    settle();

    client
        .transport
        .send_request(&user_request("u4", "first", true))
        .expect("send should succeed");
    client
        .transport
        .send_request(&user_request("u5", "second", true))
        .expect("send should succeed");

    let a = client.wait_for_terminal("u4", Duration::from_secs(5));
    let b = client.wait_for_terminal("u5", Duration::from_secs(5));

    for session in [&a, &b] {
        assert_eq!(session.iter().filter(|r| r.is_final).count(), 1);
        let assembled: String = session
            .iter()
            .filter(|r| !r.is_final)
            .map(|r| r.content.as_str())
            .collect();
        assert_eq!(assembled, text);
    }

    // No sample carries a foreign id.
    for resp in client.responses.lock().unwrap().iter() {
        assert!(resp.request_id == "u4" || resp.request_id == "u5");
    }

    server.stop();
    client.transport.stop_client();
}

#[test]
fn test_tokenize_failure_yields_terminal_error() {
    let mut server = TestServer::start_with(
        33,
        Script::OneShot {
            text: "unused".into(),
        },
        true,
        Duration::from_secs(10),
    );
    let client = TestClient::start(33);
    settle();

    client
        .transport
        .send_request(&user_request("u6", "hello", false))
        .expect("send should succeed");

    let session = client.wait_for_terminal("u6", Duration::from_secs(5));
    assert_eq!(session.len(), 1);
    let terminal = &session[0];
    assert!(terminal.is_final);
    assert_eq!(terminal.finish_reason.as_deref(), Some("error"));
    assert!(terminal.content.contains("failed to tokenize"));

    server.stop();
    client.transport.stop_client();
}

#[test]
fn test_deadline_yields_synthetic_terminal() {
    let mut server = TestServer::start_with(34, Script::Silent, false, Duration::from_millis(300));
    let client = TestClient::start(34);
    settle();

    client
        .transport
        .send_request(&user_request("u7", "hello", false))
        .expect("send should succeed");

    let session = client.wait_for_terminal("u7", Duration::from_secs(10));
    assert_eq!(session.len(), 1);
    let terminal = &session[0];
    assert!(terminal.is_final);
    assert_eq!(terminal.finish_reason.as_deref(), Some("error"));
    assert_eq!(terminal.content, "[timeout]");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server.engine.waiting_count(), 0);

    server.stop();
    client.transport.stop_client();
}

#[test]
fn test_engine_error_yields_terminal_error() {
    let mut server = TestServer::start(
        35,
        Script::Fail {
            message: "slot exploded".into(),
        },
    );
    let client = TestClient::start(35);
    settle();

    client
        .transport
        .send_request(&user_request("u8", "hello", false))
        .expect("send should succeed");

    let session = client.wait_for_terminal("u8", Duration::from_secs(5));
    let terminal = session.last().expect("session is non-empty");
    assert_eq!(terminal.finish_reason.as_deref(), Some("error"));
    assert_eq!(terminal.content, "[Error: slot exploded]");

    server.stop();
    client.transport.stop_client();
}

#[test]
fn test_manual_status_publish_reaches_client() {
    let mut server = TestServer::start(36, Script::OneShot { text: "ok".into() });
    let client = TestClient::start(36);
    settle();

    server
        .bridge
        .update_status("llama-dds-server", 3, 1, "tinyllama", true);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(status) = client.statuses.lock().unwrap().last().cloned() {
            assert_eq!(status.server_id, "llama-dds-server");
            assert_eq!(status.slots_idle, 3);
            assert_eq!(status.slots_processing, 1);
            assert_eq!(status.model_loaded, "tinyllama");
            assert!(status.ready);
            break;
        }
        assert!(Instant::now() < deadline, "no status sample received");
        std::thread::sleep(Duration::from_millis(10));
    }

    server.stop();
    client.transport.stop_client();
}

#[test]
fn test_shutdown_is_idempotent_mid_flight() {
    // Short deadline: stop() joins the dispatch thread, which finishes its
    // current receive loop first.
    let mut server = TestServer::start_with(37, Script::Silent, false, Duration::from_secs(1));
    let client = TestClient::start(37);
    settle();

    // Leave a request in the dispatch receive loop, then shut down.
    client
        .transport
        .send_request(&user_request("u9", "hello", false))
        .expect("send should succeed");
    std::thread::sleep(Duration::from_millis(200));

    let begin = Instant::now();
    server.stop();
    server.stop();
    // Reader joins within one waitset timeout; the engine task is abandoned.
    assert!(begin.elapsed() < Duration::from_secs(8));

    client.transport.stop_client();
    client.transport.stop_client();
    assert!(!client.transport.is_running());
}
