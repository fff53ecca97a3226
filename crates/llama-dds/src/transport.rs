// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DDS send/receive layer.
//!
//! Owns the participant and every endpoint, and drives one waitset-based
//! reader thread per role. The server role listens on the request topic and
//! writes responses and status heartbeats; the client role is the mirror
//! image.
//!
//! Threading model
//! ---------------
//! - `start_server()` / `start_client()` spawn the reader thread; callbacks
//!   are invoked from that thread and must not block indefinitely (there is
//!   no queue at this layer).
//! - `send_response()`, `publish_status()` and `send_request()` are safe to
//!   call from any thread once the respective `start_*` succeeded.
//! - `stop_server()` / `stop_client()` join the reader thread. Never call
//!   them from inside a callback.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hdds::{DataReader, DataWriter, GuardCondition, Participant, QoS, WaitSet};
use log::{debug, error, info, warn};

use crate::config::TransportProfile;
use crate::error::{Error, Result};
use crate::msg::{ChatCompletionRequest, ChatCompletionResponse, ServerStatus};

/// Topic names are part of the wire contract. Never change them.
pub const TOPIC_REQUEST: &str = "llama_chat_completion_request";
pub const TOPIC_RESPONSE: &str = "llama_chat_completion_response";
pub const TOPIC_STATUS: &str = "llama_server_status";

/// Waitset timeout; bounds shutdown latency of the reader thread.
const READER_WAIT: Duration = Duration::from_millis(500);
/// Poll interval for client-side server discovery.
const DISCOVERY_POLL: Duration = Duration::from_millis(100);

pub type RequestCallback = Box<dyn Fn(ChatCompletionRequest) + Send + Sync>;
pub type ResponseCallback = Box<dyn Fn(ChatCompletionResponse) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(ServerStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    state: State,
    participant: Option<Arc<Participant>>,
    request_writer: Option<Arc<Mutex<DataWriter<ChatCompletionRequest>>>>,
    response_writer: Option<Arc<Mutex<DataWriter<ChatCompletionResponse>>>>,
    status_writer: Option<Arc<Mutex<DataWriter<ServerStatus>>>>,
    shutdown: Option<Arc<GuardCondition>>,
    reader_thread: Option<JoinHandle<()>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: State::Idle,
            participant: None,
            request_writer: None,
            response_writer: None,
            status_writer: None,
            shutdown: None,
            reader_thread: None,
        }
    }
}

impl Inner {
    /// Drop every entity, newest first.
    fn clear(&mut self) {
        self.reader_thread = None;
        self.shutdown = None;
        self.request_writer = None;
        self.response_writer = None;
        self.status_writer = None;
        self.participant = None;
        self.state = State::Idle;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            debug!("[transport] mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Low-level DDS transport for the chat-completion topics.
///
/// State machine per role: `Idle → Starting → Running → Stopping → Idle`.
/// `start_*` on a non-idle transport is rejected with
/// [`Error::AlreadyRunning`]; `stop_*` on an idle one is a no-op.
pub struct DdsTransport {
    domain_id: u32,
    profile: TransportProfile,
    running: Arc<AtomicBool>,
    inner: Mutex<Inner>,
}

impl DdsTransport {
    pub fn new(domain_id: u32, profile: TransportProfile) -> Self {
        debug!("[transport] created for domain {}", domain_id);
        Self {
            domain_id,
            profile,
            running: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    /// True while a reader thread is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn request_response_qos(&self) -> QoS {
        QoS::reliable()
            .transient_local()
            .keep_last(self.profile.history_depth())
    }

    /// Heartbeats are deliberately BestEffort + Volatile + KeepLast(1):
    /// reliable status history stalls writers under slow readers.
    fn status_qos() -> QoS {
        QoS::best_effort().keep_last(1)
    }

    // ------------------------------------------------------------------
    // Server role
    // ------------------------------------------------------------------

    /// Begin listening for inbound requests.
    ///
    /// Creates the participant, the request reader and the response/status
    /// writers, then spawns the reader thread. On any entity failure all
    /// partial state is released and the error returned.
    pub fn start_server<F>(&self, on_request: F) -> Result<()>
    where
        F: Fn(ChatCompletionRequest) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        if inner.state != State::Idle {
            return Err(Error::AlreadyRunning);
        }
        inner.state = State::Starting;

        match self.build_server(&mut inner, Box::new(on_request)) {
            Ok(()) => {
                inner.state = State::Running;
                info!(
                    "[transport] server started on domain {} (request='{}', response='{}', status='{}')",
                    self.domain_id, TOPIC_REQUEST, TOPIC_RESPONSE, TOPIC_STATUS
                );
                Ok(())
            }
            Err(e) => {
                error!("[transport] server start failed: {}", e);
                self.running.store(false, Ordering::Release);
                inner.clear();
                Err(e)
            }
        }
    }

    fn build_server(&self, inner: &mut Inner, on_request: RequestCallback) -> Result<()> {
        let participant = self
            .profile
            .build_participant("llama_dds_server", self.domain_id)?;

        let response_writer = participant
            .create_writer::<ChatCompletionResponse>(TOPIC_RESPONSE, self.request_response_qos())?;
        let status_writer =
            participant.create_writer::<ServerStatus>(TOPIC_STATUS, Self::status_qos())?;
        let request_reader = participant
            .create_reader::<ChatCompletionRequest>(TOPIC_REQUEST, self.request_response_qos())?;

        let waitset = WaitSet::new();
        waitset.attach(&request_reader)?;
        let shutdown = Arc::new(GuardCondition::new());
        waitset.attach_condition(shutdown.clone())?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let handle = std::thread::spawn(move || {
            server_reader_loop(request_reader, waitset, running, on_request);
        });

        inner.participant = Some(participant);
        inner.response_writer = Some(Arc::new(Mutex::new(response_writer)));
        inner.status_writer = Some(Arc::new(Mutex::new(status_writer)));
        inner.shutdown = Some(shutdown);
        inner.reader_thread = Some(handle);
        Ok(())
    }

    /// Stop the reader thread and release all entities. Idempotent.
    ///
    /// Must not be called from inside a transport callback: it joins the
    /// thread the callback runs on.
    pub fn stop_server(&self) {
        self.stop();
    }

    /// Publish a response sample. Thread-safe; errors are logged, the
    /// session carries on.
    pub fn send_response(&self, response: &ChatCompletionResponse) {
        let writer = lock(&self.inner).response_writer.clone();
        let Some(writer) = writer else {
            debug!("[transport] send_response with no writer (stopped?)");
            return;
        };
        if let Err(e) = lock(&writer).write(response) {
            error!(
                "[transport] failed to write response for {}: {}",
                response.request_id, e
            );
            return;
        }
        debug!(
            "[transport] sent response for request {} (final={})",
            response.request_id, response.is_final
        );
    }

    /// Publish a status heartbeat. Thread-safe; errors are logged.
    pub fn publish_status(&self, status: &ServerStatus) {
        let writer = lock(&self.inner).status_writer.clone();
        let Some(writer) = writer else {
            return;
        };
        let guard = lock(&writer);
        if let Err(e) = guard.write(status) {
            warn!("[transport] failed to write status: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Client role
    // ------------------------------------------------------------------

    /// Begin listening for responses and status updates.
    pub fn start_client<R, S>(&self, on_response: R, on_status: S) -> Result<()>
    where
        R: Fn(ChatCompletionResponse) + Send + Sync + 'static,
        S: Fn(ServerStatus) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        if inner.state != State::Idle {
            return Err(Error::AlreadyRunning);
        }
        inner.state = State::Starting;

        match self.build_client(&mut inner, Box::new(on_response), Box::new(on_status)) {
            Ok(()) => {
                inner.state = State::Running;
                info!("[transport] client started on domain {}", self.domain_id);
                Ok(())
            }
            Err(e) => {
                error!("[transport] client start failed: {}", e);
                self.running.store(false, Ordering::Release);
                inner.clear();
                Err(e)
            }
        }
    }

    fn build_client(
        &self,
        inner: &mut Inner,
        on_response: ResponseCallback,
        on_status: StatusCallback,
    ) -> Result<()> {
        let participant = self
            .profile
            .build_participant("llama_dds_client", self.domain_id)?;

        let request_writer = participant
            .create_writer::<ChatCompletionRequest>(TOPIC_REQUEST, self.request_response_qos())?;
        let response_reader = participant
            .create_reader::<ChatCompletionResponse>(TOPIC_RESPONSE, self.request_response_qos())?;
        let status_reader =
            participant.create_reader::<ServerStatus>(TOPIC_STATUS, Self::status_qos())?;

        let waitset = WaitSet::new();
        waitset.attach(&response_reader)?;
        waitset.attach(&status_reader)?;
        let shutdown = Arc::new(GuardCondition::new());
        waitset.attach_condition(shutdown.clone())?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let handle = std::thread::spawn(move || {
            client_reader_loop(
                response_reader,
                status_reader,
                waitset,
                running,
                on_response,
                on_status,
            );
        });

        inner.participant = Some(participant);
        inner.request_writer = Some(Arc::new(Mutex::new(request_writer)));
        inner.shutdown = Some(shutdown);
        inner.reader_thread = Some(handle);
        Ok(())
    }

    /// Stop the client reader thread and release all entities. Idempotent.
    pub fn stop_client(&self) {
        self.stop();
    }

    /// Publish a request. Thread-safe.
    pub fn send_request(&self, request: &ChatCompletionRequest) -> Result<()> {
        let writer = lock(&self.inner).request_writer.clone();
        let writer = writer.ok_or(Error::NotRunning)?;
        lock(&writer).write(request)?;
        debug!("[transport] sent request {}", request.request_id);
        Ok(())
    }

    /// Block until a server-side reader on the request topic is discovered.
    ///
    /// QoS mismatches produce no runtime signal (discovery just never
    /// matches), so clients call this before timing anything.
    pub fn wait_for_server(&self, timeout: Duration) -> Result<()> {
        let participant = lock(&self.inner).participant.clone();
        let participant = participant.ok_or(Error::NotRunning)?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(topics) = participant.discover_topics() {
                let matched = topics
                    .iter()
                    .any(|t| t.name == TOPIC_REQUEST && t.subscriber_count > 0);
                if matched {
                    debug!("[transport] server discovered");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::DiscoveryTimeout(timeout));
            }
            std::thread::sleep(DISCOVERY_POLL);
        }
    }

    // ------------------------------------------------------------------
    // Common
    // ------------------------------------------------------------------

    fn stop(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == State::Idle {
            debug!("[transport] stop on idle transport (no-op)");
            return;
        }
        inner.state = State::Stopping;

        self.running.store(false, Ordering::Release);
        if let Some(guard) = inner.shutdown.take() {
            guard.set_trigger_value(true);
        }
        if let Some(handle) = inner.reader_thread.take() {
            if handle.join().is_err() {
                warn!("[transport] reader thread panicked before join");
            }
        }

        inner.clear();
        info!("[transport] stopped");
    }
}

impl Drop for DdsTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Deliver one sample to a callback, fencing off panics so a misbehaving
/// callback cannot take down the reader thread.
fn deliver<T, F: Fn(T)>(label: &str, sample: T, callback: &F) {
    if catch_unwind(AssertUnwindSafe(|| callback(sample))).is_err() {
        error!("[transport] {} callback panicked; continuing", label);
    }
}

fn server_reader_loop(
    reader: DataReader<ChatCompletionRequest>,
    waitset: WaitSet,
    running: Arc<AtomicBool>,
    on_request: RequestCallback,
) {
    debug!("[transport] request reader loop started");

    while running.load(Ordering::Acquire) {
        let woke = match waitset.wait(Some(READER_WAIT)) {
            Ok(_) => true,
            Err(hdds::Error::WouldBlock) => false,
            Err(e) => {
                error!("[transport] waitset error: {}", e);
                break;
            }
        };
        // Re-test after every wake or timeout; the shutdown guard trips the
        // waitset but carries no data.
        if !running.load(Ordering::Acquire) {
            break;
        }
        if !woke {
            continue;
        }

        loop {
            match reader.take() {
                Ok(Some(request)) => {
                    debug!(
                        "[transport] received request id={} model={}",
                        request.request_id, request.model
                    );
                    deliver("request", request, &on_request);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[transport] request read error: {}", e);
                    break;
                }
            }
        }
    }

    debug!("[transport] request reader loop ended");
}

fn client_reader_loop(
    response_reader: DataReader<ChatCompletionResponse>,
    status_reader: DataReader<ServerStatus>,
    waitset: WaitSet,
    running: Arc<AtomicBool>,
    on_response: ResponseCallback,
    on_status: StatusCallback,
) {
    debug!("[transport] client reader loop started");

    while running.load(Ordering::Acquire) {
        let woke = match waitset.wait(Some(READER_WAIT)) {
            Ok(_) => true,
            Err(hdds::Error::WouldBlock) => false,
            Err(e) => {
                error!("[transport] waitset error: {}", e);
                break;
            }
        };
        if !running.load(Ordering::Acquire) {
            break;
        }
        if !woke {
            continue;
        }

        loop {
            match response_reader.take() {
                Ok(Some(response)) => deliver("response", response, &on_response),
                Ok(None) => break,
                Err(e) => {
                    warn!("[transport] response read error: {}", e);
                    break;
                }
            }
        }
        loop {
            match status_reader.take() {
                Ok(Some(status)) => deliver("status", status, &on_status),
                Ok(None) => break,
                Err(e) => {
                    warn!("[transport] status read error: {}", e);
                    break;
                }
            }
        }
    }

    debug!("[transport] client reader loop ended");
}
