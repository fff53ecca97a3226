// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Adapter between the DDS transport and the server's dispatch loop.
//!
//! The bridge owns two threads:
//! 1. the transport's reader thread, which calls the internal enqueue path
//!    whenever a request sample arrives;
//! 2. a status worker that publishes a `ServerStatus` heartbeat every five
//!    seconds.
//!
//! The dispatch loop talks to the bridge through two thread-safe calls:
//! [`DdsBridge::wait_for_request`] and [`DdsBridge::try_pop`]. `try_pop` is
//! the only way to take a request; check-then-act against `has_pending` is
//! exactly the race this API exists to prevent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};

use crate::config::BridgeConfig;
use crate::msg::{ChatCompletionRequest, ChatCompletionResponse, ServerStatus};
use crate::transport::DdsTransport;
use crate::Result;

/// Heartbeat period of the status worker.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
struct ModelInfo {
    name: String,
    ready: bool,
    total_slots: i32,
}

/// State shared between the transport callback, the dispatch thread and the
/// status worker.
struct Shared {
    /// Pending requests keyed by request id. Unordered; a duplicate id
    /// overwrites the previous entry (retrying with the same id is a
    /// legitimate client tactic).
    pending: Mutex<HashMap<String, ChatCompletionRequest>>,
    pending_cv: Condvar,
    /// In-flight count: incremented on enqueue, decremented when the
    /// terminal sample of a session goes out. Partial chunks do not touch
    /// it.
    in_flight: AtomicI32,
    /// Snapshot consumed by the status worker.
    model: Mutex<ModelInfo>,
    /// Heartbeat shutdown signal: flag + condvar so `stop()` need not wait
    /// out a full period.
    hb_stop: Mutex<bool>,
    hb_cv: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Thread-safe request queue plus heartbeat publisher, wired onto a
/// [`DdsTransport`] in server mode.
///
/// Lifecycle:
/// ```text
/// let bridge = DdsBridge::new(config);
/// bridge.set_model_info("phi4-mini", true, n_parallel);
/// bridge.start()?;
/// // dispatch loop: wait_for_request() / try_pop() / send_response()
/// bridge.stop();
/// ```
pub struct DdsBridge {
    config: BridgeConfig,
    transport: Arc<DdsTransport>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DdsBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let transport = Arc::new(DdsTransport::new(config.domain_id, config.profile.clone()));
        let total_slots = config.total_slots.max(1);
        Self {
            config,
            transport,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                pending_cv: Condvar::new(),
                in_flight: AtomicI32::new(0),
                model: Mutex::new(ModelInfo {
                    total_slots,
                    ..ModelInfo::default()
                }),
                hb_stop: Mutex::new(false),
                hb_cv: Condvar::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            heartbeat_thread: Mutex::new(None),
        }
    }

    pub fn domain_id(&self) -> u32 {
        self.config.domain_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Per-request deadline used by the dispatch receive loop.
    pub fn dds_timeout(&self) -> Duration {
        self.config.dds_timeout
    }

    /// Current number of in-flight requests.
    pub fn in_flight(&self) -> i32 {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Start the transport (server role) and the heartbeat worker.
    pub fn start(&self) -> Result<()> {
        // Raised before the reader thread exists so no early sample is
        // dropped by the running check in the callback.
        self.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        if let Err(e) = self.transport.start_server(move |request| {
            if !running.load(Ordering::Acquire) {
                return;
            }
            enqueue(&shared, request);
        }) {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }

        *lock(&self.shared.hb_stop) = false;

        let shared = Arc::clone(&self.shared);
        let transport = Arc::clone(&self.transport);
        let server_id = self.config.server_id.clone();
        let handle = std::thread::spawn(move || {
            heartbeat_loop(&shared, &transport, &server_id);
        });
        *lock(&self.heartbeat_thread) = Some(handle);

        info!(
            "[bridge] started on domain {} ({} slots)",
            self.config.domain_id,
            lock(&self.shared.model).total_slots
        );
        Ok(())
    }

    /// Stop everything: unblock the dispatch thread, join the heartbeat
    /// worker, tear down the transport. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // Unblock wait_for_request() callers.
        self.shared.pending_cv.notify_all();

        // Signal and join the heartbeat worker.
        {
            let mut stop = lock(&self.shared.hb_stop);
            *stop = true;
            self.shared.hb_cv.notify_all();
        }
        if let Some(handle) = lock(&self.heartbeat_thread).take() {
            let _ = handle.join();
        }

        self.transport.stop_server();
        debug!("[bridge] stopped");
    }

    /// Pop one pending request, atomically. Returns `None` when the map is
    /// empty. Ordering across ids is unspecified.
    pub fn try_pop(&self) -> Option<ChatCompletionRequest> {
        let mut pending = lock(&self.shared.pending);
        let key = pending.keys().next().cloned()?;
        pending.remove(&key)
    }

    /// Block until at least one request is pending, the bridge stops, or
    /// `timeout` elapses. Spurious wakeups are possible, so always follow up
    /// with [`Self::try_pop`].
    ///
    /// Returns true when the pending map is non-empty at wakeup.
    pub fn wait_for_request(&self, timeout: Duration) -> bool {
        let pending = lock(&self.shared.pending);
        let running = Arc::clone(&self.running);
        let (pending, _timed_out) = self
            .shared
            .pending_cv
            .wait_timeout_while(pending, timeout, |map| {
                map.is_empty() && running.load(Ordering::Acquire)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !pending.is_empty()
    }

    /// True when at least one request is queued. For introspection only;
    /// dispatch code must use [`Self::try_pop`] instead of pairing this
    /// with a pop.
    pub fn has_pending(&self) -> bool {
        !lock(&self.shared.pending).is_empty()
    }

    /// Publish a response. The in-flight counter drops only on the terminal
    /// sample of a session; streaming partials flow through unchanged.
    pub fn send_response(&self, response: &ChatCompletionResponse) {
        if response.is_final {
            let prev = self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            if prev <= 0 {
                // Underflow guard: a terminal for an unknown session.
                self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.transport.send_response(response);
    }

    /// Update the snapshot the heartbeat publishes.
    pub fn set_model_info(&self, model_name: &str, ready: bool, total_slots: i32) {
        let mut model = lock(&self.shared.model);
        model.name = model_name.to_string();
        model.ready = ready;
        model.total_slots = total_slots.max(1);
    }

    /// One-shot status publish outside the heartbeat cadence.
    pub fn update_status(
        &self,
        server_id: &str,
        slots_idle: i32,
        slots_processing: i32,
        model_loaded: &str,
        ready: bool,
    ) {
        self.transport.publish_status(&ServerStatus {
            server_id: server_id.to_string(),
            slots_idle,
            slots_processing,
            model_loaded: model_loaded.to_string(),
            ready,
        });
    }

    #[cfg(test)]
    pub(crate) fn enqueue_for_test(&self, request: ChatCompletionRequest) {
        enqueue(&self.shared, request);
    }
}

impl Drop for DdsBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Insert a request and wake the dispatch thread. Runs on the transport's
/// reader thread.
fn enqueue(shared: &Shared, request: ChatCompletionRequest) {
    debug!(
        "[bridge] request queued: id={} model={}",
        request.request_id, request.model
    );
    {
        let mut pending = lock(&shared.pending);
        pending.insert(request.request_id.clone(), request);
    }
    shared.in_flight.fetch_add(1, Ordering::AcqRel);
    shared.pending_cv.notify_one();
}

fn heartbeat_loop(shared: &Shared, transport: &DdsTransport, server_id: &str) {
    debug!("[bridge] heartbeat worker started");
    loop {
        // Sleep one period, interruptible by stop().
        {
            let stop = lock(&shared.hb_stop);
            let (stop, _) = shared
                .hb_cv
                .wait_timeout_while(stop, HEARTBEAT_PERIOD, |s| !*s)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *stop {
                break;
            }
        }

        let processing = shared.in_flight.load(Ordering::Acquire);
        let status = {
            let model = lock(&shared.model);
            ServerStatus {
                server_id: server_id.to_string(),
                slots_idle: (model.total_slots - processing).max(0),
                slots_processing: processing,
                model_loaded: model.name.clone(),
                ready: model.ready,
            }
        };
        transport.publish_status(&status);
    }
    debug!("[bridge] heartbeat worker stopped");
}
