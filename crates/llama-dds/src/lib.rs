// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # llama-dds: DDS transport for a local inference server
//!
//! Request/response chat completions over DDS topics, as an alternative path
//! to a local inference server's HTTP interface. Clients publish
//! [`ChatCompletionRequest`] samples; the server streams back
//! [`ChatCompletionResponse`] samples correlated by a per-request UUID, and
//! heartbeats [`ServerStatus`] for discovery.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                         Inference server                           |
//! |   Dispatcher  ->  engine traits (tokenize / post / recv results)   |
//! +--------------------------------------------------------------------+
//! |                            DdsBridge                               |
//! |   pending map + condvar  |  in-flight count  |  heartbeat thread   |
//! +--------------------------------------------------------------------+
//! |                           DdsTransport                             |
//! |   participant | request reader (waitset loop) | response writers   |
//! +--------------------------------------------------------------------+
//! |                          hdds middleware                           |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Server wiring
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use llama_dds::{BridgeConfig, DdsBridge, Dispatcher, EngineHandles};
//!
//! # fn engine_handles() -> EngineHandles { unimplemented!() }
//! let bridge = Arc::new(DdsBridge::new(BridgeConfig::for_domain(0)?));
//! bridge.set_model_info("phi4-mini", true, 4);
//! bridge.start()?;
//!
//! let dispatcher = Dispatcher::new(Arc::clone(&bridge), engine_handles(), "phi4-mini");
//! let running = AtomicBool::new(true);
//! dispatcher.run(&running); // polling thread body
//! bridge.stop();
//! # Ok::<(), llama_dds::Error>(())
//! ```
//!
//! ## Client wiring
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use llama_dds::{msg, util, DdsTransport, TransportProfile};
//!
//! let transport = DdsTransport::new(0, TransportProfile::from_env()?);
//! transport.start_client(
//!     |resp| println!("chunk: {}", resp.content),
//!     |status| println!("server ready: {}", status.ready),
//! )?;
//! transport.wait_for_server(Duration::from_secs(10))?;
//!
//! let request = msg::ChatCompletionRequest {
//!     request_id: util::new_request_id(),
//!     messages: vec![msg::ChatMessage::new(msg::ROLE_USER, "What is 2+2?")],
//!     ..Default::default()
//! };
//! transport.send_request(&request)?;
//! # Ok::<(), llama_dds::Error>(())
//! ```

/// Request queue and heartbeat publisher between transport and dispatch.
pub mod bridge;
/// Bridge configuration and XML transport profiles.
pub mod config;
/// Dispatch loop mapping requests onto the inference engine.
pub mod dispatch;
/// Narrow traits for the external inference engine.
pub mod engine;
/// Error types.
pub mod error;
/// Topic message types and their CDR encoding.
pub mod msg;
/// DDS participant/endpoint ownership and reader loops.
pub mod transport;
/// Request-id generation and validation.
pub mod util;

pub use bridge::DdsBridge;
pub use config::{BridgeConfig, DdsParams, ProfileKind, TransportProfile, PROFILE_ENV};
pub use dispatch::{Dispatcher, EngineHandles};
pub use engine::{
    ChatTemplate, InferenceTask, PromptTokenizer, ResponseQueue, SamplingParams, StopKind,
    TaskQueue, TaskResult,
};
pub use error::{Error, Result};
pub use msg::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ServerStatus};
pub use transport::{DdsTransport, TOPIC_REQUEST, TOPIC_RESPONSE, TOPIC_STATUS};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
