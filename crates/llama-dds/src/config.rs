// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration and transport profiles.
//!
//! The transport profile is resolved from the `LLAMA_DDS_PROFILE` environment
//! variable: either a builtin name (`local`, `network`, `shm`,
//! `intra-process`) or a path to an XML profile file. Unset means `network`.
//!
//! XML schema:
//!
//! ```xml
//! <llama_dds>
//!   <transport>
//!     <kind>local</kind>
//!     <history_depth>32</history_depth>
//!     <static_peer>192.168.1.20:7411</static_peer>
//!   </transport>
//! </llama_dds>
//! ```

use std::time::Duration;

use clap::Args;
use hdds::dds::ParticipantBuilder;
use hdds::{Participant, TransportMode};
use roxmltree::Document;

use crate::error::{Error, Result};

/// Environment variable naming the transport profile (builtin or XML path).
pub const PROFILE_ENV: &str = "LLAMA_DDS_PROFILE";

/// Default per-request deadline on the server side, seconds.
pub const DEFAULT_DDS_TIMEOUT_SECS: u64 = 60;

/// History depth on the request/response topics. Streaming-heavy
/// deployments raise this via the profile (the benchmarks use 32).
pub const DEFAULT_HISTORY_DEPTH: u32 = 8;

/// How a participant reaches its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileKind {
    /// Same-host, loopback peers only; multicast stays off.
    Local,
    /// UDP multicast discovery; the usual deployment.
    #[default]
    Network,
    /// Shared-memory transport between same-host processes.
    SharedMemory,
    /// Single-process wiring; used by tests and demos.
    IntraProcess,
}

/// Resolved transport profile.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportProfile {
    pub kind: ProfileKind,
    /// History depth for the request/response topics.
    pub history_depth: Option<u32>,
    /// Extra unicast peers for multicast-less networks.
    pub static_peers: Vec<String>,
}

impl TransportProfile {
    /// Resolve from [`PROFILE_ENV`]; unset falls back to `network`.
    pub fn from_env() -> Result<Self> {
        match std::env::var(PROFILE_ENV) {
            Ok(value) => Self::resolve(&value),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Resolve a builtin name or an XML file path.
    pub fn resolve(value: &str) -> Result<Self> {
        if let Some(kind) = ProfileKind::from_name(value) {
            return Ok(Self {
                kind,
                ..Self::default()
            });
        }
        let xml = std::fs::read_to_string(value)
            .map_err(|e| Error::Profile(format!("failed to read {}: {}", value, e)))?;
        Self::parse_xml(&xml)
    }

    /// Parse the profile XML.
    pub fn parse_xml(xml: &str) -> Result<Self> {
        let doc =
            Document::parse(xml).map_err(|e| Error::Profile(format!("invalid XML: {}", e)))?;
        let root = doc.root_element();

        let transport = root
            .descendants()
            .find(|n| n.tag_name().name() == "transport")
            .ok_or_else(|| Error::Profile("no <transport> element".to_string()))?;

        let kind = transport
            .descendants()
            .find(|n| n.tag_name().name() == "kind")
            .and_then(|n| n.text())
            .map(str::trim)
            .ok_or_else(|| Error::Profile("no <kind> element".to_string()))?;
        let kind = ProfileKind::from_name(kind)
            .ok_or_else(|| Error::Profile(format!("unknown transport kind '{}'", kind)))?;

        let history_depth = match transport
            .descendants()
            .find(|n| n.tag_name().name() == "history_depth")
            .and_then(|n| n.text())
        {
            Some(text) => Some(
                text.trim()
                    .parse::<u32>()
                    .map_err(|e| Error::Profile(format!("bad history_depth: {}", e)))?,
            ),
            None => None,
        };

        let static_peers = transport
            .descendants()
            .filter(|n| n.tag_name().name() == "static_peer")
            .filter_map(|n| n.text())
            .map(|t| t.trim().to_string())
            .collect();

        Ok(Self {
            kind,
            history_depth,
            static_peers,
        })
    }

    /// Apply the profile to a participant builder.
    pub fn configure(&self, mut builder: ParticipantBuilder) -> ParticipantBuilder {
        match self.kind {
            ProfileKind::IntraProcess => {
                builder = builder.with_transport(TransportMode::IntraProcess);
            }
            ProfileKind::Local => {
                // Loopback unicast only: multicast discovery replaced by a
                // static peer on the default user-data port.
                builder = builder
                    .with_transport(TransportMode::UdpMulticast)
                    .add_static_peer("127.0.0.1:7411");
            }
            ProfileKind::Network => {
                builder = builder.with_transport(TransportMode::UdpMulticast);
            }
            ProfileKind::SharedMemory => {
                builder = builder
                    .with_transport(TransportMode::UdpMulticast)
                    .shm_require();
            }
        }
        for peer in &self.static_peers {
            builder = builder.add_static_peer(peer);
        }
        builder
    }

    /// Build a participant for this profile.
    pub fn build_participant(
        &self,
        name: &str,
        domain_id: u32,
    ) -> Result<std::sync::Arc<Participant>> {
        let builder = Participant::builder(name).domain_id(domain_id);
        Ok(self.configure(builder).build()?)
    }

    /// History depth for the request/response topics.
    pub fn history_depth(&self) -> u32 {
        self.history_depth.unwrap_or(DEFAULT_HISTORY_DEPTH)
    }
}

impl ProfileKind {
    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "local" | "loopback" => Some(Self::Local),
            "network" | "udp" | "multicast" => Some(Self::Network),
            "shm" | "shared-memory" | "shared_memory" => Some(Self::SharedMemory),
            "intra" | "intra-process" | "intraprocess" => Some(Self::IntraProcess),
            _ => None,
        }
    }
}

/// CLI fragment for the DDS surface.
///
/// Hosts flatten this into their own parser with `#[command(flatten)]` so
/// server and client binaries expose the same flag names.
#[derive(Debug, Clone, Args)]
pub struct DdsParams {
    /// Enable the DDS transport
    #[arg(long = "enable-dds")]
    pub enable_dds: bool,

    /// DDS domain ID
    #[arg(long = "dds-domain", default_value_t = 0)]
    pub dds_domain: u32,

    /// Per-request deadline in seconds
    #[arg(long = "dds-timeout", value_name = "SECONDS", default_value_t = DEFAULT_DDS_TIMEOUT_SECS)]
    pub dds_timeout_secs: u64,

    /// Parallel engine slots reported in status heartbeats
    #[arg(long = "parallel", default_value_t = 1)]
    pub parallel: i32,
}

impl DdsParams {
    /// Build a [`BridgeConfig`] from the parsed flags, resolving the
    /// transport profile from the environment.
    pub fn to_bridge_config(&self) -> Result<BridgeConfig> {
        Ok(BridgeConfig {
            domain_id: self.dds_domain,
            dds_timeout: Duration::from_secs(self.dds_timeout_secs),
            total_slots: self.parallel.max(1),
            profile: TransportProfile::from_env()?,
            ..BridgeConfig::default()
        })
    }
}

/// Configuration consumed by [`crate::DdsBridge`].
///
/// The host server fills this from its CLI surface (see [`DdsParams`]).
/// The request/response history depth travels with the transport profile.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// DDS domain id (`--dds-domain`, default 0).
    pub domain_id: u32,
    /// Identifier placed in status heartbeats.
    pub server_id: String,
    /// Per-request deadline in the dispatch receive loop (`--dds-timeout`).
    pub dds_timeout: Duration,
    /// Parallel engine slots reported in heartbeats (`--parallel`).
    pub total_slots: i32,
    /// Transport profile for the participant and topic QoS depth.
    pub profile: TransportProfile,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            domain_id: 0,
            server_id: "llama-dds-server".to_string(),
            dds_timeout: Duration::from_secs(DEFAULT_DDS_TIMEOUT_SECS),
            total_slots: 1,
            profile: TransportProfile::default(),
        }
    }
}

impl BridgeConfig {
    /// Default config on the given domain, profile taken from the
    /// environment.
    pub fn for_domain(domain_id: u32) -> Result<Self> {
        Ok(Self {
            domain_id,
            profile: TransportProfile::from_env()?,
            ..Self::default()
        })
    }
}
