// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the llama DDS bridge.

use thiserror::Error;

/// Errors surfaced by the transport and bridge layers.
///
/// Write failures on the response/status writers are deliberately *not* here:
/// they are logged and swallowed so a slow subscriber can never take down the
/// dispatch path.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying DDS middleware failure (entity creation, discovery, write).
    #[error("DDS error: {0}")]
    Dds(#[from] hdds::Error),

    /// `start_*` called while the transport is not idle.
    #[error("transport already running")]
    AlreadyRunning,

    /// Operation requires a started transport.
    #[error("transport not running")]
    NotRunning,

    /// No matching remote endpoint appeared within the discovery deadline.
    #[error("no server discovered within {0:?}")]
    DiscoveryTimeout(std::time::Duration),

    /// Invalid bridge configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport profile could not be resolved or parsed.
    #[error("transport profile error: {0}")]
    Profile(String),
}

/// Convenient alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
