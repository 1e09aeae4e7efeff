// src/lib.rs
//! Flowgate Interception Engine Library
//!
//! Synchronizes a traffic-capturing proxy with an operator-facing control
//! surface so individual HTTP exchanges can be paused, inspected, edited,
//! forwarded or dropped.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **capture**: Flow state machine run by the proxy, per-exchange gates,
//!   request framing and sessions
//! - **store**: SQLite flow store shared by the capture and control processes
//! - **poller**: Applies queued decisions and bulk releases to blocked exchanges
//! - **control**: Intercept mode, pending list and per-flow decisions
//! - **observability**: Logging setup
//! - **utils**: Configuration and errors

// Public module exports
pub mod capture;
pub mod control;
pub mod observability;
pub mod poller;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use capture::{CaptureHost, CapturedResponse, Exchange, ExchangeVerdict, Session};
pub use control::ControlPlane;
pub use poller::{CommandPoller, PollerHandle, PollerWaker, TickReport};
pub use store::{
    AppliedCommand, CommandOutcome, FlowId, FlowRecord, FlowState, FlowStore, PendingCommand,
    PendingFlow,
};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, built {}, {})",
            self.version, self.git_hash, self.build_timestamp, self.rustc_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(info.to_string().starts_with(VERSION));
    }
}
