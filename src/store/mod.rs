// src/store/mod.rs
//! Durable flow store
//!
//! The store is shared by two independent processes and is their only
//! coordination channel:
//!
//! - **Flows**: one record per exchange, keyed by flow id, with monotonic state
//! - **Settings**: the intercept-mode flag (last writer wins)
//! - **Pending commands**: single-use forward/drop decisions per flow
//!
//! # Architecture
//!
//! ```text
//! Capture Host ──create/mark/resolve──► ┌──────────────┐ ◄──issue/set mode── Control Plane
//!                                       │ SQLite (WAL) │
//! Command Poller ◄──ready/apply──────── └──────────────┘ ──list pending────►
//! ```

pub mod flow_store;
pub mod models;
pub mod schema;

pub use flow_store::FlowStore;
pub use models::{
    AppliedCommand, CommandOutcome, FlowId, FlowRecord, FlowState, FlowUpdate, PendingCommand, PendingFlow,
    Resolution,
};
