// src/capture/mod.rs
//! Capture side of the engine
//!
//! The traffic engine hands every exchange to the [`CaptureHost`]:
//!
//! ```text
//!            on_headers
//! Engine ───────────────► CaptureHost ──create/mark──► FlowStore
//!   ▲                          │
//!   │ ExchangeVerdict          │ intercept mode on
//!   │                          ▼
//!   └─────────────────── GateRegistry ◄──open── Command Poller
//! ```

pub mod exchange;
pub mod framing;
pub mod gate;
pub mod host;
pub mod session;

pub use exchange::{CapturedResponse, Exchange, ExchangeVerdict, ServerAddr};
pub use gate::{GateDecision, GateRegistry};
pub use host::{CaptureHost, CommandApplied, DROP_MESSAGE};
pub use session::Session;
