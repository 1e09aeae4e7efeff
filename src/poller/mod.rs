// src/poller/mod.rs
//! Command poller: the only path that unblocks intercepted exchanges

pub mod backoff;
pub mod command_poller;

pub use backoff::{retry_delays, RetryDelays};
pub use command_poller::{CommandPoller, PollerHandle, PollerWaker, TickReport};
