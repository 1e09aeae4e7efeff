// src/capture/gate.rs
//! Per-exchange gates
//!
//! A blocked exchange waits on a oneshot receiver; the gate registry holds
//! the sending half plus the original request bytes so the exchange can be
//! released fail-open without the store.

use crate::capture::exchange::ExchangeVerdict;
use crate::store::FlowId;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// How a gate is opened
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// Forward the exchange; `edited` replaces the original bytes
    Release { edited: Option<Bytes> },

    /// Answer the client with a synthesized response
    Drop { response: Bytes },
}

/// A blocked exchange
#[derive(Debug)]
pub struct ParkedExchange {
    pub original: Bytes,
    order: u64,
    tx: oneshot::Sender<ExchangeVerdict>,
}

impl ParkedExchange {
    /// Open the gate. Returns false if the waiting exchange is already gone.
    pub fn open(self, decision: GateDecision) -> bool {
        let verdict = match decision {
            GateDecision::Release { edited: Some(request) } => ExchangeVerdict::Forward {
                request,
                edited: true,
            },
            GateDecision::Release { edited: None } => ExchangeVerdict::forward(self.original),
            GateDecision::Drop { response } => ExchangeVerdict::Respond(response),
        };
        self.tx.send(verdict).is_ok()
    }
}

/// Registry of blocked exchanges for one session
#[derive(Debug, Default)]
pub struct GateRegistry {
    parked: DashMap<FlowId, ParkedExchange>,
    next_order: AtomicU64,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gate for `flow_id` and return the receiver the exchange waits on
    pub fn park(&self, flow_id: FlowId, original: Bytes) -> oneshot::Receiver<ExchangeVerdict> {
        let (tx, rx) = oneshot::channel();
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);

        debug!("Parked exchange {}", flow_id);
        self.parked.insert(
            flow_id,
            ParkedExchange {
                original,
                order,
                tx,
            },
        );
        rx
    }

    /// Open the gate of `flow_id`. Returns false if no gate exists or the
    /// exchange stopped waiting.
    pub fn resolve(&self, flow_id: &FlowId, decision: GateDecision) -> bool {
        match self.take(flow_id) {
            Some(parked) => {
                let delivered = parked.open(decision);
                if !delivered {
                    debug!("Exchange {} stopped waiting before its gate opened", flow_id);
                }
                delivered
            }
            None => false,
        }
    }

    /// Remove a gate without opening it
    pub fn take(&self, flow_id: &FlowId) -> Option<ParkedExchange> {
        self.parked.remove(flow_id).map(|(_, parked)| parked)
    }

    /// Discard a gate; the waiting exchange sees its channel closed
    pub fn cancel(&self, flow_id: &FlowId) -> bool {
        let removed = self.take(flow_id).is_some();
        if removed {
            debug!("Cancelled gate for {}", flow_id);
        }
        removed
    }

    /// Remove every gate, in the order the exchanges were parked
    pub fn drain(&self) -> Vec<(FlowId, ParkedExchange)> {
        let ids: Vec<FlowId> = self.parked.iter().map(|e| e.key().clone()).collect();
        let mut drained: Vec<(FlowId, ParkedExchange)> = ids
            .into_iter()
            .filter_map(|id| self.parked.remove(&id))
            .collect();
        drained.sort_by_key(|(_, parked)| parked.order);
        drained
    }

    pub fn contains(&self, flow_id: &FlowId) -> bool {
        self.parked.contains_key(flow_id)
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}
