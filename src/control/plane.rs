// src/control/plane.rs
//! Control plane
//!
//! The operator-facing side of interception. It runs in its own process (the
//! `flowgate` binary) or inside the capture process, and talks to the
//! capture host only through the flow store.

use crate::capture::framing;
use crate::poller::PollerWaker;
use crate::store::{CommandOutcome, FlowId, FlowRecord, FlowStore, PendingCommand, PendingFlow};
use crate::utils::config::StoreConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use tracing::info;

pub struct ControlPlane {
    store: FlowStore,
    waker: Option<PollerWaker>,
}

impl ControlPlane {
    pub fn new(store: FlowStore) -> Self {
        Self { store, waker: None }
    }

    pub async fn open(config: &StoreConfig) -> Result<Self> {
        Ok(Self::new(FlowStore::open(config).await?))
    }

    /// Wake an in-process poller after every change instead of waiting for
    /// its next tick
    pub fn with_waker(mut self, waker: PollerWaker) -> Self {
        self.waker = Some(waker);
        self
    }

    pub async fn intercept_mode(&self) -> Result<bool> {
        self.store.intercept_mode().await
    }

    /// Turn interception on or off. Only exchanges arriving afterwards are
    /// affected by enabling; disabling releases everything pending.
    pub async fn set_intercept_mode(&self, enabled: bool) -> Result<()> {
        self.store.set_intercept_mode(enabled).await?;
        info!("Intercept mode {}", if enabled { "enabled" } else { "disabled" });
        self.wake();
        Ok(())
    }

    /// Pending flows in arrival order. An empty list means nothing is
    /// waiting; an unreachable store is an error.
    pub async fn list_pending(&self) -> Result<Vec<PendingFlow>> {
        self.store.list_pending().await
    }

    /// Queue a forward decision, optionally replacing the request bytes
    pub async fn forward(&self, flow_id: &FlowId, edited: Option<Bytes>) -> Result<CommandOutcome> {
        if let Some(bytes) = &edited {
            let record = self
                .store
                .get_flow(flow_id)
                .await?
                .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;

            if record.state.is_terminal() {
                return Ok(CommandOutcome::AlreadyTerminal);
            }
            framing::revalidate(bytes, &record.host, record.port)?;
        }

        self.issue(flow_id, PendingCommand::Forward { edited }).await
    }

    /// Queue a drop decision
    pub async fn drop_flow(&self, flow_id: &FlowId) -> Result<CommandOutcome> {
        self.issue(flow_id, PendingCommand::Drop).await
    }

    pub async fn flow(&self, flow_id: &FlowId) -> Result<Option<FlowRecord>> {
        self.store.get_flow(flow_id).await
    }

    async fn issue(&self, flow_id: &FlowId, command: PendingCommand) -> Result<CommandOutcome> {
        let kind = command.kind();
        let outcome = self.store.issue_command(flow_id, &command).await?;
        match outcome {
            CommandOutcome::Queued => {
                info!("Queued {} for {}", kind, flow_id);
                self.wake();
            }
            CommandOutcome::AlreadyQueued | CommandOutcome::AlreadyTerminal => {
                info!("Ignored {} for {}: {:?}", kind, flow_id, outcome);
            }
        }
        Ok(outcome)
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }
}
