// src/poller/command_poller.rs
//! Command poller
//!
//! Applies control-plane decisions to blocked exchanges. Each tick derives
//! its work from the store alone, so a restarted poller simply carries on:
//!
//! 1. Read intercept mode
//! 2. Apply every ready command in arrival order
//! 3. If intercept mode is off, release every remaining pending flow
//!
//! After a fail-open episode the loop first records the exchanges it let
//! through as released, so a command queued meanwhile can no longer claim
//! them.
//!
//! Ticks run on a fixed interval and whenever the in-process control plane
//! fires the [`PollerWaker`].

use crate::capture::{CaptureHost, CommandApplied, Session};
use crate::poller::backoff::{retry_delays, RetryDelays};
use crate::store::FlowId;
use crate::utils::config::PollerConfig;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FAIL_OPEN_NOTE: &str = "released: store was unreachable";

/// Wakes the poller ahead of its next interval tick
#[derive(Debug, Clone, Default)]
pub struct PollerWaker {
    notify: Arc<Notify>,
}

impl PollerWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub intercept_mode: bool,

    /// Released by an explicit forward command
    pub released: Vec<FlowId>,
    pub dropped: Vec<FlowId>,

    /// Forward commands whose edits failed validation
    pub rejected: Vec<FlowId>,

    /// Released because intercept mode is off, in arrival order
    pub bulk_released: Vec<FlowId>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.released.is_empty()
            && self.dropped.is_empty()
            && self.rejected.is_empty()
            && self.bulk_released.is_empty()
    }
}

pub struct CommandPoller {
    host: Arc<CaptureHost>,
    config: PollerConfig,
    waker: PollerWaker,
    delays: RetryDelays,
    failures: u32,
    failing_since: Option<Instant>,

    /// Exchanges released fail-open whose records are still pending
    unsettled: Vec<(Arc<Session>, Vec<FlowId>)>,
}

impl CommandPoller {
    pub fn new(host: Arc<CaptureHost>, config: PollerConfig) -> Self {
        let delays = fresh_delays(&config);
        Self {
            host,
            config,
            waker: PollerWaker::new(),
            delays,
            failures: 0,
            failing_since: None,
            unsettled: Vec::new(),
        }
    }

    /// Waker to hand to an in-process control plane
    pub fn waker(&self) -> PollerWaker {
        self.waker.clone()
    }

    /// Run one pass against the active session
    pub async fn tick(&self) -> Result<TickReport> {
        let session = self.host.session();
        let mut report = TickReport {
            intercept_mode: session.store.intercept_mode().await?,
            ..Default::default()
        };

        for flow_id in session.store.ready_commands().await? {
            match self.host.apply_command(&session, &flow_id).await? {
                CommandApplied::Released { .. } => report.released.push(flow_id),
                CommandApplied::Dropped => report.dropped.push(flow_id),
                CommandApplied::Rejected(_) => report.rejected.push(flow_id),
                CommandApplied::Skipped => {}
            }
        }

        if !report.intercept_mode {
            report.bulk_released = self.host.release_all(&session, None).await?;
        }

        Ok(report)
    }

    /// Start the poll loop on the tokio runtime
    pub fn spawn(self) -> PollerHandle {
        let cancel = CancellationToken::new();
        let waker = self.waker.clone();
        let handle = tokio::spawn(self.run(cancel.clone()));

        PollerHandle {
            cancel,
            waker,
            handle,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let waker = self.waker.clone();

        info!("Command poller started (interval {:?})", self.config.interval());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = waker.notified() => {}
            }

            let result = match self.settle().await {
                Ok(()) => self.tick().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(report) => self.on_success(&report),
                Err(e) => {
                    let delay = self.on_failure(&e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Command poller stopped");
    }

    /// Record fail-open releases, then release any other pending flow the
    /// episode left without a gate
    async fn settle(&mut self) -> Result<()> {
        if self.unsettled.is_empty() {
            return Ok(());
        }

        while let Some((session, released)) = self.unsettled.first() {
            let settled = self
                .host
                .settle_fail_open(session, released, FAIL_OPEN_NOTE)
                .await?;
            info!(
                "Recorded {} fail-open releases in '{}'",
                settled,
                session.name()
            );
            self.unsettled.remove(0);
        }

        let session = self.host.session();
        let orphans = self.host.release_orphans(&session, FAIL_OPEN_NOTE).await?;
        if orphans > 0 {
            info!("Reconciled {} flows released while the store was down", orphans);
        }
        Ok(())
    }

    fn on_success(&mut self, report: &TickReport) {
        if let Some(since) = self.failing_since.take() {
            info!(
                "Flow store reachable again after {:?} ({} failed ticks)",
                since.elapsed(),
                self.failures
            );
            self.delays = fresh_delays(&self.config);
            self.failures = 0;
        }

        if !report.is_idle() {
            debug!(
                "Tick: {} released, {} dropped, {} rejected, {} bulk-released",
                report.released.len(),
                report.dropped.len(),
                report.rejected.len(),
                report.bulk_released.len()
            );
        }
    }

    /// Record a failed tick and return how long to wait before the next one
    fn on_failure(&mut self, err: &EngineError) -> Duration {
        let since = *self.failing_since.get_or_insert_with(Instant::now);
        self.failures = self.failures.saturating_add(1);
        let delay = self
            .delays
            .next()
            .unwrap_or_else(|| Duration::from_millis(self.config.backoff_max_ms));
        error!(
            "Poller tick failed (attempt {}): {}; retrying in {:?}",
            self.failures, err, delay
        );

        if since.elapsed() >= self.config.failure_ceiling() {
            let session = self.host.session();
            let released = self.host.fail_open_release(&session);
            if !released.is_empty() {
                warn!(
                    "Store unreachable for {:?}; released {} blocked exchanges fail-open",
                    since.elapsed(),
                    released.len()
                );
                self.unsettled.push((session, released));
            }
        }

        delay
    }
}

fn fresh_delays(config: &PollerConfig) -> RetryDelays {
    retry_delays(
        Duration::from_millis(config.backoff_initial_ms),
        Duration::from_millis(config.backoff_max_ms),
    )
}

/// Handle to a running poller
pub struct PollerHandle {
    cancel: CancellationToken,
    waker: PollerWaker,
    handle: JoinHandle<()>,
}

impl PollerHandle {
    pub fn waker(&self) -> PollerWaker {
        self.waker.clone()
    }

    /// Stop the loop and wait for the current tick to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Command poller task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Exchange, ExchangeVerdict, Session};
    use crate::store::{FlowState, FlowStore, PendingCommand};
    use crate::utils::config::CaptureConfig;
    use rusqlite::Connection;
    use tempfile::{tempdir, TempDir};

    async fn poller() -> (TempDir, Arc<CaptureHost>, CommandPoller) {
        let dir = tempdir().unwrap();
        let store = FlowStore::open_path(dir.path().join("flows.db"), Duration::from_millis(200))
            .await
            .unwrap();
        let host = CaptureHost::attach(Session::new("test", store), CaptureConfig::default()).await;
        let poller = CommandPoller::new(host.clone(), PollerConfig::default());
        (dir, host, poller)
    }

    async fn block(host: &Arc<CaptureHost>, path: &str) -> (FlowId, tokio::task::JoinHandle<ExchangeVerdict>) {
        let exchange = Exchange::new(format!("GET {} HTTP/1.1\r\nHost: example.com\r\n\r\n", path));
        let flow_id = exchange.flow_id.clone();
        let task = tokio::spawn({
            let host = host.clone();
            async move { host.on_headers(exchange).await }
        });

        let session = host.session();
        loop {
            let pending = session.store.list_pending().await.unwrap();
            if pending.iter().any(|p| p.flow_id == flow_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        (flow_id, task)
    }

    #[tokio::test]
    async fn test_idle_tick() {
        let (_dir, _host, poller) = poller().await;
        let report = poller.tick().await.unwrap();
        assert!(!report.intercept_mode);
        assert!(report.is_idle());
    }

    #[tokio::test]
    async fn test_tick_applies_commands() {
        let (_dir, host, poller) = poller().await;
        let store = host.session().store.clone();
        store.set_intercept_mode(true).await.unwrap();

        let (kept, kept_task) = block(&host, "/keep").await;
        let (dropped, dropped_task) = block(&host, "/drop").await;
        let (waiting, _waiting_task) = block(&host, "/wait").await;

        store.issue_command(&kept, &PendingCommand::forward()).await.unwrap();
        store.issue_command(&dropped, &PendingCommand::Drop).await.unwrap();

        let report = poller.tick().await.unwrap();
        assert!(report.intercept_mode);
        assert_eq!(report.released, vec![kept]);
        assert_eq!(report.dropped, vec![dropped]);
        assert!(report.bulk_released.is_empty());

        assert!(kept_task.await.unwrap().is_forward());
        assert!(matches!(dropped_task.await.unwrap(), ExchangeVerdict::Respond(_)));

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].flow_id, waiting);
    }

    #[tokio::test]
    async fn test_tick_with_mode_off_releases_everything() {
        let (_dir, host, poller) = poller().await;
        let store = host.session().store.clone();
        store.set_intercept_mode(true).await.unwrap();

        let (first, first_task) = block(&host, "/1").await;
        let (second, second_task) = block(&host, "/2").await;
        store.set_intercept_mode(false).await.unwrap();

        let report = poller.tick().await.unwrap();
        assert_eq!(report.bulk_released, vec![first, second]);
        assert!(first_task.await.unwrap().is_forward());
        assert!(second_task.await.unwrap().is_forward());
    }

    #[tokio::test]
    async fn test_spawned_poller_reacts_to_waker() {
        let dir = tempdir().unwrap();
        let store = FlowStore::open_path(dir.path().join("flows.db"), Duration::from_millis(200))
            .await
            .unwrap();
        let host = CaptureHost::attach(Session::new("test", store.clone()), CaptureConfig::default()).await;
        let config = PollerConfig {
            interval_ms: 60_000,
            failure_ceiling_ms: 60_000,
            ..Default::default()
        };
        let handle = CommandPoller::new(host.clone(), config).spawn();

        store.set_intercept_mode(true).await.unwrap();
        let (flow_id, task) = block(&host, "/woken").await;
        store.issue_command(&flow_id, &PendingCommand::Drop).await.unwrap();
        handle.waker().wake();

        let verdict = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("waker should trigger a tick")
            .unwrap();
        assert!(matches!(verdict, ExchangeVerdict::Respond(_)));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_restarted_poller_applies_interrupted_command() {
        let (_dir, host, poller) = poller().await;
        let store = host.session().store.clone();
        store.set_intercept_mode(true).await.unwrap();

        let (flow_id, task) = block(&host, "/interrupted").await;
        store.issue_command(&flow_id, &PendingCommand::forward()).await.unwrap();
        // Previous poller read the command and died before resolving the flow
        store.consume_command(&flow_id).await.unwrap();
        drop(poller);

        let restarted = CommandPoller::new(host.clone(), PollerConfig::default());
        let report = restarted.tick().await.unwrap();
        assert_eq!(report.released, vec![flow_id.clone()]);

        let verdict = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("exchange stayed blocked")
            .unwrap();
        assert!(verdict.is_forward());
        assert_eq!(
            store.get_flow(&flow_id).await.unwrap().unwrap().state,
            FlowState::Released
        );
    }

    #[tokio::test]
    async fn test_fail_open_release_wins_over_queued_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.db");
        let store = FlowStore::open_path(&path, Duration::from_millis(50)).await.unwrap();
        let host = CaptureHost::attach(Session::new("test", store.clone()), CaptureConfig::default()).await;
        store.set_intercept_mode(true).await.unwrap();

        let (flow_id, task) = block(&host, "/late-drop").await;
        store.issue_command(&flow_id, &PendingCommand::Drop).await.unwrap();

        let locker = Connection::open(&path).unwrap();
        locker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let config = PollerConfig {
            interval_ms: 10,
            backoff_initial_ms: 10,
            backoff_max_ms: 20,
            failure_ceiling_ms: 50,
        };
        let handle = CommandPoller::new(host.clone(), config).spawn();

        let verdict = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("exchange was never released fail-open")
            .unwrap();
        assert!(verdict.is_forward());

        locker.execute_batch("ROLLBACK;").unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = store.get_flow(&flow_id).await.unwrap().unwrap();
                if record.state != FlowState::PendingIntercept {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("record never left the pending set");

        // The origin got the original bytes, so the record must say released
        assert_eq!(record.state, FlowState::Released);
        assert_eq!(record.note.as_deref(), Some(FAIL_OPEN_NOTE));
        assert!(!record.edited);

        handle.shutdown().await;
    }
}
