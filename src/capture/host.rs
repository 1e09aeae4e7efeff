// src/capture/host.rs
//! Capture host
//!
//! Runs inside the traffic engine. Every exchange is recorded; while intercept
//! mode is on, new exchanges are additionally blocked on a gate until the
//! command poller (or the hold ceiling) decides them.
//!
//! The host never surfaces store failures to the exchange: when the store
//! cannot be written or read, the exchange proceeds un-intercepted.

use crate::capture::exchange::{CapturedResponse, Exchange, ExchangeVerdict, ServerAddr};
use crate::capture::framing;
use crate::capture::gate::GateDecision;
use crate::capture::session::Session;
use crate::store::{AppliedCommand, FlowId, FlowRecord, FlowState, PendingCommand, Resolution};
use crate::utils::config::CaptureConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Body of the response synthesized for dropped exchanges
pub const DROP_MESSAGE: &str = "Request dropped by interceptor";

const ORPHAN_NOTE: &str = "released: capture process restarted";
const SWITCH_NOTE: &str = "released: capture session switched";
const SHUTDOWN_NOTE: &str = "released: capture host shut down";
const HOLD_CEILING_NOTE: &str = "released: hold ceiling reached";

/// Above this many tracked exchanges, stale entries are swept
const INFLIGHT_SWEEP_THRESHOLD: usize = 1024;
const INFLIGHT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Result of applying one queued command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandApplied {
    Released { edited: bool },
    Dropped,

    /// Edited bytes failed validation; the flow stays blocked
    Rejected(String),

    /// No command was waiting, or the flow was decided elsewhere
    Skipped,
}

/// Session of an exchange that has not reported completion yet
struct Inflight {
    session: Arc<Session>,
    since: Instant,
}

/// Flow state machine shared by every exchange of the engine
pub struct CaptureHost {
    config: CaptureConfig,
    session: RwLock<Arc<Session>>,
    inflight: DashMap<FlowId, Inflight>,
    last_sweep: Mutex<Instant>,
}

impl CaptureHost {
    /// Attach to `session`, releasing pending flows left behind by a
    /// previous capture process
    pub async fn attach(session: Session, config: CaptureConfig) -> Arc<Self> {
        let session = Arc::new(session);
        let host = Arc::new(Self {
            config,
            session: RwLock::new(session.clone()),
            inflight: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        });

        host.recover_orphans(&session).await;
        info!("Capture host attached to session '{}'", session.name());
        host
    }

    /// Currently active session
    pub fn session(&self) -> Arc<Session> {
        self.session.read().clone()
    }

    /// Request headers (and body) are complete. Resolves once the exchange
    /// may proceed.
    pub async fn on_headers(&self, exchange: Exchange) -> ExchangeVerdict {
        let session = self.session();
        let Exchange {
            flow_id,
            request,
            server,
        } = exchange;

        let record = index(&flow_id, &request, server.as_ref());
        metrics::counter!("flowgate_flows_captured_total").increment(1);

        if let Err(e) = session.store.create_flow(&record).await {
            return fail_open(&flow_id, request, "recording the flow", &e);
        }
        self.track(&flow_id, &session);

        let intercept = match session.store.intercept_mode().await {
            Ok(mode) => mode,
            Err(e) => return fail_open(&flow_id, request, "reading intercept mode", &e),
        };
        if !intercept {
            debug!(
                "Passing through {} {} {}{}",
                flow_id, record.method, record.host, record.path
            );
            return ExchangeVerdict::forward(request);
        }

        // Gate first: the flow must never be pending without a live gate
        let rx = session.gates.park(flow_id.clone(), request.clone());
        match session.store.mark_pending(&flow_id).await {
            Ok(true) => {}
            Ok(false) => {
                session.gates.cancel(&flow_id);
                return ExchangeVerdict::forward(request);
            }
            Err(e) => {
                session.gates.cancel(&flow_id);
                return fail_open(&flow_id, request, "marking the flow pending", &e);
            }
        }

        metrics::counter!("flowgate_flows_intercepted_total").increment(1);
        info!(
            "Intercepted {} {} {}{}",
            flow_id, record.method, record.host, record.path
        );

        if !Arc::ptr_eq(&session, &self.session()) {
            // Session switched while registering; its drain may have missed us
            let release = Resolution::Released { request: None };
            if let Err(e) = self.decide(&session, &flow_id, release, Some(SWITCH_NOTE)).await {
                warn!("Could not release {} after session switch: {}", flow_id, e);
                session.gates.resolve(&flow_id, GateDecision::Release { edited: None });
            }
        }

        let verdict = self.wait_for_decision(&session, &flow_id, &request, rx).await;
        if !verdict.is_forward() {
            self.inflight.remove(&flow_id);
        }
        verdict
    }

    /// Response received from the origin
    pub async fn on_complete(&self, flow_id: &FlowId, response: CapturedResponse) {
        let session = self.session_of(flow_id);
        let status = response.status;

        match session
            .store
            .record_response(flow_id, Some(status), response.raw)
            .await
        {
            Ok(true) => debug!("Recorded {} response for {}", status, flow_id),
            Ok(false) => debug!("No record for completed flow {}", flow_id),
            Err(e) => warn!("Failed to record response for {}: {}", flow_id, e),
        }
    }

    /// The exchange failed or the client went away
    pub async fn on_error(&self, flow_id: &FlowId, reason: &str) {
        let session = self.session_of(flow_id);
        let note = format!("exchange failed: {}", reason);

        let result = if session.gates.contains(flow_id) {
            let dropped = session
                .store
                .resolve_flow(flow_id, &Resolution::Dropped, Some(&note))
                .await;
            session.gates.cancel(flow_id);
            dropped
        } else {
            session.store.record_failure(flow_id, &note).await
        };

        match result {
            Ok(_) => info!("Flow {} failed: {}", flow_id, reason),
            Err(e) => warn!("Failed to record failure of {}: {}", flow_id, e),
        }
    }

    /// Apply the queued command of one pending flow. Reading the command,
    /// validating an edit and the terminal transition happen in one store
    /// transaction; the gate opens afterwards.
    pub async fn apply_command(&self, session: &Session, flow_id: &FlowId) -> Result<CommandApplied> {
        let applied = match session.store.apply_command(flow_id, resolve_command).await? {
            None => return Ok(CommandApplied::Skipped),
            Some(AppliedCommand::Rejected(reason)) => {
                warn!("Rejected edit for {}: {}", flow_id, reason);
                return Ok(CommandApplied::Rejected(reason));
            }
            Some(AppliedCommand::Resolved(resolution)) => resolution,
        };

        let outcome = match &applied {
            Resolution::Released { request } => CommandApplied::Released {
                edited: request.is_some(),
            },
            Resolution::Dropped => CommandApplied::Dropped,
        };
        self.open_gate(session, flow_id, applied);

        info!("Applied command to {}: {:?}", flow_id, outcome);
        Ok(outcome)
    }

    /// Release every pending flow of `session` unmodified, in arrival order
    pub async fn release_all(&self, session: &Session, note: Option<&str>) -> Result<Vec<FlowId>> {
        let released = session.store.release_all_pending(note).await?;
        for flow_id in &released {
            metrics::counter!("flowgate_flows_released_total").increment(1);
            if !session.gates.resolve(flow_id, GateDecision::Release { edited: None }) {
                debug!("No live gate for released flow {}", flow_id);
            }
        }
        Ok(released)
    }

    /// Open every gate of `session` with the original bytes, without the
    /// store. The records stay pending until [`CaptureHost::settle_fail_open`]
    /// runs; the released ids are returned in park order for that purpose.
    pub fn fail_open_release(&self, session: &Session) -> Vec<FlowId> {
        let drained = session.gates.drain();
        let mut released = Vec::with_capacity(drained.len());
        for (flow_id, parked) in drained {
            warn!("Fail-open release of {} (store unreachable)", flow_id);
            metrics::counter!("flowgate_flows_fail_open_total").increment(1);
            parked.open(GateDecision::Release { edited: None });
            released.push(flow_id);
        }
        released
    }

    /// Record flows released fail-open as released unmodified. A command
    /// queued for them meanwhile is retired unapplied: the origin already
    /// received the original bytes.
    pub async fn settle_fail_open(&self, session: &Session, released: &[FlowId], note: &str) -> Result<usize> {
        let release = Resolution::Released { request: None };
        let mut settled = 0;
        for flow_id in released {
            if session.store.resolve_flow(flow_id, &release, Some(note)).await? {
                metrics::counter!("flowgate_flows_released_total").increment(1);
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Release pending flows of `session` that have no live gate. Returns how
    /// many were released.
    pub async fn release_orphans(&self, session: &Session, note: &str) -> Result<usize> {
        let release = Resolution::Released { request: None };
        let mut released = 0;
        for flow in session.store.list_pending().await? {
            if session.gates.contains(&flow.flow_id) {
                continue;
            }
            if session
                .store
                .resolve_flow(&flow.flow_id, &release, Some(note))
                .await?
            {
                metrics::counter!("flowgate_flows_released_total").increment(1);
                released += 1;
            }
        }
        Ok(released)
    }

    /// Like [`CaptureHost::release_orphans`] for a session being attached; logs instead of failing
    pub async fn recover_orphans(&self, session: &Session) -> usize {
        match self.release_orphans(session, ORPHAN_NOTE).await {
            Ok(0) => 0,
            Ok(n) => {
                info!("Released {} orphaned pending flows in '{}'", n, session.name());
                n
            }
            Err(e) => {
                warn!("Could not recover orphaned flows in '{}': {}", session.name(), e);
                0
            }
        }
    }

    /// Make `next` the active session, then release everything still
    /// blocked in the previous one. Returns the number of released exchanges.
    pub async fn switch_session(&self, next: Session) -> usize {
        let next = Arc::new(next);
        self.recover_orphans(&next).await;

        let previous = std::mem::replace(&mut *self.session.write(), next.clone());
        info!(
            "Switched capture session '{}' -> '{}'",
            previous.name(),
            next.name()
        );

        self.sweep_inflight();
        self.drain(&previous, SWITCH_NOTE).await
    }

    /// Release everything blocked in the active session
    pub async fn shutdown(&self) -> usize {
        let session = self.session();
        let released = self.drain(&session, SHUTDOWN_NOTE).await;
        info!(
            "Capture host for '{}' shut down ({} blocked exchanges released)",
            session.name(),
            released
        );
        released
    }

    async fn drain(&self, session: &Session, note: &str) -> usize {
        let released = match self.release_all(session, Some(note)).await {
            Ok(ids) => ids.len(),
            Err(e) => {
                warn!("Could not release pending flows of '{}': {}", session.name(), e);
                0
            }
        };
        // Whatever is still gated has no pending record we could reach
        released + self.fail_open_release(session).len()
    }

    /// Persist a terminal transition, then open the gate. Returns false when
    /// the flow had already been decided.
    async fn decide(
        &self,
        session: &Session,
        flow_id: &FlowId,
        resolution: Resolution,
        note: Option<&str>,
    ) -> Result<bool> {
        if !session.store.resolve_flow(flow_id, &resolution, note).await? {
            debug!("Flow {} was already decided", flow_id);
            return Ok(false);
        }
        self.open_gate(session, flow_id, resolution);
        Ok(true)
    }

    fn open_gate(&self, session: &Session, flow_id: &FlowId, resolution: Resolution) {
        let decision = match resolution {
            Resolution::Released { request } => {
                metrics::counter!("flowgate_flows_released_total").increment(1);
                GateDecision::Release { edited: request }
            }
            Resolution::Dropped => {
                metrics::counter!("flowgate_flows_dropped_total").increment(1);
                GateDecision::Drop {
                    response: self.drop_response(),
                }
            }
        };

        if !session.gates.resolve(flow_id, decision) {
            debug!("No live gate for decided flow {}", flow_id);
        }
    }

    async fn wait_for_decision(
        &self,
        session: &Session,
        flow_id: &FlowId,
        original: &Bytes,
        mut rx: oneshot::Receiver<ExchangeVerdict>,
    ) -> ExchangeVerdict {
        let received = match self.config.max_hold() {
            None => (&mut rx).await,
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(received) => received,
                Err(_) => return self.release_at_ceiling(session, flow_id, original, rx).await,
            },
        };

        match received {
            Ok(verdict) => verdict,
            // Gate discarded without a verdict; the record tells what happened
            Err(_) => self.verdict_from_store(session, flow_id, original).await,
        }
    }

    async fn release_at_ceiling(
        &self,
        session: &Session,
        flow_id: &FlowId,
        original: &Bytes,
        rx: oneshot::Receiver<ExchangeVerdict>,
    ) -> ExchangeVerdict {
        if session.gates.take(flow_id).is_none() {
            // Opened by someone else right at the ceiling
            return match rx.await {
                Ok(verdict) => verdict,
                Err(_) => self.verdict_from_store(session, flow_id, original).await,
            };
        }

        let release = Resolution::Released { request: None };
        match session
            .store
            .resolve_flow(flow_id, &release, Some(HOLD_CEILING_NOTE))
            .await
        {
            Ok(true) => {
                info!("Released {} unmodified after the hold ceiling", flow_id);
                metrics::counter!("flowgate_flows_released_total").increment(1);
                ExchangeVerdict::forward(original.clone())
            }
            Ok(false) => self.verdict_from_store(session, flow_id, original).await,
            Err(e) => fail_open(flow_id, original.clone(), "releasing at the hold ceiling", &e),
        }
    }

    async fn verdict_from_store(
        &self,
        session: &Session,
        flow_id: &FlowId,
        original: &Bytes,
    ) -> ExchangeVerdict {
        match session.store.get_flow(flow_id).await {
            Ok(Some(record)) => match record.state {
                FlowState::Dropped => ExchangeVerdict::Respond(self.drop_response()),
                FlowState::Released => ExchangeVerdict::Forward {
                    request: record.request,
                    edited: record.edited,
                },
                state => {
                    warn!("Gate of {} closed while the flow is {}; releasing", flow_id, state);
                    ExchangeVerdict::forward(original.clone())
                }
            },
            Ok(None) => ExchangeVerdict::forward(original.clone()),
            Err(e) => fail_open(flow_id, original.clone(), "reading the decision", &e),
        }
    }

    fn track(&self, flow_id: &FlowId, session: &Arc<Session>) {
        self.inflight.insert(
            flow_id.clone(),
            Inflight {
                session: session.clone(),
                since: Instant::now(),
            },
        );

        if self.inflight.len() > INFLIGHT_SWEEP_THRESHOLD {
            let due = {
                let mut last = self.last_sweep.lock();
                let due = last.elapsed() >= INFLIGHT_SWEEP_INTERVAL;
                if due {
                    *last = Instant::now();
                }
                due
            };
            if due {
                self.sweep_inflight();
            }
        }
    }

    /// Forget exchanges that never reported completion within the TTL.
    /// Returns how many were dropped.
    fn sweep_inflight(&self) -> usize {
        let ttl = self.config.inflight_ttl();
        let before = self.inflight.len();
        self.inflight.retain(|_, entry| entry.since.elapsed() < ttl);
        let swept = before.saturating_sub(self.inflight.len());
        if swept > 0 {
            debug!("Forgot {} exchanges without a completion report", swept);
        }
        swept
    }

    fn session_of(&self, flow_id: &FlowId) -> Arc<Session> {
        self.inflight
            .remove(flow_id)
            .map(|(_, entry)| entry.session)
            .unwrap_or_else(|| self.session())
    }

    fn drop_response(&self) -> Bytes {
        framing::synthesize_failure(self.config.drop_status, DROP_MESSAGE)
    }
}

/// Turn a queued command into a terminal transition for `record`
fn resolve_command(record: &FlowRecord, command: PendingCommand) -> Result<Resolution> {
    match command {
        PendingCommand::Drop => Ok(Resolution::Dropped),
        PendingCommand::Forward { edited: None } => Ok(Resolution::Released { request: None }),
        PendingCommand::Forward { edited: Some(bytes) } => {
            let request = framing::revalidate(&bytes, &record.host, record.port)?;
            if request == record.request {
                Ok(Resolution::Released { request: None })
            } else {
                Ok(Resolution::Released {
                    request: Some(request),
                })
            }
        }
    }
}

fn fail_open(flow_id: &FlowId, request: Bytes, during: &str, err: &EngineError) -> ExchangeVerdict {
    warn!(
        "Store unavailable while {} for {}; passing through: {}",
        during, flow_id, err
    );
    metrics::counter!("flowgate_flows_fail_open_total").increment(1);
    ExchangeVerdict::forward(request)
}

fn index(flow_id: &FlowId, request: &Bytes, server: Option<&ServerAddr>) -> FlowRecord {
    let fallback_host = || server.map(|s| s.host.clone()).unwrap_or_default();
    let fallback_port = server.map(|s| s.port);

    let (method, host, port, path) = match framing::parse_head(request) {
        Ok(head) => {
            let host = head.host.unwrap_or_else(fallback_host);
            (head.method, host, head.port.or(fallback_port), head.path)
        }
        Err(e) => {
            debug!("Could not index {}: {}", flow_id, e);
            ("UNKNOWN".to_string(), fallback_host(), fallback_port, String::new())
        }
    };

    FlowRecord::captured(flow_id.clone(), method, host, port, path, request.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FlowStore;
    use rusqlite::Connection;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    async fn host_with(config: CaptureConfig) -> (TempDir, Arc<CaptureHost>) {
        let dir = tempdir().unwrap();
        let store = FlowStore::open_path(dir.path().join("flows.db"), Duration::from_millis(50))
            .await
            .unwrap();
        let host = CaptureHost::attach(Session::new("test", store), config).await;
        (dir, host)
    }

    fn get(path: &str) -> Exchange {
        Exchange::new(format!("GET {} HTTP/1.1\r\nHost: example.com\r\n\r\n", path))
    }

    #[tokio::test]
    async fn test_passthrough_is_recorded_and_completed() {
        let (_dir, host) = host_with(CaptureConfig::default()).await;
        let exchange = get("/a");
        let flow_id = exchange.flow_id.clone();

        let verdict = host.on_headers(exchange).await;
        assert!(verdict.is_forward());

        host.on_complete(&flow_id, CapturedResponse::new(200, "HTTP/1.1 200 OK\r\n\r\n"))
            .await;

        let record = host.session().store.get_flow(&flow_id).await.unwrap().unwrap();
        assert_eq!(record.state, FlowState::Complete);
        assert_eq!(record.status, Some(200));
        assert_eq!(record.host, "example.com");
        assert_eq!(record.path, "/a");
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unparseable_request_is_still_recorded() {
        let (_dir, host) = host_with(CaptureConfig::default()).await;
        let exchange = Exchange::new(&b"\x16\x03\x01garbage"[..]).with_server("tls.test", 443);
        let flow_id = exchange.flow_id.clone();

        assert!(host.on_headers(exchange).await.is_forward());

        let record = host.session().store.get_flow(&flow_id).await.unwrap().unwrap();
        assert_eq!(record.method, "UNKNOWN");
        assert_eq!(record.host, "tls.test");
        assert_eq!(record.port, Some(443));
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (dir, host) = host_with(CaptureConfig::default()).await;
        host.session().store.set_intercept_mode(true).await.unwrap();

        let locker = Connection::open(dir.path().join("flows.db")).unwrap();
        locker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let exchange = get("/locked");
        let original = exchange.request.clone();
        let verdict = tokio::time::timeout(Duration::from_secs(5), host.on_headers(exchange))
            .await
            .expect("exchange must not block while the store is unreachable");
        assert_eq!(verdict, ExchangeVerdict::forward(original));

        locker.execute_batch("ROLLBACK;").unwrap();
        assert!(host.session().gates.is_empty());
    }

    #[tokio::test]
    async fn test_hold_ceiling_releases_unmodified() {
        let (_dir, host) = host_with(CaptureConfig {
            max_hold_secs: Some(1),
            ..Default::default()
        })
        .await;
        host.session().store.set_intercept_mode(true).await.unwrap();

        let exchange = get("/slow");
        let flow_id = exchange.flow_id.clone();
        let original = exchange.request.clone();

        let verdict = host.on_headers(exchange).await;
        assert_eq!(verdict, ExchangeVerdict::forward(original));

        let record = host.session().store.get_flow(&flow_id).await.unwrap().unwrap();
        assert_eq!(record.state, FlowState::Released);
        assert_eq!(record.note.as_deref(), Some(HOLD_CEILING_NOTE));
    }

    #[tokio::test]
    async fn test_on_error_withdraws_blocked_flow() {
        let (_dir, host) = host_with(CaptureConfig::default()).await;
        let session = host.session();
        session.store.set_intercept_mode(true).await.unwrap();

        let exchange = get("/gone");
        let flow_id = exchange.flow_id.clone();
        let waiting = tokio::spawn({
            let host = host.clone();
            async move { host.on_headers(exchange).await }
        });

        while !session.gates.contains(&flow_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Wait for the record to turn pending
        while session.store.list_pending().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        host.on_error(&flow_id, "client disconnected").await;

        let verdict = waiting.await.unwrap();
        assert!(matches!(verdict, ExchangeVerdict::Respond(_)));

        let record = session.store.get_flow(&flow_id).await.unwrap().unwrap();
        assert_eq!(record.state, FlowState::Dropped);
        assert_eq!(record.note.as_deref(), Some("exchange failed: client disconnected"));
        assert!(session.store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_on_error_closes_passthrough_flow() {
        let (_dir, host) = host_with(CaptureConfig::default()).await;
        let exchange = get("/reset");
        let flow_id = exchange.flow_id.clone();

        assert!(host.on_headers(exchange).await.is_forward());
        host.on_error(&flow_id, "connection reset by peer").await;

        let record = host.session().store.get_flow(&flow_id).await.unwrap().unwrap();
        assert_eq!(record.state, FlowState::Complete);
        assert_eq!(record.note.as_deref(), Some("exchange failed: connection reset by peer"));
        assert!(record.completed_at.is_some());
        assert!(host.inflight.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_locked_store_does_not_queue_exchanges() {
        let dir = tempdir().unwrap();
        let busy = Duration::from_millis(300);
        let store = FlowStore::open_path(dir.path().join("flows.db"), busy).await.unwrap();
        let host = CaptureHost::attach(Session::new("test", store), CaptureConfig::default()).await;

        let locker = Connection::open(dir.path().join("flows.db")).unwrap();
        locker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let started = std::time::Instant::now();
        let exchanges: Vec<_> = (0..6)
            .map(|i| {
                let host = host.clone();
                tokio::spawn(async move { host.on_headers(get(&format!("/{}", i))).await })
            })
            .collect();
        for exchange in exchanges {
            assert!(exchange.await.unwrap().is_forward());
        }

        // Each exchange waits out its own busy timeout, side by side
        assert!(started.elapsed() < busy * 3, "took {:?}", started.elapsed());
        locker.execute_batch("ROLLBACK;").unwrap();
    }

    #[tokio::test]
    async fn test_unreported_exchanges_are_forgotten() {
        let (_dir, host) = host_with(CaptureConfig {
            inflight_ttl_secs: 1,
            ..Default::default()
        })
        .await;

        let exchange = get("/silent");
        let flow_id = exchange.flow_id.clone();
        assert!(host.on_headers(exchange).await.is_forward());
        assert_eq!(host.inflight.len(), 1);

        assert_eq!(host.sweep_inflight(), 0);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(host.sweep_inflight(), 1);
        assert!(host.inflight.is_empty());

        // A late report still lands in the active session
        host.on_complete(&flow_id, CapturedResponse::status_only(204)).await;
        let record = host.session().store.get_flow(&flow_id).await.unwrap().unwrap();
        assert_eq!(record.state, FlowState::Complete);
    }

    #[tokio::test]
    async fn test_apply_command_rejects_bad_edit_and_keeps_gate() {
        let (_dir, host) = host_with(CaptureConfig::default()).await;
        let session = host.session();
        session.store.set_intercept_mode(true).await.unwrap();

        let exchange = get("/edit");
        let flow_id = exchange.flow_id.clone();
        let waiting = tokio::spawn({
            let host = host.clone();
            async move { host.on_headers(exchange).await }
        });
        while session.store.list_pending().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let bad = Bytes::from_static(b"GET /x HTTP/1.1\r\nHost: other.test\r\n\r\n");
        session
            .store
            .issue_command(&flow_id, &PendingCommand::Forward { edited: Some(bad) })
            .await
            .unwrap();
        let applied = host.apply_command(&session, &flow_id).await.unwrap();
        assert!(matches!(applied, CommandApplied::Rejected(_)));
        assert!(session.gates.contains(&flow_id));

        session
            .store
            .issue_command(&flow_id, &PendingCommand::forward())
            .await
            .unwrap();
        assert_eq!(
            host.apply_command(&session, &flow_id).await.unwrap(),
            CommandApplied::Released { edited: false }
        );
        assert!(waiting.await.unwrap().is_forward());
    }

    #[tokio::test]
    async fn test_attach_releases_orphans() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.db");
        let store = FlowStore::open_path(&path, Duration::from_millis(50)).await.unwrap();

        let record = index(&FlowId::from("orphan"), &get("/o").request, None);
        store.create_flow(&record).await.unwrap();
        store.mark_pending(&record.flow_id).await.unwrap();

        let host = CaptureHost::attach(Session::new("restart", store), CaptureConfig::default()).await;
        let record = host
            .session()
            .store
            .get_flow(&FlowId::from("orphan"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, FlowState::Released);
        assert_eq!(record.note.as_deref(), Some(ORPHAN_NOTE));
    }

    #[test]
    fn test_index_prefers_request_head() {
        let exchange = Exchange::new("POST http://api.test:8080/v1 HTTP/1.1\r\nHost: api.test:8080\r\n\r\n")
            .with_server("10.0.0.1", 8080);
        let record = index(&exchange.flow_id, &exchange.request, exchange.server.as_ref());
        assert_eq!(record.method, "POST");
        assert_eq!(record.host, "api.test");
        assert_eq!(record.port, Some(8080));
        assert_eq!(record.path, "/v1");
        assert_eq!(record.state, FlowState::Captured);
    }
}
