// src/store/models.rs
//! Flow records, states and commands persisted in the flow store

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Globally unique identifier of one exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    /// Generate a fresh, time-ordered id
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FlowId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for FlowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a flow record
///
/// ```text
/// Captured ──► PendingIntercept ──► Released | Dropped
///    └──────► Complete (pass-through, response recorded)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Captured,
    PendingIntercept,
    Released,
    Dropped,
    Complete,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Captured => "captured",
            FlowState::PendingIntercept => "pending_intercept",
            FlowState::Released => "released",
            FlowState::Dropped => "dropped",
            FlowState::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "captured" => Some(FlowState::Captured),
            "pending_intercept" => Some(FlowState::PendingIntercept),
            "released" => Some(FlowState::Released),
            "dropped" => Some(FlowState::Dropped),
            "complete" => Some(FlowState::Complete),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Released | FlowState::Dropped | FlowState::Complete
        )
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: FlowId,

    /// Arrival order assigned by the store (0 until inserted)
    pub seq: i64,

    pub method: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,

    /// Raw request bytes; replaced by the edited bytes when forwarded with edits
    #[serde(with = "lossy_bytes")]
    pub request: Bytes,

    #[serde(with = "lossy_bytes_opt")]
    pub response: Option<Bytes>,

    pub status: Option<u16>,
    pub state: FlowState,

    /// Whether the forwarded request differs from what was captured
    pub edited: bool,

    /// Last rejection or failure reported for this flow
    pub note: Option<String>,

    pub captured_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FlowRecord {
    /// New record in the `Captured` state
    pub fn captured(
        flow_id: FlowId,
        method: impl Into<String>,
        host: impl Into<String>,
        port: Option<u16>,
        path: impl Into<String>,
        request: Bytes,
    ) -> Self {
        Self {
            flow_id,
            seq: 0,
            method: method.into(),
            host: host.into(),
            port,
            path: path.into(),
            request,
            response: None,
            status: None,
            state: FlowState::Captured,
            edited: false,
            note: None,
            captured_at: Utc::now(),
            decided_at: None,
            completed_at: None,
        }
    }
}

/// Partial update applied by `FlowStore::update_flow`
#[derive(Debug, Clone, Default)]
pub struct FlowUpdate {
    pub request: Option<Bytes>,
    pub response: Option<Bytes>,
    pub status: Option<u16>,
    pub note: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Entry of the pending flow set, ordered by arrival
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFlow {
    pub flow_id: FlowId,
    pub seq: i64,
    pub method: String,
    pub host: String,
    pub path: String,
    pub captured_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Decision queued by the control plane for one pending flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCommand {
    /// Let the exchange reach its origin, optionally with substituted bytes
    Forward { edited: Option<Bytes> },

    /// Answer the client with a synthesized failure without contacting the origin
    Drop,
}

impl PendingCommand {
    pub fn forward() -> Self {
        PendingCommand::Forward { edited: None }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PendingCommand::Forward { .. } => "forward",
            PendingCommand::Drop => "drop",
        }
    }

    pub(crate) fn from_row(kind: &str, edited: Option<Vec<u8>>) -> Option<Self> {
        match kind {
            "forward" => Some(PendingCommand::Forward {
                edited: edited.map(Bytes::from),
            }),
            "drop" => Some(PendingCommand::Drop),
            _ => None,
        }
    }
}

/// Result of queuing a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Command stored; the poller applies it on its next tick
    Queued,

    /// An unconsumed command already exists for the flow; nothing changed
    AlreadyQueued,

    /// The flow already reached a terminal state; nothing changed
    AlreadyTerminal,
}

/// Terminal transition applied to a pending flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Released to the origin; `request` replaces the stored bytes when edited
    Released { request: Option<Bytes> },

    Dropped,
}

impl Resolution {
    pub fn state(&self) -> FlowState {
        match self {
            Resolution::Released { .. } => FlowState::Released,
            Resolution::Dropped => FlowState::Dropped,
        }
    }
}

/// What applying a queued command did to its flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedCommand {
    /// The flow moved to its terminal state
    Resolved(Resolution),

    /// The edit failed validation; the flow is still pending and the command
    /// slot is free for a new decision
    Rejected(String),
}

pub(crate) fn to_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or_else(|| Utc.timestamp_nanos(0))
}

mod lossy_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        Ok(Bytes::from(String::deserialize(d)?))
    }
}

mod lossy_bytes_opt {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(b) => s.serialize_some(&String::from_utf8_lossy(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        Ok(Option::<String>::deserialize(d)?.map(Bytes::from))
    }
}
