// src/capture/exchange.rs
//! Values passed between the traffic engine and the capture host

use crate::store::FlowId;
use bytes::Bytes;

/// Request half of one client-server exchange, as handed over by the engine
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Engine-assigned id, unique for the lifetime of the store
    pub flow_id: FlowId,

    /// Raw request bytes (head and body) exactly as received from the client
    pub request: Bytes,

    /// Origin the engine connects to, when known independently of the
    /// request head (e.g. the SNI of a TLS-intercepted connection)
    pub server: Option<ServerAddr>,
}

impl Exchange {
    pub fn new(request: impl Into<Bytes>) -> Self {
        Self {
            flow_id: FlowId::generate(),
            request: request.into(),
            server: None,
        }
    }

    pub fn with_flow_id(mut self, flow_id: FlowId) -> Self {
        self.flow_id = flow_id;
        self
    }

    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server = Some(ServerAddr {
            host: host.into(),
            port,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

/// Response half of an exchange
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: u16,

    /// Raw response bytes when the engine kept them
    pub raw: Option<Bytes>,
}

impl CapturedResponse {
    pub fn new(status: u16, raw: impl Into<Bytes>) -> Self {
        Self {
            status,
            raw: Some(raw.into()),
        }
    }

    pub fn status_only(status: u16) -> Self {
        Self { status, raw: None }
    }
}

/// What the engine does with an exchange once the capture host lets go of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeVerdict {
    /// Send `request` to the origin
    Forward { request: Bytes, edited: bool },

    /// Answer the client with these bytes; the origin is never contacted
    Respond(Bytes),
}

impl ExchangeVerdict {
    pub fn forward(request: Bytes) -> Self {
        ExchangeVerdict::Forward {
            request,
            edited: false,
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, ExchangeVerdict::Forward { .. })
    }
}
