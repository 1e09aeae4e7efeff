// src/capture/session.rs
//! A capture session: one flow store plus the gates of exchanges blocked in it

use crate::capture::gate::GateRegistry;
use crate::store::FlowStore;
use crate::utils::config::StoreConfig;
use crate::utils::errors::Result;

pub struct Session {
    name: String,
    pub store: FlowStore,
    pub gates: GateRegistry,
}

impl Session {
    pub fn new(name: impl Into<String>, store: FlowStore) -> Self {
        Self {
            name: name.into(),
            store,
            gates: GateRegistry::new(),
        }
    }

    /// Open the store described by `config`; the session is named after its file
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let store = FlowStore::open(config).await?;
        let name = config
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string());
        Ok(Self::new(name, store))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("store", &self.store.path())
            .field("blocked", &self.gates.len())
            .finish()
    }
}
