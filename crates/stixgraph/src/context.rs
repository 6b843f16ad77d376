//! The handles every engine component works through.

use std::sync::Arc;
use stixgraph_mirror::MirrorConnection;
use stixgraph_pattern::ModifierRegistry;
use stixgraph_store::{ArangoStore, DocumentStore, MemoryStore};

use crate::config::{EngineConfig, PrimaryStoreConfig};
use crate::error::{Error, Result};
use crate::modifiers::standard_modifiers;

/// Primary store, optional mirror, modifiers and configuration.
///
/// Passed explicitly to feeds, requests and maintenance operations. Cloning
/// shares the underlying connections.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn DocumentStore>,
    pub mirror: Option<MirrorConnection>,
    pub modifiers: ModifierRegistry,
    pub config: EngineConfig,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("primary", &self.config.primary.kind())
            .field("mirror", &self.mirror.is_some())
            .field("modifiers", &self.modifiers)
            .finish()
    }
}

impl EngineContext {
    /// Connects the stores named by `config`.
    ///
    /// With an Arango primary store, call this and drop the last clone of
    /// the context off the async runtime's worker threads; see
    /// [`ArangoStore`].
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = match (&config.primary, config.arango()) {
            (PrimaryStoreConfig::Arango { .. }, Some(arango)) => {
                Arc::new(ArangoStore::connect(arango)?)
            }
            _ => Arc::new(MemoryStore::new()),
        };

        let mirror = match &config.mirror {
            None => None,
            Some(mirror) => {
                let conn = match &mirror.path {
                    Some(path) => MirrorConnection::open(path)?,
                    None => MirrorConnection::open_in_memory()?,
                };
                Some(conn.with_commit_every(mirror.commit_every))
            }
        };

        tracing::info!(
            primary = config.primary.kind(),
            mirror = mirror.is_some(),
            "opened engine context"
        );
        Ok(Self::from_parts(store, mirror, config))
    }

    pub fn from_parts(
        store: Arc<dyn DocumentStore>,
        mirror: Option<MirrorConnection>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            mirror,
            modifiers: standard_modifiers(),
            config,
        }
    }

    /// Embedded store with an in-memory mirror.
    pub fn in_memory() -> Result<Self> {
        let mut config = EngineConfig::default();
        config.mirror = Some(Default::default());
        Self::open(config)
    }

    pub fn with_modifiers(mut self, modifiers: ModifierRegistry) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn mirror(&self) -> Result<&MirrorConnection> {
        self.mirror.as_ref().ok_or(Error::MirrorNotConfigured)
    }
}
