//! Engine configuration.
//!
//! Loaded from a JSON file and overlaid with `STIXGRAPH_*` environment
//! variables. Every section has defaults, so an empty file (or
//! [`EngineConfig::default`]) gives an embedded store with no mirror.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stixgraph_mirror::DEFAULT_COMMIT_EVERY;
use stixgraph_store::ArangoConfig;

use crate::error::{Error, Result};

// ============================================================================
// Sections
// ============================================================================

/// Where objects, edges and feed metadata are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrimaryStoreConfig {
    /// Embedded in-memory graph store.
    Memory,
    Arango {
        url: String,
        database: String,
        username: String,
        #[serde(default)]
        password: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    30
}

impl PrimaryStoreConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            PrimaryStoreConfig::Memory => "memory",
            PrimaryStoreConfig::Arango { .. } => "arango",
        }
    }
}

impl Default for PrimaryStoreConfig {
    fn default() -> Self {
        PrimaryStoreConfig::Memory
    }
}

/// Relational mirror used by field optimizers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// SQLite file; in-memory when absent.
    pub path: Option<PathBuf>,
    /// Rows per optimizer between commits.
    pub commit_every: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            path: None,
            commit_every: DEFAULT_COMMIT_EVERY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedDefaults {
    /// Days between insertion and vacuum when no vacuum date is given.
    pub retention_days: i64,
}

impl Default for FeedDefaults {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub max_depth: u32,
    /// Ask the store for persistent indexes over queried fields.
    pub create_index: bool,
    /// Result cap per feed.
    pub limit: Option<usize>,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            max_depth: 2,
            create_index: true,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub dump_tool: String,
    pub restore_tool: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dump_tool: "arangodump".to_string(),
            restore_tool: "arangorestore".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub primary: PrimaryStoreConfig,
    pub mirror: Option<MirrorConfig>,
    pub feed: FeedDefaults,
    pub request: RequestDefaults,
    pub snapshot: SnapshotConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let load = || -> anyhow::Result<Self> {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        };
        load().map_err(|e| Error::Config(format!("{e:#}")))
    }

    /// Overlays `STIXGRAPH_*` variables from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Overlays variables from `lookup`.
    ///
    /// Setting `STIXGRAPH_ARANGO_URL` switches an embedded configuration to
    /// ArangoDB; `STIXGRAPH_MIRROR_PATH` enables the mirror.
    pub fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(new_url) = lookup("STIXGRAPH_ARANGO_URL") {
            self.primary = match self.primary {
                PrimaryStoreConfig::Arango {
                    database,
                    username,
                    password,
                    timeout_secs,
                    ..
                } => PrimaryStoreConfig::Arango {
                    url: new_url,
                    database,
                    username,
                    password,
                    timeout_secs,
                },
                PrimaryStoreConfig::Memory => {
                    let defaults = ArangoConfig::default();
                    PrimaryStoreConfig::Arango {
                        url: new_url,
                        database: defaults.database,
                        username: defaults.username,
                        password: defaults.password,
                        timeout_secs: defaults.timeout_secs,
                    }
                }
            };
        }
        if let PrimaryStoreConfig::Arango {
            database,
            username,
            password,
            ..
        } = &mut self.primary
        {
            if let Some(value) = lookup("STIXGRAPH_ARANGO_DB") {
                *database = value;
            }
            if let Some(value) = lookup("STIXGRAPH_ARANGO_USER") {
                *username = value;
            }
            if let Some(value) = lookup("STIXGRAPH_ARANGO_PASSWORD") {
                *password = value;
            }
        }
        if let Some(path) = lookup("STIXGRAPH_MIRROR_PATH") {
            let mirror = self.mirror.get_or_insert_with(MirrorConfig::default);
            mirror.path = Some(PathBuf::from(path));
        }
        if let Some(filter) = lookup("STIXGRAPH_LOG") {
            self.logging.filter = filter;
        }
        self
    }

    /// Store settings for the ArangoDB backend, if configured.
    pub fn arango(&self) -> Option<ArangoConfig> {
        match &self.primary {
            PrimaryStoreConfig::Memory => None,
            PrimaryStoreConfig::Arango {
                url,
                database,
                username,
                password,
                timeout_secs,
            } => Some(ArangoConfig {
                url: url.clone(),
                database: database.clone(),
                username: username.clone(),
                password: password.clone(),
                timeout_secs: *timeout_secs,
                dump_tool: self.snapshot.dump_tool.clone(),
                restore_tool: self.snapshot.restore_tool.clone(),
            }),
        }
    }
}
