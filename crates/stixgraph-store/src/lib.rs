//! Stixgraph primary stores
//!
//! Objects and the edges between them live in a document/graph store:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     DocumentStore (trait)                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  collections ── documents (`_id` = "<collection>/<key>")     │
//! │  edge collections ── `_from` / `_to` / `label`               │
//! │  query(Filter) ── traverse(start, edges, policy)             │
//! │  persistent indexes ── export / import                       │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │                              │
//!        ┌────────▼────────┐            ┌────────▼────────┐
//!        │   MemoryStore   │            │   ArangoStore   │
//!        │  (embedded)     │            │  (HTTP + AQL)   │
//!        └─────────────────┘            └─────────────────┘
//! ```
//!
//! Fields whose name starts with `_` belong to the store and are never
//! part of an object.

pub mod arango;
pub mod memory;

pub use arango::{ArangoConfig, ArangoStore};
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use stixgraph_pattern::Filter;
use thiserror::Error;

// ============================================================================
// Core Types
// ============================================================================

/// A stored JSON document.
pub type Document = Map<String, Value>;

/// Prefix of store-owned fields.
pub const INTERNAL_PREFIX: char = '_';

/// Object type whose records may be traversed through at the second hop.
pub const RELATIONSHIP_TYPE: &str = "relationship";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Document,
    Edge,
}

/// Reference to a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentHandle {
    pub id: String,
}

impl DocumentHandle {
    pub fn new(collection: &str, key: &str) -> Self {
        Self {
            id: format!("{collection}/{key}"),
        }
    }

    pub fn collection(&self) -> &str {
        split_id(&self.id).map(|(c, _)| c).unwrap_or_default()
    }

    pub fn key(&self) -> &str {
        split_id(&self.id).map(|(_, k)| k).unwrap_or_default()
    }
}

/// Splits `"<collection>/<key>"`.
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('/')
        .filter(|(c, k)| !c.is_empty() && !k.is_empty())
}

/// A directed edge between two stored documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub label: String,
}

/// Bounded traversal: up to two hops in either direction, where the second
/// hop only continues through relationship records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalPolicy {
    max_depth: u32,
}

impl TraversalPolicy {
    pub const MAX_DEPTH: u32 = 2;

    /// Depths above [`Self::MAX_DEPTH`] are clamped.
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth: max_depth.min(Self::MAX_DEPTH),
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Whether a vertex reached at `depth` may be expanded further.
    pub fn expands(&self, depth: u32, vertex: &Document) -> bool {
        if depth >= self.max_depth {
            return false;
        }
        depth == 0 || vertex.get("type").and_then(Value::as_str) == Some(RELATIONSHIP_TYPE)
    }
}

/// Removes every store-owned field.
pub fn strip_internal(mut doc: Document) -> Document {
    doc.retain(|key, _| !key.starts_with(INTERNAL_PREFIX));
    doc
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection `{0}` does not exist")]
    CollectionNotFound(String),

    #[error("document `{0}` does not exist")]
    DocumentNotFound(String),

    #[error("invalid document id `{0}`")]
    InvalidDocumentId(String),

    #[error("collection `{name}` is not a {expected:?} collection")]
    WrongCollectionKind {
        name: String,
        expected: CollectionKind,
    },

    #[error("store request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("`{0}` is not installed or not on PATH")]
    ToolingMissing(String),

    #[error("`{tool}` failed: {reason}")]
    ToolingFailed { tool: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Store trait
// ============================================================================

/// A document/graph store holding feed collections.
///
/// Implementations are synchronous; callers on an async runtime run them on
/// blocking threads.
pub trait DocumentStore: Send + Sync {
    /// Names of all collections.
    fn collections(&self) -> Result<Vec<String>>;

    fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self.collections()?.iter().any(|c| c == name))
    }

    /// Creates the collection if it does not exist.
    fn ensure_collection(&self, name: &str, kind: CollectionKind) -> Result<()>;

    /// Drops a collection; `Ok(false)` if it was already absent.
    fn drop_collection(&self, name: &str) -> Result<bool>;

    fn insert(&self, collection: &str, doc: Document) -> Result<DocumentHandle>;

    /// Replaces the body of an existing document, keeping its handle.
    fn replace(&self, handle: &DocumentHandle, doc: Document) -> Result<()>;

    /// Removes a document; `Ok(false)` if it was already absent.
    fn remove(&self, handle: &DocumentHandle) -> Result<bool>;

    /// Fetches a document by `_id`.
    fn get(&self, id: &str) -> Result<Option<Document>>;

    fn all(&self, collection: &str) -> Result<Vec<Document>>;

    fn count(&self, collection: &str) -> Result<usize>;

    /// Documents of `collection` matching `filter`.
    fn query(&self, collection: &str, filter: &Filter, limit: Option<usize>)
        -> Result<Vec<Document>>;

    fn insert_edge(&self, collection: &str, edge: &Edge) -> Result<DocumentHandle>;

    /// The start vertex followed by every vertex the policy reaches over
    /// `edge_collection`, each once.
    fn traverse(
        &self,
        start: &str,
        edge_collection: &str,
        policy: TraversalPolicy,
    ) -> Result<Vec<Document>>;

    /// Requests a persistent index over `fields`; idempotent.
    fn ensure_persistent_index(&self, collection: &str, fields: &[String]) -> Result<()>;

    /// Writes the named collections to `dir`.
    fn export(&self, dir: &Path, collections: &[String]) -> Result<()>;

    /// Loads everything a previous [`DocumentStore::export`] wrote to `dir`.
    fn import(&self, dir: &Path) -> Result<()>;
}
