//! Embedded in-memory graph store.
//!
//! Collections keep their documents ordered by key. Edge collections also
//! keep an undirected adjacency map so traversals do not scan edges.
//! Snapshots are one JSON file per collection plus `manifest.json`.

use crate::{
    split_id, CollectionKind, Document, DocumentHandle, DocumentStore, Edge, Result, StoreError,
    TraversalPolicy,
};
use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use stixgraph_pattern::Filter;

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Collection {
    kind: CollectionKind,
    next_key: u64,
    documents: BTreeMap<u64, Document>,
    indexes: Vec<Vec<String>>,
    /// vertex `_id` -> (neighbor `_id`) for edge collections
    #[serde(skip)]
    adjacency: AHashMap<String, Vec<String>>,
}

impl Collection {
    fn new(kind: CollectionKind) -> Self {
        Self {
            kind,
            next_key: 1,
            documents: BTreeMap::new(),
            indexes: Vec::new(),
            adjacency: AHashMap::new(),
        }
    }

    fn link(&mut self, from: &str, to: &str) {
        self.adjacency
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
        if from != to {
            self.adjacency
                .entry(to.to_string())
                .or_default()
                .push(from.to_string());
        }
    }

    fn rebuild_adjacency(&mut self) {
        self.adjacency.clear();
        let pairs: Vec<(String, String)> = self
            .documents
            .values()
            .filter_map(|doc| {
                let from = doc.get("_from")?.as_str()?;
                let to = doc.get("_to")?.as_str()?;
                Some((from.to_string(), to.to_string()))
            })
            .collect();
        for (from, to) in pairs {
            self.link(&from, &to);
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: AHashMap<String, Collection>,
    revision: u64,
}

impl MemoryState {
    fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        format!("_r{}", self.revision)
    }

    fn lookup(&self, id: &str) -> Option<&Document> {
        let (collection, key) = split_id(id)?;
        let key: u64 = key.parse().ok()?;
        self.collections.get(collection)?.documents.get(&key)
    }

    fn insert(&mut self, name: &str, mut doc: Document) -> Result<DocumentHandle> {
        let rev = self.next_revision();
        let collection = self.collection_mut(name)?;
        let key = collection.next_key;
        collection.next_key += 1;

        let handle = DocumentHandle::new(name, &key.to_string());
        doc.insert("_key".to_string(), Value::String(key.to_string()));
        doc.insert("_id".to_string(), Value::String(handle.id.clone()));
        doc.insert("_rev".to_string(), Value::String(rev));
        collection.documents.insert(key, doc);
        Ok(handle)
    }
}

/// In-memory [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persistent indexes registered on a collection.
    pub fn indexes(&self, collection: &str) -> Vec<Vec<String>> {
        self.state
            .read()
            .collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }
}

fn parse_handle(handle: &DocumentHandle) -> Result<(&str, u64)> {
    let (collection, key) =
        split_id(&handle.id).ok_or_else(|| StoreError::InvalidDocumentId(handle.id.clone()))?;
    let key = key
        .parse()
        .map_err(|_| StoreError::InvalidDocumentId(handle.id.clone()))?;
    Ok((collection, key))
}

/// Writes `bytes` next to `path` and renames it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    collections: Vec<String>,
    revision: u64,
}

impl DocumentStore for MemoryStore {
    fn collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.state.read().collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self.state.read().collections.contains_key(name))
    }

    fn ensure_collection(&self, name: &str, kind: CollectionKind) -> Result<()> {
        let mut state = self.state.write();
        match state.collections.get(name) {
            Some(existing) if existing.kind != kind => Err(StoreError::WrongCollectionKind {
                name: name.to_string(),
                expected: kind,
            }),
            Some(_) => Ok(()),
            None => {
                tracing::debug!(collection = %name, ?kind, "creating collection");
                state.collections.insert(name.to_string(), Collection::new(kind));
                Ok(())
            }
        }
    }

    fn drop_collection(&self, name: &str) -> Result<bool> {
        Ok(self.state.write().collections.remove(name).is_some())
    }

    fn insert(&self, collection: &str, doc: Document) -> Result<DocumentHandle> {
        self.state.write().insert(collection, doc)
    }

    fn replace(&self, handle: &DocumentHandle, mut doc: Document) -> Result<()> {
        let (name, key) = parse_handle(handle)?;
        let mut state = self.state.write();
        let rev = state.next_revision();
        let collection = state.collection_mut(name)?;
        let slot = collection
            .documents
            .get_mut(&key)
            .ok_or_else(|| StoreError::DocumentNotFound(handle.id.clone()))?;
        doc.insert("_key".to_string(), Value::String(key.to_string()));
        doc.insert("_id".to_string(), Value::String(handle.id.clone()));
        doc.insert("_rev".to_string(), Value::String(rev));
        *slot = doc;
        Ok(())
    }

    fn remove(&self, handle: &DocumentHandle) -> Result<bool> {
        let (name, key) = parse_handle(handle)?;
        let mut state = self.state.write();
        let Some(collection) = state.collections.get_mut(name) else {
            return Ok(false);
        };
        let removed = collection.documents.remove(&key).is_some();
        if removed && collection.kind == CollectionKind::Edge {
            collection.rebuild_adjacency();
        }
        Ok(removed)
    }

    fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.state.read().lookup(id).cloned())
    }

    fn all(&self, collection: &str) -> Result<Vec<Document>> {
        let state = self.state.read();
        Ok(state.collection(collection)?.documents.values().cloned().collect())
    }

    fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.state.read().collection(collection)?.documents.len())
    }

    fn query(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let state = self.state.read();
        let limit = limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        for doc in state.collection(collection)?.documents.values() {
            if found.len() >= limit {
                break;
            }
            if filter.matches_map(doc) {
                found.push(doc.clone());
            }
        }
        Ok(found)
    }

    fn insert_edge(&self, collection: &str, edge: &Edge) -> Result<DocumentHandle> {
        let mut state = self.state.write();
        if state.collection(collection)?.kind != CollectionKind::Edge {
            return Err(StoreError::WrongCollectionKind {
                name: collection.to_string(),
                expected: CollectionKind::Edge,
            });
        }
        let mut doc = Document::new();
        doc.insert("_from".to_string(), Value::String(edge.from.clone()));
        doc.insert("_to".to_string(), Value::String(edge.to.clone()));
        doc.insert("label".to_string(), Value::String(edge.label.clone()));
        let handle = state.insert(collection, doc)?;
        state.collection_mut(collection)?.link(&edge.from, &edge.to);
        Ok(handle)
    }

    fn traverse(
        &self,
        start: &str,
        edge_collection: &str,
        policy: TraversalPolicy,
    ) -> Result<Vec<Document>> {
        let state = self.state.read();
        let Some(origin) = state.lookup(start) else {
            return Ok(Vec::new());
        };
        let empty = AHashMap::new();
        let adjacency = state
            .collections
            .get(edge_collection)
            .map(|c| &c.adjacency)
            .unwrap_or(&empty);

        let mut visited: AHashSet<&str> = AHashSet::new();
        visited.insert(start);
        let mut reached = vec![origin.clone()];
        let mut queue: VecDeque<(&str, &Document, u32)> = VecDeque::new();
        queue.push_back((start, origin, 0));

        while let Some((id, vertex, depth)) = queue.pop_front() {
            if !policy.expands(depth, vertex) {
                continue;
            }
            for neighbor in adjacency.get(id).into_iter().flatten() {
                if !visited.insert(neighbor.as_str()) {
                    continue;
                }
                if let Some(doc) = state.lookup(neighbor) {
                    reached.push(doc.clone());
                    queue.push_back((neighbor.as_str(), doc, depth + 1));
                }
            }
        }
        Ok(reached)
    }

    fn ensure_persistent_index(&self, collection: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        let collection = state.collection_mut(collection)?;
        if !collection.indexes.iter().any(|f| f.as_slice() == fields) {
            collection.indexes.push(fields.to_vec());
        }
        Ok(())
    }

    fn export(&self, dir: &Path, collections: &[String]) -> Result<()> {
        fs::create_dir_all(dir)?;
        let state = self.state.read();
        let mut written = Vec::new();
        for name in collections {
            let Some(collection) = state.collections.get(name) else {
                tracing::warn!(collection = %name, "skipping missing collection in export");
                continue;
            };
            let bytes = serde_json::to_vec(collection)?;
            write_atomic(&dir.join(format!("{name}.json")), &bytes)?;
            written.push(name.clone());
        }
        let manifest = Manifest {
            collections: written,
            revision: state.revision,
        };
        write_atomic(&dir.join(MANIFEST), &serde_json::to_vec_pretty(&manifest)?)?;
        tracing::info!(dir = %dir.display(), collections = manifest.collections.len(), "exported collections");
        Ok(())
    }

    fn import(&self, dir: &Path) -> Result<()> {
        let manifest: Manifest = serde_json::from_slice(&fs::read(dir.join(MANIFEST))?)?;
        let mut loaded = Vec::with_capacity(manifest.collections.len());
        for name in &manifest.collections {
            let bytes = fs::read(dir.join(format!("{name}.json")))?;
            let mut collection: Collection = serde_json::from_slice(&bytes)?;
            collection.rebuild_adjacency();
            loaded.push((name.clone(), collection));
        }

        let mut state = self.state.write();
        state.revision = state.revision.max(manifest.revision);
        for (name, collection) in loaded {
            state.collections.insert(name, collection);
        }
        tracing::info!(dir = %dir.display(), collections = manifest.collections.len(), "imported collections");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stixgraph_pattern::{CompareOp, Literal};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_assigns_internal_fields() {
        let store = MemoryStore::new();
        store.ensure_collection("c", CollectionKind::Document).unwrap();
        let handle = store.insert("c", doc(json!({"type": "t"}))).unwrap();
        assert_eq!(handle.id, "c/1");

        let stored = store.get("c/1").unwrap().unwrap();
        assert_eq!(stored["_key"], json!("1"));
        assert_eq!(stored["_id"], json!("c/1"));
        assert!(stored.contains_key("_rev"));
    }

    #[test]
    fn test_insert_into_missing_collection_fails() {
        let store = MemoryStore::new();
        let err = store.insert("nope", Document::new()).unwrap_err();
        assert!(matches!(err, StoreError::CollectionNotFound(_)));
    }

    #[test]
    fn test_kind_mismatch() {
        let store = MemoryStore::new();
        store.ensure_collection("c", CollectionKind::Document).unwrap();
        assert!(store.ensure_collection("c", CollectionKind::Edge).is_err());
        let edge = Edge {
            from: "c/1".into(),
            to: "c/2".into(),
            label: "x".into(),
        };
        assert!(store.insert_edge("c", &edge).is_err());
    }

    #[test]
    fn test_query_with_limit() {
        let store = MemoryStore::new();
        store.ensure_collection("c", CollectionKind::Document).unwrap();
        for i in 0..5 {
            store.insert("c", doc(json!({"type": "t", "n": i}))).unwrap();
        }
        let filter = Filter::comparison(&["n"], CompareOp::Ge, Literal::number(2));
        assert_eq!(store.query("c", &filter, None).unwrap().len(), 3);
        assert_eq!(store.query("c", &filter, Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn test_replace_and_remove() {
        let store = MemoryStore::new();
        store.ensure_collection("c", CollectionKind::Document).unwrap();
        let handle = store.insert("c", doc(json!({"v": 1}))).unwrap();
        store.replace(&handle, doc(json!({"v": 2}))).unwrap();
        assert_eq!(store.get(&handle.id).unwrap().unwrap()["v"], json!(2));
        assert!(store.remove(&handle).unwrap());
        assert!(!store.remove(&handle).unwrap());
        assert!(store.get(&handle.id).unwrap().is_none());
    }

    #[test]
    fn test_persistent_index_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_collection("c", CollectionKind::Document).unwrap();
        let fields = vec!["value".to_string(), "type".to_string()];
        store.ensure_persistent_index("c", &fields).unwrap();
        store.ensure_persistent_index("c", &fields).unwrap();
        assert_eq!(store.indexes("c"), vec![fields]);
    }
}
