//! ArangoDB backend over the HTTP API.
//!
//! Compiled filters are rendered to AQL and run through the cursor API.
//! Snapshots shell out to `arangodump` / `arangorestore`, which must be on
//! `PATH`; their absence is reported before anything is written.

use crate::{
    CollectionKind, Document, DocumentHandle, DocumentStore, Edge, Result, StoreError,
    TraversalPolicy, RELATIONSHIP_TYPE,
};
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use stixgraph_pattern::Filter;

/// Document variable used in generated AQL.
pub const RECORD_VAR: &str = "record";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArangoConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Per-request transport timeout.
    pub timeout_secs: u64,
    pub dump_tool: String,
    pub restore_tool: String,
}

impl Default for ArangoConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8529".to_string(),
            database: "stixgraph".to_string(),
            username: "root".to_string(),
            password: String::new(),
            timeout_secs: 30,
            dump_tool: "arangodump".to_string(),
            restore_tool: "arangorestore".to_string(),
        }
    }
}

impl ArangoConfig {
    /// Server endpoint in the form the command line tools expect.
    pub fn tool_endpoint(&self) -> String {
        if let Some(rest) = self.url.strip_prefix("https://") {
            format!("ssl://{}", rest.trim_end_matches('/'))
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("tcp://{}", rest.trim_end_matches('/'))
        } else {
            self.url.clone()
        }
    }
}

// ============================================================================
// AQL
// ============================================================================

/// `FOR record IN @@collection FILTER ... [LIMIT n] RETURN record`
pub fn filter_query(filter: &Filter, limit: Option<usize>) -> String {
    let mut query = format!(
        "FOR {var} IN @@collection FILTER {filter}",
        var = RECORD_VAR,
        filter = stixgraph_pattern::cosmetic::tidy(&filter.to_aql(RECORD_VAR)),
    );
    if let Some(limit) = limit {
        query.push_str(&format!(" LIMIT {limit}"));
    }
    query.push_str(&format!(" RETURN {RECORD_VAR}"));
    query
}

/// Bidirectional traversal that stops expanding at the first hop unless the
/// vertex is a relationship.
pub fn traversal_query() -> String {
    format!(
        "FOR v, e, p IN 0..@depth ANY @start @@edges \
         PRUNE LENGTH(p.vertices) == 2 AND p.vertices[1].type != \"{RELATIONSHIP_TYPE}\" \
         OPTIONS {{ uniqueVertices: \"global\", order: \"bfs\" }} \
         RETURN v"
    )
}

/// Finds an executable on `PATH`.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

// ============================================================================
// Store
// ============================================================================

/// ArangoDB over `reqwest::blocking`.
///
/// The blocking client owns a runtime of its own: build the store, and drop
/// its last handle, outside async tasks (in `main`, a plain thread, or
/// `tokio::task::spawn_blocking`). Calls made from async code go through
/// `spawn_blocking` the same way.
pub struct ArangoStore {
    client: Client,
    config: ArangoConfig,
}

impl std::fmt::Debug for ArangoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArangoStore")
            .field("url", &self.config.url)
            .field("database", &self.config.database)
            .finish()
    }
}

impl ArangoStore {
    /// Builds the HTTP client. No request is made until first use.
    ///
    /// The blocking client must not be created or dropped on an async
    /// runtime thread.
    pub fn connect(config: ArangoConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ArangoConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/_db/{}/_api/{}",
            self.config.url.trim_end_matches('/'),
            self.config.database,
            path
        )
    }

    /// Sends a request; statuses listed in `absent` yield `Ok(None)`.
    fn send(&self, request: RequestBuilder, absent: &[u16]) -> Result<Option<Value>> {
        let response = request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()?;
        let status = response.status().as_u16();
        if absent.contains(&status) {
            return Ok(None);
        }
        let body: Value = response.json().unwrap_or(Value::Null);
        if status >= 400 {
            let message = body
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("no error message")
                .to_string();
            return Err(StoreError::Http { status, message });
        }
        Ok(Some(body))
    }

    fn send_required(&self, request: RequestBuilder) -> Result<Value> {
        Ok(self.send(request, &[])?.unwrap_or(Value::Null))
    }

    /// Runs an AQL query and drains its cursor.
    fn cursor(&self, query: &str, bind_vars: Value) -> Result<Vec<Value>> {
        tracing::debug!(%query, "running AQL");
        let body = json!({"query": query, "bindVars": bind_vars, "batchSize": 1000});
        let mut page = self.send_required(self.client.post(self.endpoint("cursor")).json(&body))?;
        let mut rows = Vec::new();
        loop {
            if let Some(Value::Array(batch)) = page.get_mut("result").map(Value::take) {
                rows.extend(batch);
            }
            let has_more = page.get("hasMore").and_then(Value::as_bool).unwrap_or(false);
            let cursor_id = page.get("id").and_then(Value::as_str).map(str::to_string);
            match (has_more, cursor_id) {
                (true, Some(id)) => {
                    page = self.send_required(
                        self.client.put(self.endpoint(&format!("cursor/{id}"))),
                    )?;
                }
                _ => break,
            }
        }
        Ok(rows)
    }

    fn documents(rows: Vec<Value>) -> Vec<Document> {
        rows.into_iter()
            .filter_map(|row| match row {
                Value::Object(doc) => Some(doc),
                _ => None,
            })
            .collect()
    }

    fn handle_from(body: &Value) -> Result<DocumentHandle> {
        body.get("_id")
            .and_then(Value::as_str)
            .map(|id| DocumentHandle { id: id.to_string() })
            .ok_or_else(|| StoreError::Http {
                status: 200,
                message: "response carries no _id".to_string(),
            })
    }

    fn run_tool(&self, tool: &str, args: &[String]) -> Result<()> {
        let path =
            find_tool(tool).ok_or_else(|| StoreError::ToolingMissing(tool.to_string()))?;
        let output = Command::new(path).args(args).output()?;
        if !output.status.success() {
            return Err(StoreError::ToolingFailed {
                tool: tool.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn connection_args(&self) -> Vec<String> {
        vec![
            "--server.endpoint".to_string(),
            self.config.tool_endpoint(),
            "--server.username".to_string(),
            self.config.username.clone(),
            "--server.password".to_string(),
            self.config.password.clone(),
            "--server.database".to_string(),
            self.config.database.clone(),
        ]
    }
}

impl DocumentStore for ArangoStore {
    fn collections(&self) -> Result<Vec<String>> {
        let body = self.send_required(
            self.client
                .get(self.endpoint("collection"))
                .query(&[("excludeSystem", "true")]),
        )?;
        Ok(body
            .get("result")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        let found = self.send(
            self.client.get(self.endpoint(&format!("collection/{name}"))),
            &[404],
        )?;
        Ok(found.is_some())
    }

    fn ensure_collection(&self, name: &str, kind: CollectionKind) -> Result<()> {
        let kind_code = match kind {
            CollectionKind::Document => 2,
            CollectionKind::Edge => 3,
        };
        let body = json!({"name": name, "type": kind_code});
        // 409: duplicate name
        self.send(self.client.post(self.endpoint("collection")).json(&body), &[409])?;
        Ok(())
    }

    fn drop_collection(&self, name: &str) -> Result<bool> {
        let dropped = self.send(
            self.client.delete(self.endpoint(&format!("collection/{name}"))),
            &[404],
        )?;
        Ok(dropped.is_some())
    }

    fn insert(&self, collection: &str, doc: Document) -> Result<DocumentHandle> {
        let body = self.send_required(
            self.client
                .post(self.endpoint(&format!("document/{collection}")))
                .json(&doc),
        )?;
        Self::handle_from(&body)
    }

    fn replace(&self, handle: &DocumentHandle, doc: Document) -> Result<()> {
        let replaced = self.send(
            self.client
                .put(self.endpoint(&format!("document/{}", handle.id)))
                .json(&doc),
            &[404],
        )?;
        match replaced {
            Some(_) => Ok(()),
            None => Err(StoreError::DocumentNotFound(handle.id.clone())),
        }
    }

    fn remove(&self, handle: &DocumentHandle) -> Result<bool> {
        let removed = self.send(
            self.client
                .delete(self.endpoint(&format!("document/{}", handle.id))),
            &[404],
        )?;
        Ok(removed.is_some())
    }

    fn get(&self, id: &str) -> Result<Option<Document>> {
        let found = self.send(
            self.client.get(self.endpoint(&format!("document/{id}"))),
            &[404],
        )?;
        Ok(found.and_then(|v| match v {
            Value::Object(doc) => Some(doc),
            _ => None,
        }))
    }

    fn all(&self, collection: &str) -> Result<Vec<Document>> {
        let rows = self.cursor(
            "FOR d IN @@collection RETURN d",
            json!({"@collection": collection}),
        )?;
        Ok(Self::documents(rows))
    }

    fn count(&self, collection: &str) -> Result<usize> {
        let body = self.send(
            self.client
                .get(self.endpoint(&format!("collection/{collection}/count"))),
            &[404],
        )?;
        let body = body.ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or(0) as usize)
    }

    fn query(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let rows = self.cursor(
            &filter_query(filter, limit),
            json!({"@collection": collection}),
        )?;
        Ok(Self::documents(rows))
    }

    fn insert_edge(&self, collection: &str, edge: &Edge) -> Result<DocumentHandle> {
        let body = json!({"_from": edge.from, "_to": edge.to, "label": edge.label});
        let body = self.send_required(
            self.client
                .post(self.endpoint(&format!("document/{collection}")))
                .json(&body),
        )?;
        Self::handle_from(&body)
    }

    fn traverse(
        &self,
        start: &str,
        edge_collection: &str,
        policy: TraversalPolicy,
    ) -> Result<Vec<Document>> {
        if !self.has_collection(edge_collection)? {
            return Ok(self.get(start)?.into_iter().collect());
        }
        let rows = self.cursor(
            &traversal_query(),
            json!({
                "depth": policy.max_depth(),
                "start": start,
                "@edges": edge_collection,
            }),
        )?;
        Ok(Self::documents(rows))
    }

    fn ensure_persistent_index(&self, collection: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let body = json!({"type": "persistent", "fields": fields, "inBackground": true});
        self.send_required(
            self.client
                .post(self.endpoint("index"))
                .query(&[("collection", collection)])
                .json(&body),
        )?;
        Ok(())
    }

    fn export(&self, dir: &Path, collections: &[String]) -> Result<()> {
        let tool = self.config.dump_tool.clone();
        if find_tool(&tool).is_none() {
            return Err(StoreError::ToolingMissing(tool));
        }
        let mut args = self.connection_args();
        args.extend([
            "--output-directory".to_string(),
            dir.display().to_string(),
            "--overwrite".to_string(),
            "true".to_string(),
        ]);
        for collection in collections {
            args.push("--collection".to_string());
            args.push(collection.clone());
        }
        tracing::info!(dir = %dir.display(), collections = collections.len(), "running {tool}");
        self.run_tool(&tool, &args)
    }

    fn import(&self, dir: &Path) -> Result<()> {
        let tool = self.config.restore_tool.clone();
        if find_tool(&tool).is_none() {
            return Err(StoreError::ToolingMissing(tool));
        }
        let mut args = self.connection_args();
        args.extend([
            "--input-directory".to_string(),
            dir.display().to_string(),
            "--overwrite".to_string(),
            "true".to_string(),
        ]);
        tracing::info!(dir = %dir.display(), "running {tool}");
        self.run_tool(&tool, &args)
    }
}
