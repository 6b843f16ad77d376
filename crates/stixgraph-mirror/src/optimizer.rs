//! Field optimizers: one mirror table per (collection, field path).

use crate::network::NetworkRange;
use crate::{quote_ident, MirrorConnection, MirrorError, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stixgraph_pattern::{CompareOp, Literal};

/// Class name recorded in optimizer descriptors.
pub const OPTIMIZER_CLASS: &str = "sqlite_mirror";

/// Persisted form of an optimizer, stored in feed metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerDescriptor {
    pub class: String,
    /// `type:field(:sub)*`
    pub field: String,
    /// Table name suffix appended to the collection name.
    pub uuid: String,
}

/// Native type of a mirror table's value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    /// Address or CIDR network, with containment bounds.
    Network,
}

impl ColumnKind {
    fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if NetworkRange::parse(s).is_some() => Some(ColumnKind::Network),
            Value::String(_) => Some(ColumnKind::Text),
            Value::Number(n) if n.is_i64() => Some(ColumnKind::Integer),
            Value::Number(_) => Some(ColumnKind::Real),
            Value::Bool(_) => Some(ColumnKind::Integer),
            _ => None,
        }
    }

    fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text | ColumnKind::Network => "TEXT",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
        }
    }
}

/// One mirrored value and the documents it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRow {
    pub value: Value,
    /// Primary store `_id` of the (possibly shared) document.
    pub doc_ref: String,
    pub object_id: String,
}

/// Value extracted from an object, converted for its column.
struct Extracted {
    value: SqlValue,
    range: Option<NetworkRange>,
}

pub struct Optimizer {
    mirror: MirrorConnection,
    field: String,
    stix_type: String,
    bound_path: Vec<String>,
    /// Path read from objects; differs from the bound path for derived fields.
    source_path: Vec<String>,
    suffix: String,
    table: String,
    kind: Option<ColumnKind>,
    pending_rows: usize,
    index_pending: bool,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("field", &self.field)
            .field("table", &self.table)
            .field("kind", &self.kind)
            .finish()
    }
}

fn parse_field(field: &str) -> Result<(String, Vec<String>)> {
    let mut parts = field.split(':');
    let stix_type = parts.next().unwrap_or_default();
    let path: Vec<String> = parts.map(str::to_string).collect();
    if stix_type.is_empty() || path.is_empty() || path.iter().any(String::is_empty) {
        return Err(MirrorError::InvalidFieldPath(field.to_string()));
    }
    Ok((stix_type.to_string(), path))
}

fn lookup<'a>(object: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = object.get(first)?;
    for segment in rest {
        current = current.get(segment)?;
    }
    Some(current)
}

fn remove_path(object: &mut Map<String, Value>, path: &[String]) {
    let Some((leaf, parents)) = path.split_last() else {
        return;
    };
    let mut current = object;
    for segment in parents {
        match current.get_mut(segment) {
            Some(Value::Object(next)) => current = next,
            _ => return,
        }
    }
    current.remove(leaf);
}

fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

impl Optimizer {
    /// A fresh optimizer for `field` over `collection`, with a new table
    /// suffix.
    pub fn new(mirror: MirrorConnection, field: &str, collection: &str) -> Result<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self::build(mirror, field, collection, suffix)
    }

    /// Rebuilds an optimizer recorded in feed metadata.
    pub fn from_descriptor(
        mirror: MirrorConnection,
        descriptor: &OptimizerDescriptor,
        collection: &str,
    ) -> Result<Self> {
        if descriptor.class != OPTIMIZER_CLASS {
            return Err(MirrorError::UnknownOptimizerClass(descriptor.class.clone()));
        }
        Self::build(mirror, &descriptor.field, collection, descriptor.uuid.clone())
    }

    fn build(
        mirror: MirrorConnection,
        field: &str,
        collection: &str,
        suffix: String,
    ) -> Result<Self> {
        let (stix_type, bound_path) = parse_field(field)?;
        Ok(Self {
            mirror,
            field: field.to_string(),
            stix_type,
            source_path: bound_path.clone(),
            bound_path,
            table: format!("{collection}_{suffix}"),
            suffix,
            kind: None,
            pending_rows: 0,
            index_pending: false,
        })
    }

    /// Reads the mirrored value from `source` instead of the bound field,
    /// for fields derived from another one at ingest.
    pub fn with_source_field(mut self, source: &str) -> Self {
        self.source_path = vec![source.to_string()];
        self
    }

    pub fn descriptor(&self) -> OptimizerDescriptor {
        OptimizerDescriptor {
            class: OPTIMIZER_CLASS.to_string(),
            field: self.field.clone(),
            uuid: self.suffix.clone(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn stix_type(&self) -> &str {
        &self.stix_type
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Path below the object the optimizer is bound to.
    pub fn bound_path(&self) -> &[String] {
        &self.bound_path
    }

    /// Path of the field that is stripped from and restored into objects.
    pub fn source_path(&self) -> &[String] {
        &self.source_path
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Column kind of an existing table, from its schema.
    fn detect_kind(&mut self) -> Result<Option<ColumnKind>> {
        if self.kind.is_some() {
            return Ok(self.kind);
        }
        let inner = self.mirror.lock();
        let mut stmt = inner
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(&self.table)))?;
        let columns = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(inner);

        if columns.is_empty() {
            return Ok(None);
        }
        let kind = if columns.iter().any(|(name, _)| name == "net_lo") {
            ColumnKind::Network
        } else {
            match columns
                .iter()
                .find(|(name, _)| name == "value")
                .map(|(_, ty)| ty.as_str())
            {
                Some("INTEGER") => ColumnKind::Integer,
                Some("REAL") => ColumnKind::Real,
                _ => ColumnKind::Text,
            }
        };
        self.kind = Some(kind);
        Ok(self.kind)
    }

    fn invalid(&self, reason: impl Into<String>) -> MirrorError {
        MirrorError::InvalidObjectForOptimizer {
            field: self.field.clone(),
            reason: reason.into(),
        }
    }

    fn extract(&self, object: &Map<String, Value>, kind: ColumnKind) -> Result<Extracted> {
        let object_type = object.get("type").and_then(Value::as_str).unwrap_or_default();
        if object_type != self.stix_type {
            return Err(self.invalid(format!("object type `{object_type}`")));
        }
        let value = lookup(object, &self.source_path)
            .ok_or_else(|| self.invalid("field is missing"))?;

        let extracted = match (kind, value) {
            (ColumnKind::Network, Value::String(s)) => {
                let range = NetworkRange::parse(s)
                    .ok_or_else(|| self.invalid(format!("`{s}` is not an address")))?;
                Extracted {
                    value: SqlValue::Text(s.clone()),
                    range: Some(range),
                }
            }
            (ColumnKind::Text, Value::String(s)) => Extracted {
                value: SqlValue::Text(s.clone()),
                range: None,
            },
            (ColumnKind::Integer, Value::Number(n)) if n.is_i64() => Extracted {
                value: SqlValue::Integer(n.as_i64().unwrap_or_default()),
                range: None,
            },
            (ColumnKind::Integer, Value::Bool(b)) => Extracted {
                value: SqlValue::Integer(i64::from(*b)),
                range: None,
            },
            (ColumnKind::Real, Value::Number(n)) => Extracted {
                value: SqlValue::Real(n.as_f64().unwrap_or_default()),
                range: None,
            },
            (kind, other) => {
                return Err(self.invalid(format!("{other} does not fit a {kind:?} column")))
            }
        };
        Ok(extracted)
    }

    /// Checks whether `object` can be mirrored, without writing anything.
    pub fn accepts(&mut self, object: &Map<String, Value>) -> Result<()> {
        let kind = match self.detect_kind()? {
            Some(kind) => kind,
            None => {
                let value = lookup(object, &self.source_path)
                    .ok_or_else(|| self.invalid("field is missing"))?;
                ColumnKind::infer(value)
                    .ok_or_else(|| self.invalid(format!("{value} has no column type")))?
            }
        };
        self.extract(object, kind).map(|_| ())
    }

    fn create_table(&mut self, kind: ColumnKind) -> Result<()> {
        let table = quote_ident(&self.table);
        let sql = match kind {
            ColumnKind::Network => format!(
                "CREATE TABLE IF NOT EXISTS {table} (value TEXT, net_lo TEXT NOT NULL, \
                 net_hi TEXT NOT NULL, doc_ref TEXT NOT NULL, object_id TEXT NOT NULL)"
            ),
            other => format!(
                "CREATE TABLE IF NOT EXISTS {table} (value {}, doc_ref TEXT NOT NULL, \
                 object_id TEXT NOT NULL)",
                other.sql_type()
            ),
        };
        let mut inner = self.mirror.lock();
        inner.begin()?;
        inner.conn.execute_batch(&sql)?;
        // the index is added once the table creation is committed
        inner.commit()?;
        drop(inner);

        tracing::debug!(table = %self.table, ?kind, "created mirror table");
        self.kind = Some(kind);
        self.index_pending = true;
        Ok(())
    }

    fn create_indexes(&mut self) -> Result<()> {
        let table = quote_ident(&self.table);
        let value_index = quote_ident(&format!("{}_value_idx", self.table));
        let doc_index = quote_ident(&format!("{}_doc_idx", self.table));
        let columns = match self.kind {
            Some(ColumnKind::Network) => "net_lo, net_hi",
            _ => "value",
        };
        let inner = self.mirror.lock();
        inner.conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {value_index} ON {table} ({columns});
             CREATE INDEX IF NOT EXISTS {doc_index} ON {table} (doc_ref);"
        ))?;
        drop(inner);
        self.index_pending = false;
        Ok(())
    }

    /// Mirrors one object stored under `doc_ref`.
    ///
    /// Fails with [`MirrorError::InvalidObjectForOptimizer`] when the object
    /// has another type, lacks the field, or its value does not fit the
    /// table.
    pub fn insert(&mut self, object: &Map<String, Value>, doc_ref: &str) -> Result<()> {
        let kind = match self.detect_kind()? {
            Some(kind) => kind,
            None => {
                let value = lookup(object, &self.source_path)
                    .ok_or_else(|| self.invalid("field is missing"))?;
                let kind = ColumnKind::infer(value)
                    .ok_or_else(|| self.invalid(format!("{value} has no column type")))?;
                self.extract(object, kind)?;
                self.create_table(kind)?;
                kind
            }
        };
        let extracted = self.extract(object, kind)?;
        let object_id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid("object has no id"))?
            .to_string();

        let table = quote_ident(&self.table);
        let mut inner = self.mirror.lock();
        inner.begin()?;
        match extracted.range {
            Some(range) => {
                inner.conn.execute(
                    &format!(
                        "INSERT INTO {table} (value, net_lo, net_hi, doc_ref, object_id) \
                         VALUES (?1, ?2, ?3, ?4, ?5)"
                    ),
                    rusqlite::params![
                        extracted.value,
                        range.lo_hex(),
                        range.hi_hex(),
                        doc_ref,
                        object_id
                    ],
                )?;
            }
            None => {
                inner.conn.execute(
                    &format!(
                        "INSERT INTO {table} (value, doc_ref, object_id) VALUES (?1, ?2, ?3)"
                    ),
                    rusqlite::params![extracted.value, doc_ref, object_id],
                )?;
            }
        }
        drop(inner);

        self.pending_rows += 1;
        if self.pending_rows >= self.mirror.commit_every() {
            self.flush()?;
        }
        Ok(())
    }

    /// Commits pending rows and adds indexes to a freshly created table.
    pub fn flush(&mut self) -> Result<()> {
        self.mirror.commit()?;
        self.pending_rows = 0;
        if self.index_pending {
            self.create_indexes()?;
        }
        Ok(())
    }

    /// Removes the mirrored field from an object's primary copy.
    pub fn strip(&self, mut object: Map<String, Value>) -> Map<String, Value> {
        if object.get("type").and_then(Value::as_str) == Some(self.stix_type.as_str()) {
            remove_path(&mut object, &self.source_path);
        }
        object
    }

    /// Writes a mirrored value back into an object.
    pub fn restore(&self, object: &mut Map<String, Value>, value: Value) {
        let Some((leaf, parents)) = self.source_path.split_last() else {
            return;
        };
        let mut current = object;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            match entry {
                Value::Object(next) => current = next,
                _ => return,
            }
        }
        current.insert(leaf.clone(), value);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn select(&mut self, condition: &str, params: Vec<SqlValue>) -> Result<Vec<MirrorRow>> {
        if self.detect_kind()?.is_none() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT value, doc_ref, object_id FROM {} WHERE {condition}",
            quote_ident(&self.table)
        );
        let inner = self.mirror.lock();
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok(MirrorRow {
                    value: sql_to_json(row.get::<_, SqlValue>(0)?),
                    doc_ref: row.get(1)?,
                    object_id: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rows whose value satisfies `<field> <op> <literal>`.
    ///
    /// On address columns equality means "equal to or contained within".
    pub fn query(&mut self, op: CompareOp, literal: &Literal) -> Result<Vec<MirrorRow>> {
        self.query_inner(op, literal, true)
    }

    /// Like [`Optimizer::query`], comparing values as written even on
    /// address columns.
    pub fn query_values(&mut self, op: CompareOp, literal: &Literal) -> Result<Vec<MirrorRow>> {
        self.query_inner(op, literal, false)
    }

    fn query_inner(
        &mut self,
        op: CompareOp,
        literal: &Literal,
        containment: bool,
    ) -> Result<Vec<MirrorRow>> {
        let kind = match self.detect_kind()? {
            Some(kind) => kind,
            None => return Ok(Vec::new()),
        };

        let network_eq = kind == ColumnKind::Network && matches!(op, CompareOp::Eq | CompareOp::Ne);
        if containment && network_eq {
            if let Some(range) = literal.text().as_deref().and_then(NetworkRange::parse) {
                let contained = "(net_lo <= ?1 AND net_hi >= ?2)";
                let condition = if op == CompareOp::Eq {
                    contained.to_string()
                } else {
                    format!("NOT {contained}")
                };
                return self.select(
                    &condition,
                    vec![SqlValue::Text(range.lo_hex()), SqlValue::Text(range.hi_hex())],
                );
            }
        }

        let param = match literal {
            Literal::Str { .. } => SqlValue::Text(literal.text().unwrap_or_default()),
            Literal::Number(raw) => match raw.parse::<i64>() {
                Ok(i) => SqlValue::Integer(i),
                Err(_) => SqlValue::Real(raw.parse::<f64>().unwrap_or(f64::NAN)),
            },
            Literal::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Literal::Null => {
                return match op {
                    CompareOp::Eq => self.select("value IS NULL", Vec::new()),
                    CompareOp::Ne => self.select("value IS NOT NULL", Vec::new()),
                    _ => Ok(Vec::new()),
                }
            }
        };
        let condition = match op {
            CompareOp::Eq => "value = ?1",
            CompareOp::Ne => "value <> ?1",
            CompareOp::Lt => "value < ?1",
            CompareOp::Le => "value <= ?1",
            CompareOp::Gt => "value > ?1",
            CompareOp::Ge => "value >= ?1",
            CompareOp::Like => "value LIKE ?1 ESCAPE '\\'",
            CompareOp::NotLike => "value NOT LIKE ?1 ESCAPE '\\'",
        };
        self.select(condition, vec![param])
    }

    /// Every row stored against one primary document.
    pub fn rows_for_document(&mut self, doc_ref: &str) -> Result<Vec<MirrorRow>> {
        self.select(
            "doc_ref = ?1 ORDER BY rowid",
            vec![SqlValue::Text(doc_ref.to_string())],
        )
    }

    /// The mirrored value of one object within one primary document.
    pub fn value_for(&mut self, doc_ref: &str, object_id: &str) -> Result<Option<Value>> {
        if self.detect_kind()?.is_none() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT value FROM {} WHERE doc_ref = ?1 AND object_id = ?2 LIMIT 1",
            quote_ident(&self.table)
        );
        let inner = self.mirror.lock();
        let value = inner
            .conn
            .query_row(&sql, [doc_ref, object_id], |row| row.get::<_, SqlValue>(0))
            .optional()?;
        Ok(value.map(sql_to_json))
    }

    pub fn row_count(&mut self) -> Result<usize> {
        if self.detect_kind()?.is_none() {
            return Ok(0);
        }
        let inner = self.mirror.lock();
        let count: i64 = inner.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Deletes rows whose primary document is gone; returns how many.
    pub fn reconcile(&mut self, document_exists: &mut dyn FnMut(&str) -> bool) -> Result<usize> {
        if self.detect_kind()?.is_none() {
            return Ok(0);
        }
        let table = quote_ident(&self.table);
        let doc_refs: Vec<String> = {
            let inner = self.mirror.lock();
            let mut stmt = inner
                .conn
                .prepare(&format!("SELECT DISTINCT doc_ref FROM {table}"))?;
            let refs = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            refs
        };

        let mut removed = 0;
        for doc_ref in doc_refs.iter().filter(|r| !document_exists(r.as_str())) {
            let mut inner = self.mirror.lock();
            inner.begin()?;
            removed += inner.conn.execute(
                &format!("DELETE FROM {table} WHERE doc_ref = ?1"),
                [doc_ref],
            )?;
        }
        self.mirror.commit()?;
        if removed > 0 {
            tracing::info!(table = %self.table, removed, "removed orphaned mirror rows");
        }
        Ok(removed)
    }

    /// Drops the mirror table; `Ok(false)` if it was never created.
    pub fn drop_table(&mut self) -> Result<bool> {
        self.kind = None;
        self.index_pending = false;
        self.pending_rows = 0;
        self.mirror.drop_table(&self.table)
    }
}
