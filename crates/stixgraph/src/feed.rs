//! Feeds: named, tagged, dated batches of objects.
//!
//! ```text
//!   insert(batch)
//!     │  static paradigm: drop previous contents (once per instance)
//!     │  save metadata record (once per instance)
//!     ▼
//!   for each object ──► seen before? ──► skip
//!     │  queue edges from *_ref / *_refs
//!     │  optimizers accept? ── yes ──► strip mirrored fields, mark `_mirror`
//!     │                     └─ no ───► modifier augmentation
//!     │  identical stored form? ──► share the primary document
//!     ▼
//!   primary store  +  mirror rows (value, doc_ref, object_id)
//!     ▼
//!   edges (every endpoint must be in an inserted batch)
//! ```
//!
//! One metadata record per feed instance lives in [`META_COLLECTION`]; it is
//! replaced in place whenever a new object type shows up.

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stixgraph_mirror::{MirrorError, Optimizer, OptimizerDescriptor};
use stixgraph_pattern::{Clause, CompareOp, DocumentSet};
use stixgraph_store::{strip_internal, CollectionKind, Document, DocumentHandle, Edge};

use crate::addressing::{edge_collection_name, StorageParadigm, META_COLLECTION};
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::identity::is_reference_field;

/// Version written into metadata records.
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Internal field listing the optimizer fields stripped from a primary copy.
pub const MIRROR_MARKER: &str = "_mirror";

const MAX_FEED_NAME_LEN: usize = 30;

pub fn is_valid_feed_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FEED_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Metadata
// ============================================================================

/// Persisted feed metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub feed_name: String,
    /// Insertion date, epoch seconds.
    pub date: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub storage_paradigm: StorageParadigm,
    #[serde(default)]
    pub version: Option<String>,
    /// Absent in records written before type tracking existed.
    #[serde(default)]
    pub inserted_stix_types: Option<Vec<String>>,
    /// Epoch seconds; absent records are never vacuumed.
    #[serde(default)]
    pub vacuum_date: Option<i64>,
    #[serde(default)]
    pub optimizers: Vec<OptimizerDescriptor>,
}

impl FeedRecord {
    /// Object collection the instance wrote to.
    pub fn collection_name(&self) -> Result<String> {
        Ok(self
            .storage_paradigm
            .collection_name(&self.feed_name, timestamp(self.date)?))
    }

    /// Takes over the object types and optimizers of another instance that
    /// wrote to the same collection.
    pub(crate) fn absorb(&mut self, other: &FeedRecord) -> bool {
        let mut changed = false;
        if other.inserted_stix_types.is_none() {
            // an untracked instance may hold any type
            changed |= self.inserted_stix_types.take().is_some();
        } else if let (Some(types), Some(more)) =
            (&mut self.inserted_stix_types, &other.inserted_stix_types)
        {
            for stix_type in more {
                if !types.contains(stix_type) {
                    types.push(stix_type.clone());
                    changed = true;
                }
            }
        }
        for descriptor in &other.optimizers {
            if !self.optimizers.iter().any(|o| o.field == descriptor.field) {
                self.optimizers.push(descriptor.clone());
                changed = true;
            }
        }
        changed
    }

    pub(crate) fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(Error::InvalidObject("feed record is not an object".to_string())),
        }
    }
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| Error::InvalidObject(format!("timestamp {seconds} is out of range")))
}

/// Every metadata record with its handle.
pub(crate) fn load_records(ctx: &EngineContext) -> Result<Vec<(DocumentHandle, FeedRecord)>> {
    if !ctx.store.has_collection(META_COLLECTION)? {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for doc in ctx.store.all(META_COLLECTION)? {
        let Some(id) = doc.get("_id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        match serde_json::from_value::<FeedRecord>(Value::Object(strip_internal(doc))) {
            Ok(record) => records.push((DocumentHandle { id }, record)),
            Err(err) => tracing::warn!(record = %id, error = %err, "skipping unreadable feed record"),
        }
    }
    Ok(records)
}

// ============================================================================
// Options and reports
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    pub tags: Vec<String>,
    /// Insertion date; now when absent.
    pub date: Option<DateTime<Utc>>,
    pub paradigm: StorageParadigm,
    /// Defaults to the date plus the configured retention.
    pub vacuum_date: Option<DateTime<Utc>>,
}

impl FeedOptions {
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn paradigm(mut self, paradigm: StorageParadigm) -> Self {
        self.paradigm = paradigm;
        self
    }

    pub fn vacuum_date(mut self, date: DateTime<Utc>) -> Self {
        self.vacuum_date = Some(date);
        self
    }
}

/// Counters for one [`Feed::insert`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    /// Primary documents written.
    pub written: usize,
    /// Objects skipped because an identical one was already inserted.
    pub deduplicated: usize,
    pub edges: usize,
    /// Mirror rows written.
    pub mirrored: usize,
    /// Objects an optimizer of their type could not mirror.
    pub mirror_skipped: usize,
}

struct PendingEdge {
    from: String,
    to: String,
    label: String,
}

// ============================================================================
// Feed
// ============================================================================

pub struct Feed {
    ctx: EngineContext,
    name: String,
    tags: Vec<String>,
    date: DateTime<Utc>,
    paradigm: StorageParadigm,
    vacuum_date: Option<DateTime<Utc>>,
    version: Option<String>,
    inserted_types: Option<Vec<String>>,
    optimizers: Vec<Optimizer>,

    meta_handle: Option<DocumentHandle>,
    has_been_emptied: bool,
    /// Compact forms of objects already handled.
    seen_originals: AHashSet<String>,
    /// Compact stored forms, for sharing primary documents.
    stored_forms: AHashMap<String, DocumentHandle>,
    /// Object id to primary document.
    inserted: AHashMap<String, DocumentHandle>,
    pending_edges: Vec<PendingEdge>,
    written_edges: AHashSet<(String, String, String)>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("date", &self.date)
            .field("paradigm", &self.paradigm)
            .field("optimizers", &self.optimizers)
            .finish()
    }
}

impl Feed {
    pub fn new(ctx: &EngineContext, name: &str, options: FeedOptions) -> Result<Self> {
        if !is_valid_feed_name(name) {
            return Err(Error::InvalidFeedName(name.to_string()));
        }
        let date = options.date.unwrap_or_else(Utc::now);
        let vacuum_date = options
            .vacuum_date
            .unwrap_or_else(|| date + Duration::days(ctx.config.feed.retention_days));
        Ok(Self::assemble(
            ctx,
            name.to_string(),
            options.tags,
            date,
            options.paradigm,
            Some(vacuum_date),
            Some(SCHEMA_VERSION.to_string()),
            Some(Vec::new()),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        ctx: &EngineContext,
        name: String,
        tags: Vec<String>,
        date: DateTime<Utc>,
        paradigm: StorageParadigm,
        vacuum_date: Option<DateTime<Utc>>,
        version: Option<String>,
        inserted_types: Option<Vec<String>>,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            name,
            tags,
            date,
            paradigm,
            vacuum_date,
            version,
            inserted_types,
            optimizers: Vec::new(),
            meta_handle: None,
            has_been_emptied: false,
            seen_originals: AHashSet::new(),
            stored_forms: AHashMap::new(),
            inserted: AHashMap::new(),
            pending_edges: Vec::new(),
            written_edges: AHashSet::new(),
        }
    }

    /// Rebuilds a feed from its metadata record, optimizers included.
    pub fn from_record(
        ctx: &EngineContext,
        handle: Option<DocumentHandle>,
        record: FeedRecord,
    ) -> Result<Self> {
        if !is_valid_feed_name(&record.feed_name) {
            return Err(Error::InvalidFeedName(record.feed_name));
        }
        let vacuum_date = record.vacuum_date.map(timestamp).transpose()?;
        let mut feed = Self::assemble(
            ctx,
            record.feed_name,
            record.tags,
            timestamp(record.date)?,
            record.storage_paradigm,
            vacuum_date,
            record.version,
            record.inserted_stix_types,
        );
        if !record.optimizers.is_empty() {
            let mirror = ctx.mirror()?.clone();
            let collection = feed.collection_name();
            for descriptor in &record.optimizers {
                let optimizer = Optimizer::from_descriptor(mirror.clone(), descriptor, &collection)?;
                feed.optimizers.push(bind_source(ctx, optimizer));
            }
        }
        feed.meta_handle = handle;
        Ok(feed)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn paradigm(&self) -> StorageParadigm {
        self.paradigm
    }

    pub fn vacuum_date(&self) -> Option<DateTime<Utc>> {
        self.vacuum_date
    }

    /// Object types inserted so far; `None` for records that predate type
    /// tracking.
    pub fn inserted_types(&self) -> Option<&[String]> {
        self.inserted_types.as_deref()
    }

    pub fn optimizers(&self) -> &[Optimizer] {
        &self.optimizers
    }

    pub fn collection_name(&self) -> String {
        self.paradigm.collection_name(&self.name, self.date)
    }

    pub fn edge_collection_name(&self) -> String {
        edge_collection_name(&self.collection_name())
    }

    pub(crate) fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub(crate) fn meta_handle(&self) -> Option<&DocumentHandle> {
        self.meta_handle.as_ref()
    }

    pub fn record(&self) -> FeedRecord {
        FeedRecord {
            feed_name: self.name.clone(),
            date: self.date.timestamp(),
            tags: self.tags.clone(),
            storage_paradigm: self.paradigm,
            version: self.version.clone(),
            inserted_stix_types: self.inserted_types.clone(),
            vacuum_date: self.vacuum_date.map(|d| d.timestamp()),
            optimizers: self.optimizers.iter().map(Optimizer::descriptor).collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Every recorded feed.
    pub fn feeds(ctx: &EngineContext) -> Result<Vec<Feed>> {
        load_records(ctx)?
            .into_iter()
            .map(|(handle, record)| Feed::from_record(ctx, Some(handle), record))
            .collect()
    }

    /// The newest feed per name that was inserted on or before `before`.
    ///
    /// Feeds that are not time based have a single collection and always
    /// qualify. Earlier instances that wrote to the same collection lend the
    /// feed their object types and optimizers. The result is ordered by feed
    /// name.
    pub fn last_feeds(ctx: &EngineContext, before: DateTime<Utc>) -> Result<Vec<Feed>> {
        let cutoff = before.timestamp();
        let mut by_name: AHashMap<String, Vec<(DocumentHandle, FeedRecord)>> = AHashMap::new();
        for (handle, record) in load_records(ctx)? {
            if record.storage_paradigm.is_time_based() && record.date > cutoff {
                continue;
            }
            by_name
                .entry(record.feed_name.clone())
                .or_default()
                .push((handle, record));
        }

        let mut feeds = Vec::with_capacity(by_name.len());
        for instances in by_name.into_values() {
            if let Some((handle, record)) = merge_instances(instances)? {
                feeds.push(Feed::from_record(ctx, Some(handle), record)?);
            }
        }
        feeds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(feeds)
    }

    // ------------------------------------------------------------------------
    // Optimizers
    // ------------------------------------------------------------------------

    /// Mirrors `field` (`type:field(:sub)*`) into a relational table.
    ///
    /// Must be called before the first insert. A table recorded for the same
    /// field and collection by an earlier instance of this feed is reused.
    pub fn add_optimizer(&mut self, field: &str) -> Result<()> {
        let mirror = self.ctx.mirror()?.clone();
        if self.meta_handle.is_some() || !self.inserted.is_empty() {
            return Err(Error::Config(format!(
                "optimizer `{field}` must be added to feed `{}` before its first insert",
                self.name
            )));
        }
        if self.optimizers.iter().any(|o| o.field() == field) {
            return Ok(());
        }
        let collection = self.collection_name();
        let previous = load_records(&self.ctx)?
            .into_iter()
            .filter(|(_, record)| {
                record.feed_name == self.name
                    && record.storage_paradigm.collection_name(&record.feed_name, self.date)
                        == collection
            })
            .flat_map(|(_, record)| record.optimizers)
            .find(|descriptor| descriptor.field == field);

        let optimizer = match previous {
            Some(descriptor) => Optimizer::from_descriptor(mirror, &descriptor, &collection)?,
            None => Optimizer::new(mirror, field, &collection)?,
        };
        tracing::info!(
            feed = %self.name,
            field,
            table = optimizer.table_name(),
            "added optimizer"
        );
        self.optimizers.push(bind_source(&self.ctx, optimizer));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Inserts a closed batch of objects.
    ///
    /// Every `_ref`/`_refs` target must be part of this batch or of an
    /// earlier batch of this instance; otherwise the call fails with
    /// [`Error::DanglingReference`] after the objects were written.
    pub fn insert(&mut self, objects: &[Document]) -> Result<InsertReport> {
        for object in objects {
            validate_object(object)?;
        }
        if self.paradigm == StorageParadigm::Static && !self.has_been_emptied {
            self.drop()?;
        }

        let collection = self.collection_name();
        self.ctx
            .store
            .ensure_collection(&collection, CollectionKind::Document)?;
        if self.meta_handle.is_none() {
            self.save()?;
        }

        let mut report = InsertReport::default();
        for object in objects {
            self.insert_one(&collection, object, &mut report)?;
        }
        for optimizer in &mut self.optimizers {
            optimizer.flush()?;
        }
        report.edges = self.flush_edges()?;

        tracing::info!(
            feed = %self.name,
            collection = %collection,
            written = report.written,
            deduplicated = report.deduplicated,
            edges = report.edges,
            mirrored = report.mirrored,
            "inserted batch"
        );
        Ok(report)
    }

    fn insert_one(
        &mut self,
        collection: &str,
        object: &Document,
        report: &mut InsertReport,
    ) -> Result<()> {
        let compact = Value::Object(object.clone()).to_string();
        if !self.seen_originals.insert(compact) {
            report.deduplicated += 1;
            return Ok(());
        }
        let (stix_type, object_id) = validate_object(object)?;
        let (stix_type, object_id) = (stix_type.to_string(), object_id.to_string());
        self.track_type(&stix_type)?;
        self.queue_edges(&object_id, object);

        let mut owners = Vec::new();
        for (index, optimizer) in self.optimizers.iter_mut().enumerate() {
            if optimizer.stix_type() != stix_type {
                continue;
            }
            match optimizer.accepts(object) {
                Ok(()) => owners.push(index),
                Err(MirrorError::InvalidObjectForOptimizer { field, reason }) => {
                    tracing::debug!(object = %object_id, %field, %reason, "object not mirrored");
                    report.mirror_skipped += 1;
                }
                Err(other) => return Err(other.into()),
            }
        }

        let stored = if owners.is_empty() {
            self.ctx.modifiers.augment(object.clone())
        } else {
            let mut stored = object.clone();
            let mut fields = Vec::with_capacity(owners.len());
            for &index in &owners {
                stored = self.optimizers[index].strip(stored);
                fields.push(Value::String(self.optimizers[index].field().to_string()));
            }
            stored.remove("id");
            stored.insert(MIRROR_MARKER.to_string(), Value::Array(fields));
            stored
        };

        let stored_compact = Value::Object(stored.clone()).to_string();
        let handle = match self.stored_forms.get(&stored_compact) {
            Some(handle) => handle.clone(),
            None => {
                let handle = self.ctx.store.insert(collection, stored)?;
                report.written += 1;
                self.stored_forms.insert(stored_compact, handle.clone());
                handle
            }
        };

        for &index in &owners {
            match self.optimizers[index].insert(object, &handle.id) {
                Ok(()) => report.mirrored += 1,
                Err(MirrorError::InvalidObjectForOptimizer { field, reason }) => {
                    tracing::debug!(object = %object_id, %field, %reason, "object not mirrored");
                    report.mirror_skipped += 1;
                }
                Err(other) => return Err(other.into()),
            }
        }
        self.inserted.insert(object_id, handle);
        Ok(())
    }

    fn queue_edges(&mut self, object_id: &str, object: &Document) {
        for (key, value) in object {
            if !is_reference_field(key) {
                continue;
            }
            let targets: Vec<&str> = match value {
                Value::String(target) => vec![target.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            for target in targets {
                self.pending_edges.push(PendingEdge {
                    from: object_id.to_string(),
                    to: target.to_string(),
                    label: key.clone(),
                });
            }
        }
    }

    /// Writes queued edges once both endpoints exist; all-or-nothing check
    /// before the first write.
    fn flush_edges(&mut self) -> Result<usize> {
        let pending = std::mem::take(&mut self.pending_edges);
        let mut edges = Vec::with_capacity(pending.len());
        for edge in pending {
            let key = (edge.from.clone(), edge.to.clone(), edge.label.clone());
            if self.written_edges.contains(&key) {
                continue;
            }
            let (Some(from), Some(to)) = (self.inserted.get(&edge.from), self.inserted.get(&edge.to))
            else {
                return Err(Error::DanglingReference {
                    from: edge.from,
                    to: edge.to,
                    label: edge.label,
                });
            };
            edges.push((
                key,
                Edge {
                    from: from.id.clone(),
                    to: to.id.clone(),
                    label: edge.label,
                },
            ));
        }
        if edges.is_empty() {
            return Ok(0);
        }

        let edge_collection = self.edge_collection_name();
        self.ctx
            .store
            .ensure_collection(&edge_collection, CollectionKind::Edge)?;
        let mut written = 0;
        for (key, edge) in edges {
            if !self.written_edges.insert(key) {
                continue;
            }
            self.ctx.store.insert_edge(&edge_collection, &edge)?;
            written += 1;
        }
        Ok(written)
    }

    fn track_type(&mut self, stix_type: &str) -> Result<()> {
        let types = self.inserted_types.get_or_insert_with(Vec::new);
        if types.iter().any(|t| t == stix_type) {
            return Ok(());
        }
        types.push(stix_type.to_string());
        tracing::debug!(feed = %self.name, stix_type, "new object type");
        self.update_record()
    }

    fn save(&mut self) -> Result<()> {
        self.ctx
            .store
            .ensure_collection(META_COLLECTION, CollectionKind::Document)?;
        let handle = self.ctx.store.insert(META_COLLECTION, self.record().to_document()?)?;
        tracing::debug!(feed = %self.name, record = %handle.id, "saved feed record");
        self.meta_handle = Some(handle);
        Ok(())
    }

    fn update_record(&self) -> Result<()> {
        if let Some(handle) = &self.meta_handle {
            self.ctx.store.replace(handle, self.record().to_document()?)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Drops the feed's collections, every metadata record of the feed and
    /// its mirror tables, and resets this instance.
    pub fn drop(&mut self) -> Result<()> {
        let collection = self.collection_name();
        self.ctx.store.drop_collection(&collection)?;
        self.ctx.store.drop_collection(&edge_collection_name(&collection))?;

        for (handle, record) in load_records(&self.ctx)? {
            if record.feed_name == self.name {
                self.ctx.store.remove(&handle)?;
            }
        }

        for optimizer in &mut self.optimizers {
            optimizer.drop_table()?;
        }
        if let Some(mirror) = &self.ctx.mirror {
            for table in mirror.tables()? {
                if is_mirror_table_of(&collection, &table) {
                    mirror.drop_table(&table)?;
                }
            }
        }

        self.has_been_emptied = true;
        self.meta_handle = None;
        self.seen_originals.clear();
        self.stored_forms.clear();
        self.inserted.clear();
        self.pending_edges.clear();
        self.written_edges.clear();
        tracing::info!(feed = %self.name, collection = %collection, "dropped feed");
        Ok(())
    }

    /// Deletes mirror rows whose primary document no longer exists.
    pub fn reconcile(&mut self) -> Result<usize> {
        let store = self.ctx.store.clone();
        let mut failure = None;
        let mut removed = 0;
        for optimizer in &mut self.optimizers {
            removed += optimizer.reconcile(&mut |doc_ref: &str| match store.get(doc_ref) {
                Ok(doc) => doc.is_some(),
                Err(err) => {
                    failure.get_or_insert(err);
                    true
                }
            })?;
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(removed),
        }
    }

    // ------------------------------------------------------------------------
    // Query support
    // ------------------------------------------------------------------------

    /// Answers a clause from an optimizer of this feed, if one covers it.
    pub(crate) fn answer(&mut self, clause: &Clause) -> Result<Option<DocumentSet>> {
        let equality = matches!(clause.op, CompareOp::Eq | CompareOp::Ne);
        let derived_source = match clause.path.as_slice() {
            [field] => self
                .ctx
                .modifiers
                .lookup(&clause.stix_type)
                .and_then(|m| m.derived_from(field)),
            _ => None,
        };

        for optimizer in &mut self.optimizers {
            if optimizer.stix_type() != clause.stix_type {
                continue;
            }
            // containment only ever answers a derived field, values as written
            // answer the source field
            let derived = optimizer.source_path() != optimizer.bound_path();
            let rows = if derived && optimizer.bound_path() == clause.path.as_slice() {
                if !equality {
                    continue;
                }
                optimizer.query(clause.op, &clause.literal)?
            } else if optimizer.source_path() == clause.path.as_slice() {
                optimizer.query_values(clause.op, &clause.literal)?
            } else if equality && derived_source.is_some_and(|s| optimizer.source_path() == [s]) {
                optimizer.query(clause.op, &clause.literal)?
            } else {
                continue;
            };

            let mut set = DocumentSet {
                source: clause.field_path(),
                ..DocumentSet::default()
            };
            for row in rows {
                set.documents.insert(row.doc_ref);
                set.objects.insert(row.object_id);
            }
            tracing::debug!(
                feed = %self.name,
                field = %set.source,
                table = optimizer.table_name(),
                documents = set.documents.len(),
                "clause answered from mirror"
            );
            return Ok(Some(set));
        }
        Ok(None)
    }

    /// Expands a primary document into the objects stored in it.
    ///
    /// Documents stripped by optimizers are re-joined with their mirror rows,
    /// one object per row; other documents are returned unchanged.
    pub(crate) fn rejoin(&mut self, doc: Document) -> Result<Vec<Document>> {
        let fields: Vec<String> = match doc.get(MIRROR_MARKER) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => return Ok(vec![doc]),
        };
        let Some(doc_ref) = doc.get("_id").and_then(Value::as_str).map(str::to_string) else {
            return Ok(vec![doc]);
        };
        let mut owners: Vec<usize> = fields
            .iter()
            .filter_map(|field| self.optimizers.iter().position(|o| o.field() == field))
            .collect();
        if owners.is_empty() {
            tracing::warn!(feed = %self.name, document = %doc_ref, "no optimizer for mirrored document");
            return Ok(vec![doc]);
        }

        let first = owners.remove(0);
        let rows = self.optimizers[first].rows_for_document(&doc_ref)?;
        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object = doc.clone();
            object.insert("id".to_string(), Value::String(row.object_id.clone()));
            self.optimizers[first].restore(&mut object, row.value);
            for &other in &owners {
                if let Some(value) = self.optimizers[other].value_for(&doc_ref, &row.object_id)? {
                    self.optimizers[other].restore(&mut object, value);
                }
            }
            objects.push(self.ctx.modifiers.augment(object));
        }
        Ok(objects)
    }
}

/// The newest instance, merged with the older instances of its collection.
fn merge_instances(
    instances: Vec<(DocumentHandle, FeedRecord)>,
) -> Result<Option<(DocumentHandle, FeedRecord)>> {
    let mut newest: Option<usize> = None;
    for (index, (_, record)) in instances.iter().enumerate() {
        if newest.map_or(true, |n| record.date > instances[n].1.date) {
            newest = Some(index);
        }
    }
    let Some(newest) = newest else {
        return Ok(None);
    };

    let (handle, mut merged) = instances[newest].clone();
    let collection = merged.collection_name()?;
    for (index, (_, record)) in instances.iter().enumerate() {
        if index != newest && record.collection_name()? == collection {
            merged.absorb(record);
        }
    }
    Ok(Some((handle, merged)))
}

/// `<collection>_<32 hex digits>`
fn is_mirror_table_of(collection: &str, table: &str) -> bool {
    table
        .strip_prefix(collection)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|suffix| suffix.len() == 32 && suffix.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Reads a derived field's value from its source field.
fn bind_source(ctx: &EngineContext, optimizer: Optimizer) -> Optimizer {
    let source = match optimizer.bound_path() {
        [field] => ctx
            .modifiers
            .lookup(optimizer.stix_type())
            .and_then(|m| m.derived_from(field)),
        _ => None,
    };
    match source {
        Some(source) => optimizer.with_source_field(source),
        None => optimizer,
    }
}

fn validate_object(object: &Document) -> Result<(&str, &str)> {
    let stix_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidObject("object has no string `type`".to_string()))?;
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidObject(format!("`{stix_type}` object has no string `id`")))?;
    Ok((stix_type, id))
}
