//! Retention: removal of expired feeds.

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use stixgraph_mirror::Optimizer;

use crate::addressing::edge_collection_name;
use crate::context::EngineContext;
use crate::error::Result;
use crate::feed::load_records;

/// What one [`vacuum`] pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    pub records: usize,
    /// Object and edge collections.
    pub collections: usize,
    pub tables: usize,
}

/// Deletes every feed whose vacuum date is not after `now`: its metadata
/// record, object and edge collections, and mirror tables.
///
/// Storage still referenced by a live record (a grouped feed's shared
/// collection) is kept, and the newest live record of that collection takes
/// over the expired instance's object types and optimizers. Already missing
/// collections and tables are skipped.
pub fn vacuum(ctx: &EngineContext, now: DateTime<Utc>) -> Result<VacuumReport> {
    let cutoff = now.timestamp();
    let (expired, mut live): (Vec<_>, Vec<_>) = load_records(ctx)?
        .into_iter()
        .partition(|(_, record)| record.vacuum_date.is_some_and(|date| date <= cutoff));

    // newest live record per collection
    let mut live_collections: AHashMap<String, usize> = AHashMap::new();
    for (index, (_, record)) in live.iter().enumerate() {
        let Ok(collection) = record.collection_name() else {
            continue;
        };
        let newer = live_collections
            .get(&collection)
            .map_or(true, |&current| record.date > live[current].1.date);
        if newer {
            live_collections.insert(collection, index);
        }
    }
    let mut inherited: AHashSet<usize> = AHashSet::new();

    let mut report = VacuumReport::default();
    let mut dropped: AHashSet<String> = AHashSet::new();
    for (handle, record) in expired {
        if ctx.store.remove(&handle)? {
            report.records += 1;
        }
        let Some(date) = DateTime::from_timestamp(record.date, 0) else {
            tracing::warn!(feed = %record.feed_name, date = record.date, "record date out of range");
            continue;
        };
        let collection = record.storage_paradigm.collection_name(&record.feed_name, date);
        if let Some(&heir) = live_collections.get(&collection) {
            if live[heir].1.absorb(&record) {
                inherited.insert(heir);
            }
            continue;
        }
        if !dropped.insert(collection.clone()) {
            continue;
        }

        for name in [collection.clone(), edge_collection_name(&collection)] {
            if ctx.store.drop_collection(&name)? {
                report.collections += 1;
            }
        }

        if record.optimizers.is_empty() {
            continue;
        }
        let Some(mirror) = &ctx.mirror else {
            tracing::warn!(
                feed = %record.feed_name,
                tables = record.optimizers.len(),
                "no mirror configured, leaving optimizer tables"
            );
            continue;
        };
        for descriptor in &record.optimizers {
            let mut optimizer = Optimizer::from_descriptor(mirror.clone(), descriptor, &collection)?;
            if optimizer.drop_table()? {
                report.tables += 1;
            }
        }
        tracing::info!(feed = %record.feed_name, collection = %collection, "vacuumed feed");
    }

    for heir in inherited {
        let (handle, record) = &live[heir];
        ctx.store.replace(handle, record.to_document()?)?;
        tracing::debug!(
            feed = %record.feed_name,
            record = %handle.id,
            "live record took over expired instance"
        );
    }

    tracing::info!(
        records = report.records,
        collections = report.collections,
        tables = report.tables,
        "vacuum complete"
    );
    Ok(report)
}
