//! Integration tests for the complete stixgraph pipeline
//!
//! These tests drive the engine end to end across crates:
//! - Feed ingestion → primary store + relational mirror
//! - Pattern compilation → per-feed queries → traversal → merge
//! - Vacuum and snapshot/restore
//!
//! Run with: cargo test --test integration_tests

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use stixgraph::{
    assign_content_ids, snapshot, snapshot_restore, vacuum, EngineConfig, EngineContext, Feed,
    FeedOptions, MirrorConfig, Request, RequestOptions, StorageParadigm,
};
use stixgraph_pattern::compile;
use stixgraph_store::Document;
use tempfile::tempdir;

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

const INSERTED: i64 = 1_700_000_000;

fn subnet() -> Document {
    doc(json!({
        "type": "ipv4-addr",
        "id": "ipv4-addr--0b1ce7a5-3f4b-4b39-9d8d-6d0a8b1d2f11",
        "value": "97.8.8.0/24",
    }))
}

// ============================================================================
// Subnet containment, with and without a mirror
// ============================================================================

async fn query_subnet(ctx: &EngineContext) -> Vec<Document> {
    Request::new(ctx, at(INSERTED + 60))
        .request(
            "[ipv4-addr:x_ip = '97.8.8.8']",
            RequestOptions::default().tags(["net"]),
        )
        .await
        .expect("request should succeed")
}

#[tokio::test]
async fn test_subnet_query_via_primary_store() {
    let ctx = EngineContext::in_memory().unwrap();
    Feed::new(&ctx, "subnets", FeedOptions::default().date(at(INSERTED)).tags(["net"]))
        .unwrap()
        .insert(&[subnet()])
        .unwrap();

    let results = query_subnet(&ctx).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["value"], "97.8.8.0/24");
}

#[tokio::test]
async fn test_subnet_query_via_optimizer() {
    let ctx = EngineContext::in_memory().unwrap();
    let mut feed =
        Feed::new(&ctx, "subnets", FeedOptions::default().date(at(INSERTED)).tags(["net"]))
            .unwrap();
    feed.add_optimizer("ipv4-addr:x_ip").unwrap();
    feed.insert(&[subnet()]).unwrap();

    let results = query_subnet(&ctx).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["value"], "97.8.8.0/24");
    assert_eq!(results[0]["id"], subnet()["id"]);
}

#[test]
fn test_compiled_subnet_filter() {
    let compiled = compile(
        "[ipv4-addr:x_ip = '97.8.8.8']",
        &stixgraph::standard_modifiers(),
    )
    .unwrap();
    assert_eq!(
        compiled.to_aql("record"),
        "(record.x_ip == 1627916296 OR (record.x_ip.network_addr <= 1627916296 \
         AND record.x_ip.broadcast_addr >= 1627916296)) AND record.type == \"ipv4-addr\""
    );
}

// ============================================================================
// Content identity across repeated ingests
// ============================================================================

#[tokio::test]
async fn test_repeated_ingest_collapses_on_content_ids() {
    let ctx = EngineContext::in_memory().unwrap();
    let batch = |suffix: &str| {
        assign_content_ids(vec![
            doc(json!({
                "type": "identity", "id": format!("identity--{suffix}"), "name": "ACME",
                "created": format!("2024-01-0{suffix}T00:00:00Z"),
            })),
            doc(json!({
                "type": "relationship", "id": format!("relationship--{suffix}"),
                "relationship_type": "related-to",
                "source_ref": format!("identity--{suffix}"),
                "target_ref": format!("identity--{suffix}"),
            })),
        ])
        .unwrap()
    };
    let first = batch("1");
    let second = batch("2");
    assert_eq!(first[0]["id"], second[0]["id"]);
    assert_eq!(second[1]["source_ref"], second[0]["id"]);

    let mut feed = Feed::new(
        &ctx,
        "people",
        FeedOptions::default()
            .paradigm(StorageParadigm::Grouped)
            .date(at(INSERTED)),
    )
    .unwrap();
    feed.insert(&first).unwrap();
    feed.insert(&second).unwrap();

    let results = Request::new(&ctx, at(INSERTED + 60))
        .request("[identity:name = 'ACME']", RequestOptions::default().max_depth(1))
        .await
        .unwrap();
    let identities = results
        .iter()
        .filter(|r| r["type"] == "identity")
        .count();
    assert_eq!(identities, 2, "identities differ in `created` so both are kept");
    assert!(results.iter().all(|r| r["type"] != "identity" || r["id"] == first[0]["id"]));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_static_feed_vacuum_and_snapshot() {
    let dir = tempdir().unwrap();
    let mirror_path = dir.path().join("live-mirror.sqlite3");
    let config = EngineConfig {
        mirror: Some(MirrorConfig {
            path: Some(mirror_path),
            commit_every: 2,
        }),
        ..EngineConfig::default()
    };
    let ctx = EngineContext::open(config).unwrap();

    let options = || {
        FeedOptions::default()
            .paradigm(StorageParadigm::Static)
            .date(at(INSERTED))
            .vacuum_date(at(INSERTED + 86_400))
            .tags(["net"])
    };
    let mut first = Feed::new(&ctx, "blocklist", options()).unwrap();
    first.add_optimizer("ipv4-addr:x_ip").unwrap();
    first
        .insert(&[
            subnet(),
            doc(json!({"type": "ipv4-addr", "id": "ipv4-addr--2", "value": "10.0.0.0/8"})),
        ])
        .unwrap();

    let mut second = Feed::new(&ctx, "blocklist", options()).unwrap();
    second.add_optimizer("ipv4-addr:x_ip").unwrap();
    second.insert(&[subnet()]).unwrap();
    assert_eq!(query_subnet(&ctx).await.len(), 1);

    let snapshot_dir = dir.path().join("snapshot");
    snapshot(&ctx, &snapshot_dir).unwrap();

    let report = vacuum(&ctx, at(INSERTED + 2 * 86_400)).unwrap();
    assert_eq!(report.records, 1);
    assert!(query_subnet(&ctx).await.is_empty());

    let restored = EngineContext::in_memory().unwrap();
    snapshot_restore(&restored, &snapshot_dir).unwrap();
    assert_eq!(query_subnet(&restored).await.len(), 1);
}
