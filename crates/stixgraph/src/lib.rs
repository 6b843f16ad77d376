//! Stixgraph engine
//!
//! Feeds of STIX objects are ingested into a document/graph store and
//! queried with STIX patterns:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        EngineContext                         │
//! │        store ── mirror ── modifiers ── configuration         │
//! └──────┬──────────────────┬─────────────────────┬──────────────┘
//!        │                  │                     │
//! ┌──────▼──────┐   ┌───────▼───────┐   ┌─────────▼─────────┐
//! │    Feed     │   │    Request    │   │ vacuum / snapshot │
//! │ insert,drop │   │ fan-out, merge│   │   lifecycle       │
//! └──────┬──────┘   └───────┬───────┘   └───────────────────┘
//!        │                  │
//!   addressing          pattern compiler (stixgraph-pattern)
//!   identity            mirror tables (stixgraph-mirror)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use stixgraph::{EngineContext, Feed, FeedOptions, Request, RequestOptions};
//!
//! # async fn run(objects: Vec<stixgraph::Document>) -> stixgraph::Result<()> {
//! let ctx = EngineContext::in_memory()?;
//! let mut feed = Feed::new(&ctx, "abuse", FeedOptions::default().tags(["net"]))?;
//! feed.insert(&objects)?;
//!
//! let _results = Request::new(&ctx, chrono::Utc::now())
//!     .request("[ipv4-addr:x_ip = '97.8.8.8']", RequestOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod addressing;
pub mod config;
pub mod context;
pub mod error;
pub mod feed;
pub mod identity;
pub mod merge;
pub mod modifiers;
pub mod request;
pub mod snapshot;
pub mod telemetry;
pub mod vacuum;

pub use addressing::{edge_collection_name, StorageParadigm, META_COLLECTION};
pub use config::{EngineConfig, MirrorConfig, PrimaryStoreConfig};
pub use context::EngineContext;
pub use error::{Error, Result};
pub use feed::{Feed, FeedOptions, FeedRecord, InsertReport};
pub use identity::{assign_content_ids, content_id};
pub use merge::{merge_results, mergeable};
pub use modifiers::standard_modifiers;
pub use request::{Request, RequestOptions};
pub use snapshot::{snapshot, snapshot_restore};
pub use stixgraph_store::Document;
pub use telemetry::init_tracing;
pub use vacuum::{vacuum, VacuumReport};
