//! Pattern requests across feeds.
//!
//! ```text
//!   pattern ──► type ──► last feeds on/before the reference date
//!                           │ tags ⊇ requested, type inserted
//!            ┌──────────────┼──────────────┐
//!            ▼              ▼              ▼      one blocking task per feed
//!      mirror answers → compile → query → traverse → tag
//!            └──────────────┼──────────────┘
//!                           ▼
//!                      merge_results
//! ```

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use stixgraph_pattern::{
    compile_clause, compile_type, Clause, ClauseResolver, Filter, ParsedPattern,
};
use stixgraph_store::{strip_internal, Document, TraversalPolicy};

use crate::context::EngineContext;
use crate::error::Result;
use crate::feed::{Feed, MIRROR_MARKER};
use crate::merge::merge_results;

/// Field naming the feed a result came from.
pub const FEED_FIELD: &str = "x_feed";

/// Field carrying the tags of the feed a result came from.
pub const TAGS_FIELD: &str = "x_tags";

/// Per-request overrides of the configured request defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Only feeds carrying all of these tags are queried.
    pub tags: Vec<String>,
    pub max_depth: Option<u32>,
    /// Result cap per feed.
    pub limit: Option<usize>,
    pub create_index: Option<bool>,
}

impl RequestOptions {
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn create_index(mut self, create: bool) -> Self {
        self.create_index = Some(create);
        self
    }
}

/// Settings one feed task runs with.
#[derive(Debug, Clone, Copy)]
struct FeedQuery {
    policy: TraversalPolicy,
    limit: Option<usize>,
    create_index: bool,
}

#[derive(Debug, Clone)]
pub struct Request {
    ctx: EngineContext,
    reference_date: DateTime<Utc>,
}

impl Request {
    pub fn new(ctx: &EngineContext, reference_date: DateTime<Utc>) -> Self {
        Self {
            ctx: ctx.clone(),
            reference_date,
        }
    }

    /// Feeds the pattern's type is looked up in.
    pub fn candidate_feeds(&self, stix_type: &str, tags: &[String]) -> Result<Vec<Feed>> {
        let feeds = Feed::last_feeds(&self.ctx, self.reference_date)?;
        Ok(feeds
            .into_iter()
            .filter(|feed| tags.iter().all(|tag| feed.tags().contains(tag)))
            .filter(|feed| {
                feed.inserted_types()
                    .map_or(true, |types| types.iter().any(|t| t == stix_type))
            })
            .collect())
    }

    /// Runs `pattern` against every candidate feed and merges the results.
    pub async fn request(&self, pattern: &str, options: RequestOptions) -> Result<Vec<Document>> {
        let stix_type = compile_type(pattern)?;
        let parsed = Arc::new(ParsedPattern::parse(pattern)?);
        let defaults = &self.ctx.config.request;
        let query = FeedQuery {
            policy: TraversalPolicy::new(options.max_depth.unwrap_or(defaults.max_depth)),
            limit: options.limit.or(defaults.limit),
            create_index: options.create_index.unwrap_or(defaults.create_index),
        };

        let ctx = self.ctx.clone();
        let tags = options.tags.clone();
        let lookup_type = stix_type.clone();
        let reference_date = self.reference_date;
        let feeds = tokio::task::spawn_blocking(move || {
            Request::new(&ctx, reference_date).candidate_feeds(&lookup_type, &tags)
        })
        .await??;

        tracing::info!(
            stix_type = %stix_type,
            feeds = feeds.len(),
            max_depth = query.policy.max_depth(),
            "dispatching request"
        );

        let handles: Vec<_> = feeds
            .into_iter()
            .map(|feed| {
                let parsed = Arc::clone(&parsed);
                tokio::task::spawn_blocking(move || query_feed(feed, &parsed, query))
            })
            .collect();

        let mut records = Vec::new();
        for handle in handles {
            records.extend(handle.await??);
        }
        let merged = merge_results(records);
        tracing::debug!(stix_type = %stix_type, results = merged.len(), "request complete");
        Ok(merged)
    }
}

/// Filters answered from a feed's mirror tables.
struct MirrorAnswers(AHashMap<Clause, Filter>);

impl ClauseResolver for MirrorAnswers {
    fn resolve(&self, clause: &Clause) -> Option<Filter> {
        self.0.get(clause).cloned()
    }
}

fn query_feed(mut feed: Feed, parsed: &ParsedPattern, query: FeedQuery) -> Result<Vec<Document>> {
    let ctx = feed.context().clone();
    let collection = feed.collection_name();
    let edge_collection = feed.edge_collection_name();

    let mut answers = AHashMap::new();
    for clause in parsed.clauses() {
        if answers.contains_key(clause) {
            continue;
        }
        // documents the optimizer never saw still match the plain comparison
        if let Some(set) = feed.answer(clause)? {
            let plain = compile_clause(clause, &ctx.modifiers)?;
            let filter = Filter::group(Filter::or(vec![Filter::DocumentSet(set), plain]));
            answers.insert(clause.clone(), filter);
        }
    }
    let compiled = parsed.compile(&ctx.modifiers, &MirrorAnswers(answers))?;

    if !ctx.store.has_collection(&collection)? {
        tracing::debug!(feed = feed.name(), collection = %collection, "feed collection is missing");
        return Ok(Vec::new());
    }
    let matches = ctx.store.query(&collection, &compiled.filter, query.limit)?;

    if query.create_index {
        let fields = compiled.filter.indexable_fields();
        if !fields.is_empty() {
            ctx.store.ensure_persistent_index(&collection, &fields)?;
        }
    }

    let feed_name = Value::String(feed.name().to_string());
    let feed_tags = Value::Array(feed.tags().iter().cloned().map(Value::String).collect());
    let mut results = Vec::new();
    for doc in matches {
        let Some(start) = doc.get("_id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let mut reached = ctx.store.traverse(&start, &edge_collection, query.policy)?;
        if reached.is_empty() {
            reached.push(doc);
        }

        for (position, vertex) in reached.into_iter().enumerate() {
            let mirrored = vertex.contains_key(MIRROR_MARKER);
            for object in feed.rejoin(vertex)? {
                // only the objects that matched are returned for the start document
                if position == 0 && mirrored && !compiled.filter.matches_object(&object) {
                    continue;
                }
                let mut object = strip_internal(object);
                object.insert(FEED_FIELD.to_string(), feed_name.clone());
                object.insert(TAGS_FIELD.to_string(), feed_tags.clone());
                results.push(object);
            }
        }
    }

    tracing::debug!(
        feed = feed.name(),
        collection = %collection,
        matched = results.len(),
        "feed queried"
    );
    Ok(results)
}
