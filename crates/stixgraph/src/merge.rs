//! Merging query results that share an object id.
//!
//! Records are folded first-fit: each one merges into the first earlier
//! record with the same `id` it is compatible with, or is kept on its own.
//! Two records are compatible when every field they share is equal or is a
//! list on both sides; lists are unioned. A scalar conflict keeps both
//! records, since their provenance is ambiguous.

use serde_json::Value;
use stixgraph_store::Document;

/// Whether `a` and `b` can be combined into one record.
pub fn mergeable(a: &Document, b: &Document) -> bool {
    if a.get("id") != b.get("id") {
        return false;
    }
    a.iter().all(|(key, left)| match (left, b.get(key)) {
        (_, None) => true,
        (Value::Array(_), Some(Value::Array(_))) => true,
        (left, Some(right)) => left == right,
    })
}

/// Folds `other` into `into`; callers check [`mergeable`] first.
fn merge_into(into: &mut Document, other: Document) {
    for (key, value) in other {
        match into.get_mut(&key) {
            Some(Value::Array(items)) => {
                if let Value::Array(extra) = value {
                    for item in extra {
                        if !items.contains(&item) {
                            items.push(item);
                        }
                    }
                }
            }
            Some(_) => {}
            None => {
                into.insert(key, value);
            }
        }
    }
}

/// Merges records sharing an `id`, keeping the order of first appearance.
pub fn merge_results(records: Vec<Document>) -> Vec<Document> {
    let mut merged: Vec<Document> = Vec::with_capacity(records.len());
    for record in records {
        if record.get("id").is_none() {
            merged.push(record);
            continue;
        }
        match merged.iter_mut().find(|existing| mergeable(existing, &record)) {
            Some(existing) => merge_into(existing, record),
            None => merged.push(record),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_lists_are_unioned() {
        let out = merge_results(vec![
            doc(json!({"id": "a", "type": "t", "x_tags": ["net"], "x_feed": ["f1"]})),
            doc(json!({"id": "a", "type": "t", "x_tags": ["net", "dns"], "extra": 1})),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["x_tags"], json!(["net", "dns"]));
        assert_eq!(out[0]["extra"], 1);
    }

    #[test]
    fn test_scalar_conflict_keeps_both() {
        let out = merge_results(vec![
            doc(json!({"id": "a", "value": "1.1.1.1"})),
            doc(json!({"id": "a", "value": "2.2.2.2"})),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_list_against_scalar_conflicts() {
        let a = doc(json!({"id": "a", "labels": ["x"]}));
        let b = doc(json!({"id": "a", "labels": "x"}));
        assert!(!mergeable(&a, &b));
    }

    #[test]
    fn test_third_record_merges_into_first_compatible() {
        let out = merge_results(vec![
            doc(json!({"id": "a", "value": 1})),
            doc(json!({"id": "a", "value": 2})),
            doc(json!({"id": "a", "value": 2, "refs": ["r"]})),
            doc(json!({"id": "b", "value": 1})),
        ]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1]["refs"], json!(["r"]));
        assert_eq!(out[2]["id"], "b");
    }
}
