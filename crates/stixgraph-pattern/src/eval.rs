//! In-process evaluation of filters against JSON records.
//!
//! Comparison follows AQL: a missing attribute reads as `null`, values of
//! different kinds order as `null < bool < number < string < array < object`.

use crate::ast::{CompareOp, Comparison, DocumentSet, Filter};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// What a [`DocumentSet`] node is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Stored documents, matched by `_id`.
    Document,
    /// Re-joined objects, matched by `id`.
    Object,
}

impl Filter {
    /// Evaluates the filter against a stored document.
    pub fn matches(&self, record: &Value) -> bool {
        record
            .as_object()
            .is_some_and(|map| self.eval(map, Scope::Document))
    }

    /// Same as [`Filter::matches`] without wrapping the map in a `Value`.
    pub fn matches_map(&self, record: &Map<String, Value>) -> bool {
        self.eval(record, Scope::Document)
    }

    /// Evaluates the filter against an object re-joined from a mirror.
    pub fn matches_object(&self, object: &Map<String, Value>) -> bool {
        self.eval(object, Scope::Object)
    }

    fn eval(&self, record: &Map<String, Value>, scope: Scope) -> bool {
        match self {
            Filter::Comparison(cmp) => eval_comparison(cmp, record),
            Filter::Group(inner) => inner.eval(record, scope),
            Filter::And(children) => children.iter().all(|c| c.eval(record, scope)),
            Filter::Or(children) => children.iter().any(|c| c.eval(record, scope)),
            Filter::DocumentSet(set) => eval_document_set(set, record, scope),
        }
    }
}

fn eval_document_set(set: &DocumentSet, record: &Map<String, Value>, scope: Scope) -> bool {
    let (field, members) = match scope {
        Scope::Document => ("_id", &set.documents),
        Scope::Object => ("id", &set.objects),
    };
    record
        .get(field)
        .and_then(Value::as_str)
        .is_some_and(|id| members.contains(id))
}

fn eval_comparison(cmp: &Comparison, record: &Map<String, Value>) -> bool {
    let null = Value::Null;
    let mut segments = cmp.path.iter();
    let mut current = match segments.next() {
        Some(first) => record.get(first.as_str()).unwrap_or(&null),
        None => &null,
    };
    for segment in segments {
        current = current.get(segment.as_str()).unwrap_or(&null);
    }
    let expected = cmp.literal.to_json();

    match cmp.op {
        CompareOp::Eq => compare_values(current, &expected) == Ordering::Equal,
        CompareOp::Ne => compare_values(current, &expected) != Ordering::Equal,
        CompareOp::Lt => compare_values(current, &expected) == Ordering::Less,
        CompareOp::Le => compare_values(current, &expected) != Ordering::Greater,
        CompareOp::Gt => compare_values(current, &expected) == Ordering::Greater,
        CompareOp::Ge => compare_values(current, &expected) != Ordering::Less,
        CompareOp::Like => like(&as_like_text(current), &as_like_text(&expected)),
        CompareOp::NotLike => !like(&as_like_text(current), &as_like_text(&expected)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut keys: Vec<&String> = x.keys().chain(y.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let ord = compare_values(
                    x.get(key).unwrap_or(&Value::Null),
                    y.get(key).unwrap_or(&Value::Null),
                );
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        _ => Ordering::Equal,
    }
}

fn compare_numbers(x: &serde_json::Number, y: &serde_json::Number) -> Ordering {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a.cmp(&b);
    }
    let a = x.as_f64().unwrap_or(f64::NAN);
    let b = y.as_f64().unwrap_or(f64::NAN);
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn as_like_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LikeToken {
    AnySequence,
    AnyChar,
    Char(char),
}

/// AQL `LIKE`: `%` matches any sequence, `_` one character, `\` escapes.
pub fn like(text: &str, pattern: &str) -> bool {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => LikeToken::AnySequence,
            '_' => LikeToken::AnyChar,
            '\\' => LikeToken::Char(chars.next().unwrap_or('\\')),
            other => LikeToken::Char(other),
        });
    }

    let text: Vec<char> = text.chars().collect();
    // reachable[j]: the first i tokens can match text[..j]
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for token in tokens {
        let mut next = vec![false; text.len() + 1];
        match token {
            LikeToken::AnySequence => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= reachable[j];
                    next[j] = seen;
                }
            }
            LikeToken::AnyChar => {
                for j in 0..text.len() {
                    next[j + 1] = reachable[j];
                }
            }
            LikeToken::Char(c) => {
                for j in 0..text.len() {
                    next[j + 1] = reachable[j] && text[j] == c;
                }
            }
        }
        reachable = next;
    }
    reachable[text.len()]
}
