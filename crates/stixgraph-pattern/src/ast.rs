//! Filter AST and its AQL rendering.
//!
//! ```text
//!   Filter::And
//!   ├── Filter::Group
//!   │   └── Filter::Comparison   record.value == "mushroom"
//!   └── Filter::Comparison       record.type == "ipv4-addr"
//!
//!   renders as: (record.value == "mushroom") AND record.type == "ipv4-addr"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Operators and literals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
}

impl CompareOp {
    /// Operator as written in AQL.
    pub fn as_aql(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
        }
    }

    /// Operator to use when the operands are swapped (`5 < x` is `x > 5`).
    pub fn mirrored(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }

    pub fn is_equality(self) -> bool {
        self == CompareOp::Eq
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_aql())
    }
}

/// A literal operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    /// Quoted string, kept as written between its quotes.
    Str { quote: char, raw: String },
    /// Bare numeric token, kept verbatim.
    Number(String),
    Bool(bool),
    Null,
}

impl Literal {
    /// A double-quoted string literal for `text`, escaping as needed.
    pub fn string(text: &str) -> Self {
        let mut raw = String::with_capacity(text.len());
        for c in text.chars() {
            if c == '"' || c == '\\' {
                raw.push('\\');
            }
            raw.push(c);
        }
        Literal::Str { quote: '"', raw }
    }

    pub fn number(value: impl fmt::Display) -> Self {
        Literal::Number(value.to_string())
    }

    /// The string content with backslash escapes resolved.
    pub fn text(&self) -> Option<String> {
        match self {
            Literal::Str { raw, .. } => {
                let mut out = String::with_capacity(raw.len());
                let mut chars = raw.chars();
                while let Some(c) = chars.next() {
                    if c == '\\' {
                        if let Some(next) = chars.next() {
                            out.push(next);
                        }
                    } else {
                        out.push(c);
                    }
                }
                Some(out)
            }
            _ => None,
        }
    }

    /// JSON value the literal denotes.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Literal::Str { .. } => Value::String(self.text().unwrap_or_default()),
            Literal::Number(raw) => {
                if let Ok(int) = raw.parse::<i64>() {
                    Value::from(int)
                } else {
                    raw.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Null => Value::Null,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str { quote, raw } => write!(f, "{quote}{raw}{quote}"),
            Literal::Number(raw) => f.write_str(raw),
            Literal::Bool(true) => f.write_str("true"),
            Literal::Bool(false) => f.write_str("false"),
            Literal::Null => f.write_str("null"),
        }
    }
}

// ============================================================================
// Clauses
// ============================================================================

/// One `type:field OP literal` comparison as written in a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clause {
    pub stix_type: String,
    /// Path below the object, e.g. `["hashes", "MD5"]`.
    pub path: Vec<String>,
    pub op: CompareOp,
    pub literal: Literal,
}

impl Clause {
    /// The field path in `type:field:sub` form.
    pub fn field_path(&self) -> String {
        let mut out = self.stix_type.clone();
        for segment in &self.path {
            out.push(':');
            out.push_str(segment);
        }
        out
    }

    /// Generic translation: `record.<path> <op> <literal>`.
    pub fn to_comparison(&self) -> Comparison {
        Comparison {
            path: self.path.clone(),
            op: self.op,
            literal: self.literal.clone(),
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// `record.<path> <op> <literal>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub path: Vec<String>,
    pub op: CompareOp,
    pub literal: Literal,
}

impl Comparison {
    pub fn new(path: &[&str], op: CompareOp, literal: Literal) -> Self {
        Self {
            path: path.iter().map(|s| s.to_string()).collect(),
            op,
            literal,
        }
    }

    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }
}

/// A clause answered outside the primary store: the primary documents that
/// matched, and the objects behind them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSet {
    /// Field path that was answered, e.g. `ipv4-addr:x_ip`.
    pub source: String,
    /// Primary store `_id`s.
    pub documents: BTreeSet<String>,
    /// Object `id`s.
    pub objects: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Comparison(Comparison),
    /// A bracketed group from the pattern.
    Group(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    DocumentSet(DocumentSet),
}

impl Filter {
    pub fn comparison(path: &[&str], op: CompareOp, literal: Literal) -> Self {
        Filter::Comparison(Comparison::new(path, op, literal))
    }

    /// Wraps in a group; a group directly inside a group collapses.
    pub fn group(inner: Filter) -> Self {
        match inner {
            Filter::Group(_) => inner,
            other => Filter::Group(Box::new(other)),
        }
    }

    pub fn and(mut children: Vec<Filter>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Filter::And(children)
        }
    }

    pub fn or(mut children: Vec<Filter>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Filter::Or(children)
        }
    }

    /// Renders the filter in AQL with `var` as the document variable.
    pub fn to_aql(&self, var: &str) -> String {
        let mut out = String::new();
        self.render(var, &mut out, false);
        out
    }

    fn render(&self, var: &str, out: &mut String, inside_and: bool) {
        match self {
            Filter::Comparison(cmp) => {
                out.push_str(var);
                for segment in &cmp.path {
                    out.push('.');
                    push_attribute(out, segment);
                }
                out.push(' ');
                out.push_str(cmp.op.as_aql());
                out.push(' ');
                out.push_str(&cmp.literal.to_string());
            }
            Filter::Group(inner) => {
                out.push('(');
                inner.render(var, out, false);
                out.push(')');
            }
            Filter::And(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" AND ");
                    }
                    child.render(var, out, true);
                }
            }
            Filter::Or(children) => {
                if inside_and {
                    out.push('(');
                }
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" OR ");
                    }
                    child.render(var, out, false);
                }
                if inside_and {
                    out.push(')');
                }
            }
            Filter::DocumentSet(set) => {
                out.push_str(var);
                out.push_str("._id IN [");
                for (i, id) in set.documents.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&serde_json::Value::String(id.clone()).to_string());
                }
                out.push(']');
            }
        }
    }

    /// Visits every comparison in the tree.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut found = Vec::new();
        self.collect_comparisons(&mut found);
        found
    }

    fn collect_comparisons<'a>(&'a self, found: &mut Vec<&'a Comparison>) {
        match self {
            Filter::Comparison(cmp) => found.push(cmp),
            Filter::Group(inner) => inner.collect_comparisons(found),
            Filter::And(children) | Filter::Or(children) => {
                for child in children {
                    child.collect_comparisons(found);
                }
            }
            Filter::DocumentSet(_) => {}
        }
    }

    /// Dotted paths worth a persistent index: every compared field, or
    /// nothing at all when any comparison is not an equality.
    pub fn indexable_fields(&self) -> Vec<String> {
        let comparisons = self.comparisons();
        if comparisons.iter().any(|c| !c.op.is_equality()) {
            return Vec::new();
        }
        let mut fields: Vec<String> = Vec::new();
        for cmp in comparisons {
            let path = cmp.dotted_path();
            if !fields.contains(&path) {
                fields.push(path);
            }
        }
        fields
    }
}

/// Attribute names that are not plain identifiers are backtick-quoted.
fn push_attribute(out: &mut String, name: &str) {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        out.push_str(name);
    } else {
        out.push('`');
        out.push_str(name);
        out.push('`');
    }
}
