//! Stixgraph pattern compiler
//!
//! Compiles the bracketed comparison language used to select STIX objects
//! into a filter over stored documents:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  [ipv4-addr:value = "mushroom" AND ipv4-addr:x_ip = '1.2.3.4']   │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │ lexer: balance, tokens, type
//!                                ▼
//!                      ┌───────────────────┐
//!                      │   ParsedPattern   │  Expr tree of Clauses
//!                      └─────────┬─────────┘
//!                                │ resolver / modifiers / generic
//!                                ▼
//!                      ┌───────────────────┐
//!                      │  CompiledPattern  │  Filter AST
//!                      └────┬─────────┬────┘
//!                           │         │
//!                 to_aql()  ▼         ▼  matches()
//!                   AQL FILTER text   in-process evaluation
//! ```
//!
//! ## Grammar
//!
//! - `[` `]` and `(` `)` group
//! - `AND` binds tighter than `OR`
//! - comparisons are `type:field(:sub)* OP literal`, either way round
//! - `OP` is one of `=`, `!=`, `<`, `<=`, `>`, `>=`, `LIKE`, `NOT LIKE`
//! - literals are quoted strings, numbers, `true`, `false` or `null`
//!
//! Every field path in one pattern must share the same object type; the
//! compiled filter always ends with `AND record.type == "<type>"`.

pub mod ast;
pub mod compiler;
pub mod cosmetic;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod modifier;

pub use ast::{Clause, CompareOp, Comparison, DocumentSet, Filter, Literal};
pub use compiler::{
    compile, compile_clause, compile_type, ClauseResolver, CompiledPattern, Expr, NoResolver,
    ParsedPattern,
};
pub use error::{PatternError, Result};
pub use modifier::{ModifierRegistry, StixModifier};
