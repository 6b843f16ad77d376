//! Address modifiers.
//!
//! Address objects are stored with a derived `x_ip` field, an integer for a
//! single address or `{network_addr, broadcast_addr}` for a network, so that
//! `x_ip = '<addr>'` can match both the address itself and every network
//! containing it:
//!
//! ```text
//!   record.x_ip == N
//!     OR (record.x_ip.network_addr <= N AND record.x_ip.broadcast_addr >= N)
//! ```
//!
//! IPv6 uses 32-digit hex strings instead of integers; their lexicographic
//! order is the numeric order.

use serde_json::{json, Map, Value};
use std::net::{Ipv4Addr, Ipv6Addr};
use stixgraph_pattern::{
    Clause, CompareOp, Filter, Literal, ModifierRegistry, PatternError, StixModifier,
};

/// Field added to address objects.
pub const DERIVED_FIELD: &str = "x_ip";

/// Field `x_ip` is computed from.
pub const SOURCE_FIELD: &str = "value";

/// Registry with every modifier the engine ships.
pub fn standard_modifiers() -> ModifierRegistry {
    ModifierRegistry::new().with(Ipv4Modifier).with(Ipv6Modifier)
}

/// Inclusive bounds of an address or network, in one family's integer
/// width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    lo: u128,
    hi: u128,
    single: bool,
}

fn parse_bounds(text: &str, bits: u32, parse: impl Fn(&str) -> Option<u128>) -> Option<Bounds> {
    let (addr, prefix) = match text.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix.trim().parse::<u32>().ok()?)),
        None => (text, None),
    };
    let addr = parse(addr.trim())?;
    let prefix = prefix.unwrap_or(bits);
    if prefix > bits {
        return None;
    }
    let host_bits = bits - prefix;
    let host_mask = if host_bits == 0 {
        0
    } else {
        u128::MAX >> (128 - host_bits)
    };
    Some(Bounds {
        lo: addr & !host_mask,
        hi: addr | host_mask,
        single: !text.contains('/'),
    })
}

fn ipv4_bounds(text: &str) -> Option<Bounds> {
    parse_bounds(text, 32, |a| a.parse::<Ipv4Addr>().ok().map(|ip| u128::from(u32::from(ip))))
}

fn ipv6_bounds(text: &str) -> Option<Bounds> {
    parse_bounds(text, 128, |a| a.parse::<Ipv6Addr>().ok().map(u128::from))
}

fn hex(n: u128) -> String {
    format!("{n:032x}")
}

fn address_text(object: &Map<String, Value>) -> Option<&str> {
    object.get(SOURCE_FIELD).and_then(Value::as_str)
}

/// `x_ip` equals the literal, or is a network containing it.
fn containment_filter(bounds: Bounds, literal: impl Fn(u128) -> Literal) -> Filter {
    let range = Filter::group(Filter::and(vec![
        Filter::comparison(
            &[DERIVED_FIELD, "network_addr"],
            CompareOp::Le,
            literal(bounds.lo),
        ),
        Filter::comparison(
            &[DERIVED_FIELD, "broadcast_addr"],
            CompareOp::Ge,
            literal(bounds.hi),
        ),
    ]));
    if bounds.single {
        Filter::or(vec![
            Filter::comparison(&[DERIVED_FIELD], CompareOp::Eq, literal(bounds.lo)),
            range,
        ])
    } else {
        range
    }
}

/// Shared clause handling: only `x_ip = <address>` is owned.
fn compile_address_clause(
    modifier: &str,
    clause: &Clause,
    bounds_of: impl Fn(&str) -> Option<Bounds>,
    literal: impl Fn(u128) -> Literal,
) -> stixgraph_pattern::Result<Option<Filter>> {
    if clause.path.len() != 1 || clause.path[0] != DERIVED_FIELD || clause.op != CompareOp::Eq {
        return Ok(None);
    }
    let text = clause.literal.text().unwrap_or_else(|| clause.literal.to_string());
    let bounds = bounds_of(&text).ok_or_else(|| PatternError::FieldCanNotBeCalculated {
        field: clause.field_path(),
        modifier: modifier.to_string(),
        reason: format!("`{text}` is not an address"),
    })?;
    Ok(Some(containment_filter(bounds, literal)))
}

// ============================================================================
// IPv4
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4Modifier;

impl StixModifier for Ipv4Modifier {
    fn name(&self) -> &str {
        "ipv4"
    }

    fn can_handle(&self, stix_type: &str) -> bool {
        stix_type == "ipv4-addr"
    }

    fn compile(&self, clause: &Clause) -> stixgraph_pattern::Result<Option<Filter>> {
        compile_address_clause(self.name(), clause, ipv4_bounds, |n| Literal::number(n))
    }

    fn augment(&self, mut object: Map<String, Value>) -> Map<String, Value> {
        let Some(bounds) = address_text(&object).and_then(ipv4_bounds) else {
            tracing::debug!(object = ?object.get("id"), "ipv4 object without a parsable value");
            return object;
        };
        // IPv4 bounds always fit in 32 bits
        let (lo, hi) = (bounds.lo as u64, bounds.hi as u64);
        let derived = if bounds.single {
            json!(lo)
        } else {
            json!({"network_addr": lo, "broadcast_addr": hi})
        };
        object.insert(DERIVED_FIELD.to_string(), derived);
        object
    }

    fn derived_from(&self, field: &str) -> Option<&'static str> {
        (field == DERIVED_FIELD).then_some(SOURCE_FIELD)
    }
}

// ============================================================================
// IPv6
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv6Modifier;

impl StixModifier for Ipv6Modifier {
    fn name(&self) -> &str {
        "ipv6"
    }

    fn can_handle(&self, stix_type: &str) -> bool {
        stix_type == "ipv6-addr"
    }

    fn compile(&self, clause: &Clause) -> stixgraph_pattern::Result<Option<Filter>> {
        compile_address_clause(self.name(), clause, ipv6_bounds, |n| Literal::string(&hex(n)))
    }

    fn augment(&self, mut object: Map<String, Value>) -> Map<String, Value> {
        let Some(bounds) = address_text(&object).and_then(ipv6_bounds) else {
            tracing::debug!(object = ?object.get("id"), "ipv6 object without a parsable value");
            return object;
        };
        let derived = if bounds.single {
            json!(hex(bounds.lo))
        } else {
            json!({"network_addr": hex(bounds.lo), "broadcast_addr": hex(bounds.hi)})
        };
        object.insert(DERIVED_FIELD.to_string(), derived);
        object
    }

    fn derived_from(&self, field: &str) -> Option<&'static str> {
        (field == DERIVED_FIELD).then_some(SOURCE_FIELD)
    }
}
