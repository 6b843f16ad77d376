use super::*;
use serde_json::{json, Map, Value};
use stixgraph_pattern::{CompareOp, Literal};

fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn address(id: &str, value: &str) -> Map<String, Value> {
    obj(json!({"type": "ipv4-addr", "id": id, "value": value}))
}

fn ids(rows: &[MirrorRow]) -> Vec<String> {
    let mut ids: Vec<String> = rows.iter().map(|r| r.object_id.clone()).collect();
    ids.sort();
    ids
}

// ============================================================================
// Connection
// ============================================================================

#[test]
fn test_drop_missing_table_is_tolerated() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    assert!(!mirror.drop_table("nope").unwrap());
}

#[test]
fn test_drop_tables_with_prefix() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    for field in ["ipv4-addr:value", "domain-name:value"] {
        let mut opt = Optimizer::new(mirror.clone(), field, "feed_static").unwrap();
        let object = obj(json!({
            "type": opt.stix_type().to_string(),
            "id": "x--1",
            "value": "a",
        }));
        opt.insert(&object, "feed_static/1").unwrap();
        opt.flush().unwrap();
    }
    let mut other = Optimizer::new(mirror.clone(), "file:name", "other_static").unwrap();
    other
        .insert(&obj(json!({"type": "file", "id": "file--1", "name": "a"})), "other_static/1")
        .unwrap();
    other.flush().unwrap();

    let dropped = mirror.drop_tables_with_prefix("feed_static_").unwrap();
    assert_eq!(dropped.len(), 2);
    assert_eq!(mirror.tables().unwrap(), vec![other.table_name().to_string()]);
}

#[test]
fn test_backup_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MirrorConnection::open(&dir.path().join("live.sqlite3")).unwrap();
    let mut opt = Optimizer::new(mirror.clone(), "ipv4-addr:value", "feed").unwrap();
    opt.insert(&address("ipv4-addr--1", "1.2.3.4"), "feed/1").unwrap();
    opt.flush().unwrap();

    let backup = dir.path().join("backup.sqlite3");
    mirror.backup_to(&backup).unwrap();
    opt.drop_table().unwrap();
    assert!(mirror.tables().unwrap().is_empty());

    mirror.restore_from(&backup).unwrap();
    let mut restored = Optimizer::from_descriptor(mirror.clone(), &opt.descriptor(), "feed").unwrap();
    assert_eq!(restored.row_count().unwrap(), 1);
}

// ============================================================================
// Optimizer
// ============================================================================

#[test]
fn test_table_name_uses_collection_and_suffix() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let opt = Optimizer::new(mirror, "ipv4-addr:value", "feed_1700000000").unwrap();
    let descriptor = opt.descriptor();
    assert_eq!(descriptor.class, OPTIMIZER_CLASS);
    assert_eq!(descriptor.uuid.len(), 32);
    assert_eq!(
        opt.table_name(),
        format!("feed_1700000000_{}", descriptor.uuid)
    );
}

#[test]
fn test_invalid_field_paths() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    for field in ["ipv4-addr", ":value", "ipv4-addr::value", ""] {
        assert!(matches!(
            Optimizer::new(mirror.clone(), field, "feed"),
            Err(MirrorError::InvalidFieldPath(_))
        ));
    }
}

#[test]
fn test_unknown_descriptor_class() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let descriptor = OptimizerDescriptor {
        class: "elastic".into(),
        field: "ipv4-addr:value".into(),
        uuid: "0".repeat(32),
    };
    assert!(matches!(
        Optimizer::from_descriptor(mirror, &descriptor, "feed"),
        Err(MirrorError::UnknownOptimizerClass(_))
    ));
}

#[test]
fn test_strip_removes_only_the_field() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let opt = Optimizer::new(mirror, "ipv4-addr:value", "feed").unwrap();
    let stripped = opt.strip(obj(json!({"type": "ipv4-addr", "value": "coucou"})));
    assert_eq!(Value::Object(stripped), json!({"type": "ipv4-addr"}));

    // other types are left alone
    let untouched = opt.strip(obj(json!({"type": "domain-name", "value": "coucou"})));
    assert_eq!(untouched["value"], "coucou");
}

#[test]
fn test_strip_and_restore_nested_field() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let opt = Optimizer::new(mirror, "file:hashes:MD5", "feed").unwrap();
    let original = obj(json!({
        "type": "file",
        "hashes": {"MD5": "abc", "SHA-1": "def"},
    }));
    let mut stripped = opt.strip(original.clone());
    assert_eq!(stripped["hashes"], json!({"SHA-1": "def"}));
    opt.restore(&mut stripped, json!("abc"));
    assert_eq!(stripped, original);
}

#[test]
fn test_insert_rejects_other_objects() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let mut opt = Optimizer::new(mirror, "ipv4-addr:value", "feed").unwrap();

    let wrong_type = obj(json!({"type": "domain-name", "id": "d--1", "value": "a.b"}));
    let missing = obj(json!({"type": "ipv4-addr", "id": "ipv4-addr--1"}));
    for object in [&wrong_type, &missing] {
        assert!(matches!(
            opt.insert(object, "feed/1"),
            Err(MirrorError::InvalidObjectForOptimizer { .. })
        ));
    }

    // the first accepted value fixes the column kind
    opt.insert(&address("ipv4-addr--1", "10.0.0.1"), "feed/1").unwrap();
    let mismatched = obj(json!({"type": "ipv4-addr", "id": "ipv4-addr--2", "value": 12}));
    assert!(opt.accepts(&mismatched).is_err());
    assert!(opt.accepts(&address("ipv4-addr--3", "10.0.0.3")).is_ok());
}

#[test]
fn test_text_queries() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let mut opt = Optimizer::new(mirror, "domain-name:value", "feed").unwrap();
    for (i, name) in ["example.com", "example.org", "other.net"].iter().enumerate() {
        let object = obj(json!({"type": "domain-name", "id": format!("d--{i}"), "value": name}));
        opt.insert(&object, &format!("feed/{i}")).unwrap();
    }
    opt.flush().unwrap();

    let eq = opt.query(CompareOp::Eq, &Literal::string("example.org")).unwrap();
    assert_eq!(ids(&eq), vec!["d--1"]);
    assert_eq!(eq[0].value, json!("example.org"));
    assert_eq!(eq[0].doc_ref, "feed/1");

    let like = opt.query(CompareOp::Like, &Literal::string("example.%")).unwrap();
    assert_eq!(ids(&like), vec!["d--0", "d--1"]);

    // LIKE is case sensitive, as in the primary store
    let upper = opt.query(CompareOp::Like, &Literal::string("EXAMPLE.%")).unwrap();
    assert!(upper.is_empty());

    let ne = opt.query(CompareOp::Ne, &Literal::string("other.net")).unwrap();
    assert_eq!(ne.len(), 2);
}

#[test]
fn test_numeric_queries() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let mut opt = Optimizer::new(mirror, "autonomous-system:number", "feed").unwrap();
    for n in [10, 20, 30] {
        let object = obj(json!({"type": "autonomous-system", "id": format!("as--{n}"), "number": n}));
        opt.insert(&object, "feed/1").unwrap();
    }
    let rows = opt.query(CompareOp::Ge, &Literal::number(20)).unwrap();
    assert_eq!(ids(&rows), vec!["as--20", "as--30"]);
    let rows = opt.query(CompareOp::Lt, &Literal::number(20)).unwrap();
    assert_eq!(ids(&rows), vec!["as--10"]);
}

#[test]
fn test_network_containment() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let mut opt = Optimizer::new(mirror, "ipv4-addr:value", "feed").unwrap();
    opt.insert(&address("net", "97.8.8.0/24"), "feed/1").unwrap();
    opt.insert(&address("host", "97.8.8.8"), "feed/2").unwrap();
    opt.insert(&address("far", "10.0.0.1"), "feed/3").unwrap();
    opt.flush().unwrap();

    // a single host matches itself and every network containing it
    let rows = opt.query(CompareOp::Eq, &Literal::string("97.8.8.8")).unwrap();
    assert_eq!(ids(&rows), vec!["host", "net"]);

    // a network matches the networks containing it, not the hosts inside
    let rows = opt.query(CompareOp::Eq, &Literal::string("97.8.8.0/25")).unwrap();
    assert_eq!(ids(&rows), vec!["net"]);

    let rows = opt.query(CompareOp::Ne, &Literal::string("97.8.8.8")).unwrap();
    assert_eq!(ids(&rows), vec!["far"]);

    // compared as written, only the host itself matches
    let rows = opt.query_values(CompareOp::Eq, &Literal::string("97.8.8.8")).unwrap();
    assert_eq!(ids(&rows), vec!["host"]);

    // the value column keeps the text as written
    let rows = opt.query(CompareOp::Like, &Literal::string("97.8.%")).unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_queries_before_first_insert_are_empty() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let mut opt = Optimizer::new(mirror, "ipv4-addr:value", "feed").unwrap();
    assert!(opt.query(CompareOp::Eq, &Literal::string("1.1.1.1")).unwrap().is_empty());
    assert!(opt.rows_for_document("feed/1").unwrap().is_empty());
    assert_eq!(opt.row_count().unwrap(), 0);
    assert!(!opt.drop_table().unwrap());
}

#[test]
fn test_shared_document_rows() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let mut opt = Optimizer::new(mirror, "ipv4-addr:value", "feed").unwrap();
    opt.insert(&address("a", "1.1.1.1"), "feed/1").unwrap();
    opt.insert(&address("b", "2.2.2.2"), "feed/1").unwrap();
    opt.insert(&address("c", "3.3.3.3"), "feed/2").unwrap();

    let rows = opt.rows_for_document("feed/1").unwrap();
    assert_eq!(ids(&rows), vec!["a", "b"]);
    assert_eq!(opt.value_for("feed/1", "b").unwrap(), Some(json!("2.2.2.2")));
    assert_eq!(opt.value_for("feed/2", "b").unwrap(), None);
}

#[test]
fn test_commit_every_flushes_periodically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.sqlite3");
    let mirror = MirrorConnection::open(&path).unwrap().with_commit_every(2);
    let mut opt = Optimizer::new(mirror, "ipv4-addr:value", "feed").unwrap();
    for i in 0..3 {
        opt.insert(&address(&format!("a{i}"), "1.1.1.1"), "feed/1").unwrap();
    }

    // a second connection only sees committed rows
    let reader = MirrorConnection::open(&path).unwrap();
    let mut view = Optimizer::from_descriptor(reader, &opt.descriptor(), "feed").unwrap();
    assert_eq!(view.row_count().unwrap(), 2);

    opt.flush().unwrap();
    assert_eq!(view.row_count().unwrap(), 3);
}

#[test]
fn test_reconcile_removes_orphans() {
    let mirror = MirrorConnection::open_in_memory().unwrap();
    let mut opt = Optimizer::new(mirror, "ipv4-addr:value", "feed").unwrap();
    opt.insert(&address("a", "1.1.1.1"), "feed/1").unwrap();
    opt.insert(&address("b", "2.2.2.2"), "feed/1").unwrap();
    opt.insert(&address("c", "3.3.3.3"), "feed/2").unwrap();
    opt.flush().unwrap();

    let removed = opt.reconcile(&mut |doc_ref: &str| doc_ref == "feed/2").unwrap();
    assert_eq!(removed, 2);
    assert_eq!(opt.row_count().unwrap(), 1);
}
