#![allow(dead_code)]

use lbug::{Connection, MemoryBackend, ReclaimMode, Table, Value};
use serde_json::{json, Value as Json};

pub const EDGE_QUERY: &str = "MATCH (source:Node)-[r:CONNECTS]->(target:Node)
 RETURN source.file_path, source.fqn, source.id, target.file_path, target.fqn, target.id, r.label
 LIMIT 15";

pub const EDGE_ROWS: usize = 15;
pub const EDGE_COLUMNS: usize = 7;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node(id: i64) -> (Value, Value, Value) {
    (
        Value::String(format!("src/module{}.ext", id / 10)),
        Value::String(format!("src/module{}.item_{id}", id / 10)),
        Value::Integer(id),
    )
}

/// Expected value of `(row, column)` in [`edge_table`].
pub fn edge_value(row: usize, column: usize) -> Value {
    let source = (row / 3) as i64;
    let target = source + (row % 3) as i64 + 1;
    let (sp, sf, si) = node(source);
    let (tp, tf, ti) = node(target);
    match column {
        0 => sp,
        1 => sf,
        2 => si,
        3 => tp,
        4 => tf,
        5 => ti,
        _ => Value::from("links"),
    }
}

/// 15 edges x 7 columns, each node linked to its next three neighbours.
pub fn edge_table() -> Table {
    let mut t = Table::new([
        "source.file_path",
        "source.fqn",
        "source.id",
        "target.file_path",
        "target.fqn",
        "target.id",
        "r.label",
    ]);
    for row in 0..EDGE_ROWS {
        t.push_row((0..EDGE_COLUMNS).map(|c| edge_value(row, c)));
    }
    t
}

pub fn edge_connection(mode: ReclaimMode) -> Connection<MemoryBackend> {
    let backend = MemoryBackend::new();
    backend.register(EDGE_QUERY, edge_table());
    Connection::with_reclaim_mode(backend, mode)
}

pub fn to_json(v: &Value) -> Json {
    match v {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Integer(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s),
        Value::List(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Struct(fields) => Json::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
    }
}
