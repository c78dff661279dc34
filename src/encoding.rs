//! Canonical textual encoding and byte accounting
//!
//! Every byte charged to the budget is derived from one pinned encoding:
//! JSON with key-sorted objects, minimal separators, and all non-ASCII
//! characters escaped as `\uXXXX`. The encoder is hand-rolled rather than
//! delegated to the default serializer so key order and whitespace cannot
//! drift across platforms or library versions.

use serde_json::{Map, Value};

use crate::episode::Step;

/// Fixed per-item header charged on WRITE
pub const HEADER_BYTES: u64 = 32;

/// Fixed overhead charged on MERGE
pub const MERGE_OVERHEAD_BYTES: u64 = 16;

/// Render a JSON value in the canonical encoding
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Render a JSON object in the canonical encoding
pub fn canonical_object_string(map: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_object(&mut out, map);
    out
}

/// Byte cost of storing a step: canonical observation + canonical metadata
/// + fixed header
pub fn estimate_bytes(step: &Step) -> u64 {
    let payload = canonical_string(&step.observation).len() as u64;
    let metadata = canonical_object_string(&step.metadata).len() as u64;
    payload + metadata + HEADER_BYTES
}

/// Byte cost of storing a merge delta: canonical delta + fixed merge
/// overhead
pub fn delta_bytes(delta: &Map<String, Value>) -> u64 {
    canonical_object_string(delta).len() as u64 + MERGE_OVERHEAD_BYTES
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map),
    }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
    // Sort keys explicitly; the map's own iteration order is not part of
    // the encoding contract.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, &map[key.as_str()]);
    }
    out.push('}');
}

fn write_string(out: &mut String, s: &str) {
    use std::fmt::Write;

    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c if c.is_ascii() => out.push(c),
            c => {
                // Non-ASCII is escaped as UTF-16 units (surrogate pairs
                // above the BMP).
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{:04x}", unit);
                }
            }
        }
    }
    out.push('"');
}
