// Replicated graph document built on yrs.
//
// A graph document holds three root maps: `nodes` and `edges` keyed by id,
// each value a plain JSON-like object, and `meta` for graph-level settings.
// Entries are replaced wholesale on write, so concurrent edits to the same
// node resolve last-writer-wins per entry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map as JsonMap, Number, Value};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

pub const NODES_MAP: &str = "nodes";
pub const EDGES_MAP: &str = "edges";
pub const META_MAP: &str = "meta";

/// Largest integer a JavaScript peer can hold without losing precision.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

#[derive(Debug)]
pub struct GraphDocument {
    doc: Doc,
    nodes: MapRef,
    edges: MapRef,
    meta: MapRef,
}

impl GraphDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Deterministic client id, for tests that compare encoded state.
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self::from_doc(Doc::with_options(options))
    }

    fn from_doc(doc: Doc) -> Self {
        let nodes = doc.get_or_insert_map(NODES_MAP);
        let edges = doc.get_or_insert_map(EDGES_MAP);
        let meta = doc.get_or_insert_map(META_MAP);
        Self { doc, nodes, edges, meta }
    }

    /// Load a document from a full binary snapshot.
    pub fn from_state(state: &[u8]) -> Result<Self> {
        let document = Self::new();
        document.apply_update(state)?;
        Ok(document)
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Merge a binary update (snapshot or delta) into the document.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update).context("failed to decode graph document update")?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .context("failed to apply graph document update")?;
        Ok(())
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).context("failed to decode state vector")?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn node(&self, node_id: &str) -> Option<Value> {
        let txn = self.doc.transact();
        self.nodes.get(&txn, node_id).and_then(out_to_json)
    }

    /// All node entries, ordered by id.
    pub fn nodes(&self) -> Vec<(String, Value)> {
        collect_entries(&self.doc, &self.nodes)
    }

    /// All edge entries, ordered by id.
    pub fn edges(&self) -> Vec<(String, Value)> {
        collect_entries(&self.doc, &self.edges)
    }

    pub fn meta(&self, key: &str) -> Option<Value> {
        let txn = self.doc.transact();
        self.meta.get(&txn, key).and_then(out_to_json)
    }

    /// Runs `write` inside one transaction and returns the resulting delta.
    ///
    /// The delta is empty-equivalent (no new blocks) when `write` changed nothing.
    pub fn write<F>(&self, write: F) -> Vec<u8>
    where
        F: FnOnce(&mut GraphWriter<'_>),
    {
        let before = self.doc.transact().state_vector();
        {
            let mut writer = GraphWriter { txn: self.doc.transact_mut(), document: self };
            write(&mut writer);
        }
        self.doc.transact().encode_diff_v1(&before)
    }

    /// Replaces one node entry with a patched copy, stamping `updatedAt`.
    ///
    /// Returns the delta to broadcast, or `None` when the node is absent.
    pub fn patch_node<F>(&self, node_id: &str, patch: F) -> Option<Vec<u8>>
    where
        F: FnOnce(&mut JsonMap<String, Value>),
    {
        let mut entry = match self.node(node_id)? {
            Value::Object(entry) => entry,
            _ => return None,
        };
        patch(&mut entry);
        entry.insert("updatedAt".into(), Value::String(iso_timestamp(chrono::Utc::now())));

        let entry = Value::Object(entry);
        Some(self.write(|writer| writer.set_node(node_id, &entry)))
    }
}

impl Default for GraphDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Write access to the three root maps within a single transaction.
pub struct GraphWriter<'doc> {
    txn: TransactionMut<'doc>,
    document: &'doc GraphDocument,
}

impl GraphWriter<'_> {
    pub fn node(&self, node_id: &str) -> Option<Value> {
        self.document.nodes.get(&self.txn, node_id).and_then(out_to_json)
    }

    pub fn set_node(&mut self, node_id: &str, entry: &Value) {
        self.document.nodes.insert(&mut self.txn, node_id, json_to_any(entry));
    }

    pub fn remove_node(&mut self, node_id: &str) {
        self.document.nodes.remove(&mut self.txn, node_id);
    }

    pub fn edges(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = self
            .document
            .edges
            .iter(&self.txn)
            .filter_map(|(key, out)| out_to_json(out).map(|value| (key.to_owned(), value)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn set_edge(&mut self, edge_id: &str, entry: &Value) {
        self.document.edges.insert(&mut self.txn, edge_id, json_to_any(entry));
    }

    pub fn set_meta(&mut self, key: &str, value: &Value) {
        self.document.meta.insert(&mut self.txn, key, json_to_any(value));
    }
}

fn collect_entries(doc: &Doc, map: &MapRef) -> Vec<(String, Value)> {
    let txn = doc.transact();
    let mut entries: Vec<(String, Value)> = map
        .iter(&txn)
        .filter_map(|(key, out)| out_to_json(out).map(|value| (key.to_owned(), value)))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

/// Nested shared types are not part of the graph schema and read as absent.
fn out_to_json(out: Out) -> Option<Value> {
    match out {
        Out::Any(any) => Some(any_to_json(&any)),
        _ => None,
    }
}

pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(flag) => Any::Bool(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(int) if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&int) => {
                Any::Number(int as f64)
            }
            Some(int) => Any::BigInt(int),
            None => Any::Number(number.as_f64().unwrap_or(0.0)),
        },
        Value::String(text) => Any::String(Arc::from(text.as_str())),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into()),
        Value::Object(fields) => Any::Map(Arc::new(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect::<HashMap<_, _>>(),
        )),
    }
}

pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(flag) => Value::Bool(*flag),
        Any::Number(number) => {
            if number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER as f64 {
                Value::from(*number as i64)
            } else {
                Number::from_f64(*number).map(Value::Number).unwrap_or(Value::Null)
            }
        }
        Any::BigInt(int) => Value::from(*int),
        Any::String(text) => Value::String(text.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => Value::Object(
            fields.iter().map(|(key, value)| (key.clone(), any_to_json(value))).collect(),
        ),
    }
}

/// Millisecond-precision UTC timestamp with a `Z` suffix, as browsers emit.
pub fn iso_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
