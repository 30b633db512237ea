use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

use super::{Container, EncodingKind, Scalar, WirePayload};

/// Builds slash-joined keys, suffixing repeated elements with a per-parent
/// occurrence index: `client|0/stats/rx`.
#[derive(Debug, Default)]
pub struct FlatKeyGenerator {
    segments: Vec<String>,
    counters: HashMap<String, usize>,
}

impl FlatKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn segment(&mut self, name: &str, multiple: bool) -> String {
        if !multiple {
            return name.to_string();
        }
        let scope = format!("{}/{}", self.segments.join("/"), name);
        let counter = self.counters.entry(scope).or_insert(0);
        let segment = format!("{name}|{counter}");
        *counter += 1;
        segment
    }

    pub fn push(&mut self, name: &str, multiple: bool) {
        let segment = self.segment(name, multiple);
        self.segments.push(segment);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.segments.pop()
    }

    pub fn leaf_key(&mut self, name: &str, multiple: bool) -> String {
        let segment = self.segment(name, multiple);
        if self.segments.is_empty() {
            segment
        } else {
            format!("{}/{}", self.segments.join("/"), segment)
        }
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

/// Single-level JSON map keyed by flattened element paths.
pub struct FlatKeyContainer {
    keys: FlatKeyGenerator,
    values: Map<String, Value>,
}

impl FlatKeyContainer {
    pub fn new() -> Self {
        Self { keys: FlatKeyGenerator::new(), values: Map::new() }
    }
}

impl Default for FlatKeyContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Container for FlatKeyContainer {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Flat
    }

    fn start_nested(&mut self, name: &str, multiple: bool) {
        self.keys.push(name, multiple);
    }

    fn close_nested(&mut self, name: &str) {
        if self.keys.pop().is_none() {
            warn!("close_nested({}) without matching start", name);
        }
    }

    /// A repeated leaf not marked multiple keeps its first value.
    fn put(&mut self, name: &str, value: Scalar, multiple: bool) {
        let key = self.keys.leaf_key(name, multiple);
        if self.values.contains_key(&key) {
            warn!("Dropping repeated element {}: '{}' is not marked multiple", key, value.to_text());
            return;
        }
        self.values.insert(key, value.to_json());
    }

    fn finish(self: Box<Self>) -> WirePayload {
        if self.keys.depth() > 0 {
            warn!("Flat container finished with {} open elements", self.keys.depth());
        }
        WirePayload::Json(Value::Object(self.values))
    }
}
