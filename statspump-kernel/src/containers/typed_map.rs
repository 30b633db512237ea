use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{Container, EncodingKind, Scalar, WirePayload};

/// Self-describing value: every entry carries its type next to its value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SdtValue {
    Long(i64),
    ULong(u64),
    Int(i32),
    Short(i16),
    Byte(i8),
    Bool(bool),
    Float(f32),
    Double(f64),
    String(String),
    Map(BTreeMap<String, SdtValue>),
    Stream(Vec<SdtValue>),
}

impl From<Scalar> for SdtValue {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Long(v) => SdtValue::Long(v),
            Scalar::ULong(v) => SdtValue::ULong(v),
            Scalar::Int(v) => SdtValue::Int(v),
            Scalar::Short(v) => SdtValue::Short(v),
            Scalar::Byte(v) => SdtValue::Byte(v),
            Scalar::Bool(v) => SdtValue::Bool(v),
            Scalar::Float(v) => SdtValue::Float(v),
            Scalar::Double(v) => SdtValue::Double(v),
            Scalar::Str(v) => SdtValue::String(v),
        }
    }
}

/// Appends to the stream under `key` when `multiple`, otherwise sets it.
/// A repeated key that was not declared multiple is promoted to a stream.
pub(crate) fn insert_sdt(map: &mut BTreeMap<String, SdtValue>, key: &str, value: SdtValue, multiple: bool) {
    match map.get_mut(key) {
        Some(SdtValue::Stream(items)) if multiple => items.push(value),
        Some(existing) => {
            if !multiple {
                debug!("Element {} repeated without multiple flag, promoting to stream", key);
            }
            let previous = std::mem::replace(existing, SdtValue::Stream(Vec::new()));
            if let SdtValue::Stream(items) = existing {
                items.push(previous);
                items.push(value);
            }
        }
        None if multiple => {
            map.insert(key.to_string(), SdtValue::Stream(vec![value]));
        }
        None => {
            map.insert(key.to_string(), value);
        }
    }
}

struct Level {
    name: String,
    multiple: bool,
    map: BTreeMap<String, SdtValue>,
}

/// Nested typed map mirroring the reply tree.
pub struct TypedMapContainer {
    root: BTreeMap<String, SdtValue>,
    stack: Vec<Level>,
}

impl TypedMapContainer {
    pub fn new() -> Self {
        Self { root: BTreeMap::new(), stack: Vec::new() }
    }

    fn current(&mut self) -> &mut BTreeMap<String, SdtValue> {
        match self.stack.last_mut() {
            Some(level) => &mut level.map,
            None => &mut self.root,
        }
    }

    pub fn into_map(mut self) -> BTreeMap<String, SdtValue> {
        while let Some(level) = self.stack.pop() {
            warn!("Unclosed element {} in typed map, closing", level.name);
            let parent = self.current();
            insert_sdt(parent, &level.name, SdtValue::Map(level.map), level.multiple);
        }
        self.root
    }
}

impl Default for TypedMapContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Container for TypedMapContainer {
    fn kind(&self) -> EncodingKind {
        EncodingKind::TypedMap
    }

    fn start_nested(&mut self, name: &str, multiple: bool) {
        self.stack.push(Level { name: name.to_string(), multiple, map: BTreeMap::new() });
    }

    fn close_nested(&mut self, name: &str) {
        let Some(level) = self.stack.pop() else {
            warn!("close_nested({}) without matching start", name);
            return;
        };
        debug_assert_eq!(level.name, name);
        let parent = self.current();
        insert_sdt(parent, &level.name, SdtValue::Map(level.map), level.multiple);
    }

    fn put(&mut self, name: &str, value: Scalar, multiple: bool) {
        let map = self.current();
        insert_sdt(map, name, value.into(), multiple);
    }

    fn finish(self: Box<Self>) -> WirePayload {
        WirePayload::TypedMap(self.into_map())
    }
}
