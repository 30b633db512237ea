use super::json::JsonContainer;
use super::typed_map::TypedMapContainer;
use super::{Container, EncodingKind, Scalar, WirePayload};

/// Typed map and plain JSON for the same record, published together.
pub struct HybridContainer {
    map: TypedMapContainer,
    json: JsonContainer,
}

impl HybridContainer {
    pub fn new() -> Self {
        Self { map: TypedMapContainer::new(), json: JsonContainer::new(false) }
    }
}

impl Default for HybridContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Container for HybridContainer {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Hybrid
    }

    fn start_nested(&mut self, name: &str, multiple: bool) {
        self.map.start_nested(name, multiple);
        self.json.start_nested(name, multiple);
    }

    fn close_nested(&mut self, name: &str) {
        self.map.close_nested(name);
        self.json.close_nested(name);
    }

    fn put(&mut self, name: &str, value: Scalar, multiple: bool) {
        self.map.put(name, value.clone(), multiple);
        self.json.put(name, value, multiple);
    }

    fn finish(self: Box<Self>) -> WirePayload {
        WirePayload::Hybrid { map: self.map.into_map(), json: self.json.into_value() }
    }
}
