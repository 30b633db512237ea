use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use super::{Container, EncodingKind, SdtValue, WirePayload, XmlFragment};

/// Collects the single-record payloads of one poll cycle into one message.
///
/// Typed maps become a stream of maps under the base element, JSON an array,
/// flat keys are re-rooted under `base|i`, XML records are concatenated
/// inside one envelope.
pub struct GroupedContainer {
    kind: EncodingKind,
    base_element: String,
    items: Vec<WirePayload>,
}

impl GroupedContainer {
    pub fn new(kind: EncodingKind, base_element: impl Into<String>) -> Self {
        Self { kind, base_element: base_element.into(), items: Vec::new() }
    }

    pub fn kind(&self) -> EncodingKind {
        self.kind
    }

    pub fn add_container(&mut self, single: Box<dyn Container>) {
        self.add_payload(single.finish());
    }

    pub fn add_payload(&mut self, payload: WirePayload) {
        self.items.push(payload);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn finish(self) -> WirePayload {
        let base = self.base_element;
        match self.kind {
            EncodingKind::TypedMap => WirePayload::TypedMap(group_maps(&base, self.items)),
            EncodingKind::Xml | EncodingKind::XmlEnvelope => {
                let mut grouped = XmlFragment::default();
                for item in self.items {
                    match item {
                        WirePayload::Xml(fragment) => {
                            if grouped.records.is_empty() {
                                grouped.preamble = fragment.preamble;
                                grouped.postamble = fragment.postamble;
                            }
                            grouped.records.extend(fragment.records);
                        }
                        other => warn!("Ignoring {:?} payload in grouped XML", other.content_type()),
                    }
                }
                WirePayload::Xml(grouped)
            }
            EncodingKind::Json | EncodingKind::CamelJson => WirePayload::Json(group_json(&base, self.items)),
            EncodingKind::Flat => {
                let mut flat = Map::new();
                for (i, item) in self.items.into_iter().enumerate() {
                    if let WirePayload::Json(Value::Object(entries)) = item {
                        for (key, value) in entries {
                            flat.insert(format!("{base}|{i}/{key}"), value);
                        }
                    }
                }
                WirePayload::Json(Value::Object(flat))
            }
            EncodingKind::Hybrid => {
                let mut maps = Vec::new();
                let mut jsons = Vec::new();
                for item in self.items {
                    if let WirePayload::Hybrid { map, json } = item {
                        maps.push(WirePayload::TypedMap(map));
                        jsons.push(WirePayload::Json(json));
                    }
                }
                WirePayload::Hybrid { map: group_maps(&base, maps), json: group_json(&base, jsons) }
            }
        }
    }
}

fn group_maps(base: &str, items: Vec<WirePayload>) -> BTreeMap<String, SdtValue> {
    let stream = items
        .into_iter()
        .filter_map(|item| match item {
            WirePayload::TypedMap(map) => Some(SdtValue::Map(map)),
            _ => None,
        })
        .collect();
    BTreeMap::from([(base.to_string(), SdtValue::Stream(stream))])
}

fn group_json(base: &str, items: Vec<WirePayload>) -> Value {
    let array = items
        .into_iter()
        .filter_map(|item| match item {
            WirePayload::Json(value) => Some(value),
            _ => None,
        })
        .collect();
    let mut root = Map::new();
    root.insert(base.to_string(), Value::Array(array));
    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{ContainerContext, Scalar};
    use serde_json::json;

    fn ctx() -> ContainerContext {
        ContainerContext::new("/rpc-reply/rpc/show/message-vpn/vpn", "soltr/9_1")
    }

    fn single(kind: EncodingKind, name: &str) -> Box<dyn Container> {
        let mut c = kind.create(&ctx());
        c.put("name", Scalar::Str(name.to_string()), false);
        c
    }

    #[test]
    fn empty_until_first_add() {
        let mut grouped = GroupedContainer::new(EncodingKind::Json, "vpn");
        assert!(grouped.is_empty());
        grouped.add_container(single(EncodingKind::Json, "a"));
        assert!(!grouped.is_empty());
        assert_eq!(grouped.len(), 1);
    }

    #[test]
    fn json_group_is_an_array() {
        let mut grouped = GroupedContainer::new(EncodingKind::Json, "vpn");
        grouped.add_container(single(EncodingKind::Json, "a"));
        grouped.add_container(single(EncodingKind::Json, "b"));
        assert_eq!(grouped.finish(), WirePayload::Json(json!({ "vpn": [{ "name": "a" }, { "name": "b" }] })));
    }

    #[test]
    fn xml_group_shares_one_envelope() {
        let mut grouped = GroupedContainer::new(EncodingKind::XmlEnvelope, "vpn");
        grouped.add_container(single(EncodingKind::XmlEnvelope, "a"));
        grouped.add_container(single(EncodingKind::XmlEnvelope, "b"));
        let WirePayload::Xml(fragment) = grouped.finish() else { panic!("wrong payload") };
        let rendered = fragment.render();
        assert_eq!(rendered.matches("<rpc-reply").count(), 1);
        assert!(rendered.contains("<vpn><name>a</name></vpn><vpn><name>b</name></vpn>"));
    }

    #[test]
    fn flat_group_prefixes_record_index() {
        let mut grouped = GroupedContainer::new(EncodingKind::Flat, "vpn");
        grouped.add_container(single(EncodingKind::Flat, "a"));
        grouped.add_container(single(EncodingKind::Flat, "b"));
        assert_eq!(grouped.finish(), WirePayload::Json(json!({ "vpn|0/name": "a", "vpn|1/name": "b" })));
    }
}
