use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Container, EncodingKind, Scalar, WirePayload};

/// `message-vpn-name` -> `messageVpnName`.
pub fn kebab_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '-' {
            upper = !out.is_empty();
            continue;
        }
        if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

pub(crate) fn insert_json(map: &mut Map<String, Value>, key: String, value: Value, multiple: bool) {
    match map.get_mut(&key) {
        Some(Value::Array(items)) if multiple => items.push(value),
        Some(existing) => {
            if !multiple {
                debug!("Element {} repeated without multiple flag, promoting to array", key);
            }
            let previous = existing.take();
            *existing = Value::Array(vec![previous, value]);
        }
        None if multiple => {
            map.insert(key, Value::Array(vec![value]));
        }
        None => {
            map.insert(key, value);
        }
    }
}

struct Level {
    name: String,
    multiple: bool,
    map: Map<String, Value>,
}

/// JSON object mirroring the reply tree, keys optionally camelCased.
pub struct JsonContainer {
    camel_case: bool,
    root: Map<String, Value>,
    stack: Vec<Level>,
}

impl JsonContainer {
    pub fn new(camel_case: bool) -> Self {
        Self { camel_case, root: Map::new(), stack: Vec::new() }
    }

    fn key(&self, name: &str) -> String {
        if self.camel_case { kebab_to_camel(name) } else { name.to_string() }
    }

    fn current(&mut self) -> &mut Map<String, Value> {
        match self.stack.last_mut() {
            Some(level) => &mut level.map,
            None => &mut self.root,
        }
    }

    pub fn into_value(mut self) -> Value {
        while let Some(level) = self.stack.pop() {
            warn!("Unclosed element {} in JSON container, closing", level.name);
            let key = self.key(&level.name);
            insert_json(self.current(), key, Value::Object(level.map), level.multiple);
        }
        Value::Object(self.root)
    }
}

impl Container for JsonContainer {
    fn kind(&self) -> EncodingKind {
        if self.camel_case { EncodingKind::CamelJson } else { EncodingKind::Json }
    }

    fn start_nested(&mut self, name: &str, multiple: bool) {
        self.stack.push(Level { name: name.to_string(), multiple, map: Map::new() });
    }

    fn close_nested(&mut self, name: &str) {
        let Some(level) = self.stack.pop() else {
            warn!("close_nested({}) without matching start", name);
            return;
        };
        let key = self.key(&level.name);
        insert_json(self.current(), key, Value::Object(level.map), level.multiple);
    }

    fn put(&mut self, name: &str, value: Scalar, multiple: bool) {
        let key = self.key(name);
        insert_json(self.current(), key, value.to_json(), multiple);
    }

    fn finish(self: Box<Self>) -> WirePayload {
        WirePayload::Json(self.into_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::XsdType;
    use serde_json::json;

    #[test]
    fn camel_cases_keys() {
        assert_eq!(kebab_to_camel("max-connections-smf"), "maxConnectionsSmf");
        assert_eq!(kebab_to_camel("name"), "name");
        assert_eq!(kebab_to_camel("-leading"), "leading");
    }

    #[test]
    fn builds_camel_case_tree() {
        let mut c = JsonContainer::new(true);
        c.start_nested("event-configuration", false);
        c.put_typed(XsdType::Boolean, "large-message-threshold", "true", false);
        c.close_nested("event-configuration");
        c.put_typed(XsdType::String, "bridge-name", "b1", true);
        assert_eq!(
            c.into_value(),
            json!({ "eventConfiguration": { "largeMessageThreshold": true }, "bridgeName": ["b1"] })
        );
    }
}
