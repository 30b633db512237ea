/**
 * CONTAINERS - value-tree builders fed by the reply decoder
 *
 * ROLE:
 * A container receives the nested elements and leaves of one reply record
 * and materializes them into a wire payload. Each encoding (typed map, XML,
 * JSON, flat keys, hybrid) is one implementation of [`Container`].
 *
 * HOW IT WORKS:
 * - `start_nested` / `close_nested` bracket an object, always balanced
 * - `put` writes an already typed [`Scalar`]
 * - `put_typed` / `put_str` parse raw reply text against the schema type and
 *   route to `put` (see [`put_typed`] and [`put_str`] for failure handling)
 * - [`EncodingKind`] is the closed set of encodings, built from a key table
 * - [`ContainerSet`] fans one record out to every encoding a bus set needs
 */

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{PumpError, Result};
use crate::schema::XsdType;

pub mod flat;
pub mod grouped;
pub mod hybrid;
pub mod json;
pub mod typed_map;
pub mod xml;

pub use grouped::GroupedContainer;
pub use typed_map::SdtValue;
pub use xml::XmlFragment;

/// A decoded leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Long(i64),
    ULong(u64),
    Int(i32),
    Short(i16),
    Byte(i8),
    Bool(bool),
    Float(f32),
    Double(f64),
    Str(String),
}

impl Scalar {
    /// Value substituted when a numeric leaf cannot be parsed.
    pub fn placeholder(xsd: XsdType) -> Scalar {
        match xsd {
            XsdType::Long | XsdType::UnsignedInt => Scalar::Long(0),
            XsdType::UnsignedLong => Scalar::ULong(0),
            XsdType::Int | XsdType::UnsignedShort => Scalar::Int(0),
            XsdType::Short | XsdType::UnsignedByte => Scalar::Short(0),
            XsdType::Byte => Scalar::Byte(0),
            XsdType::Boolean => Scalar::Bool(false),
            XsdType::Float => Scalar::Float(0.0),
            XsdType::Double => Scalar::Double(0.0),
            _ => Scalar::Str(String::new()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Scalar::Long(v) => Value::from(*v),
            Scalar::ULong(v) => Value::from(*v),
            Scalar::Int(v) => Value::from(*v),
            Scalar::Short(v) => Value::from(*v),
            Scalar::Byte(v) => Value::from(*v),
            Scalar::Bool(v) => Value::from(*v),
            Scalar::Float(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Double(v) => serde_json::Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null),
            Scalar::Str(v) => Value::String(v.clone()),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Scalar::Long(v) => v.to_string(),
            Scalar::ULong(v) => v.to_string(),
            Scalar::Int(v) => v.to_string(),
            Scalar::Short(v) => v.to_string(),
            Scalar::Byte(v) => v.to_string(),
            Scalar::Bool(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Double(v) => v.to_string(),
            Scalar::Str(v) => v.clone(),
        }
    }
}

/// Parses raw reply text into the scalar its schema type maps onto.
///
/// Arbitrary-precision integers/decimals and the date/time family stay
/// strings. `Err` carries the placeholder for the failed type.
pub fn parse_scalar(xsd: XsdType, raw: &str) -> std::result::Result<Scalar, Scalar> {
    let raw = raw.trim();
    let parsed = match xsd {
        XsdType::Long | XsdType::UnsignedInt => raw.parse().ok().map(Scalar::Long),
        XsdType::UnsignedLong => raw.parse().ok().map(Scalar::ULong),
        XsdType::Int | XsdType::UnsignedShort => raw.parse().ok().map(Scalar::Int),
        XsdType::Short | XsdType::UnsignedByte => raw.parse().ok().map(Scalar::Short),
        XsdType::Byte => raw.parse().ok().map(Scalar::Byte),
        XsdType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Scalar::Bool(true)),
            "false" | "0" => Some(Scalar::Bool(false)),
            _ => None,
        },
        XsdType::Float => raw.parse().ok().map(Scalar::Float),
        XsdType::Double => raw.parse().ok().map(Scalar::Double),
        XsdType::String
        | XsdType::Time
        | XsdType::Date
        | XsdType::DateTime
        | XsdType::Integer
        | XsdType::NonNegativeInteger
        | XsdType::Decimal
        | XsdType::Unknown => Some(Scalar::Str(raw.to_string())),
    };
    parsed.ok_or_else(|| Scalar::placeholder(xsd))
}

/// Typed leaf write: an unparsable or out-of-range value is replaced by the
/// zero placeholder of its type.
pub fn put_typed<C: Container + ?Sized>(container: &mut C, xsd: XsdType, name: &str, raw: &str, multiple: bool) {
    let value = parse_scalar(xsd, raw).unwrap_or_else(|placeholder| {
        warn!("Element {} value '{}' is not a valid {:?}, using placeholder", name, raw, xsd);
        placeholder
    });
    container.put(name, value, multiple);
}

/// String-path leaf write: an unparsable value is logged and the field dropped.
/// Returns whether the field was written.
pub fn put_str<C: Container + ?Sized>(container: &mut C, xsd: XsdType, name: &str, raw: &str, multiple: bool) -> bool {
    match parse_scalar(xsd, raw) {
        Ok(value) => {
            container.put(name, value, multiple);
            true
        }
        Err(_) => {
            warn!("Dropping element {}: '{}' is not a valid {:?}", name, raw, xsd);
            false
        }
    }
}

/// Capability set shared by every encoding.
pub trait Container: Send {
    fn kind(&self) -> EncodingKind;

    fn start_nested(&mut self, name: &str, multiple: bool);

    fn close_nested(&mut self, name: &str);

    fn put(&mut self, name: &str, value: Scalar, multiple: bool);

    fn put_typed(&mut self, xsd: XsdType, name: &str, raw: &str, multiple: bool) {
        put_typed(self, xsd, name, raw, multiple);
    }

    fn put_str(&mut self, xsd: XsdType, name: &str, raw: &str, multiple: bool) -> bool {
        put_str(self, xsd, name, raw, multiple)
    }

    fn finish(self: Box<Self>) -> WirePayload;
}

/// What a container needs to know about the record it builds.
#[derive(Debug, Clone)]
pub struct ContainerContext {
    /// Absolute base path, e.g. `/rpc-reply/rpc/show/message-vpn/vpn`.
    pub base_path: String,
    pub semp_version: String,
}

impl ContainerContext {
    pub fn new(base_path: impl Into<String>, semp_version: impl Into<String>) -> Self {
        Self { base_path: base_path.into(), semp_version: semp_version.into() }
    }

    /// Last segment of the base path; the record's own element name.
    pub fn base_element(&self) -> &str {
        self.base_path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("record")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingKind {
    TypedMap,
    Xml,
    XmlEnvelope,
    Json,
    CamelJson,
    Flat,
    Hybrid,
}

type ContainerCtor = fn(&ContainerContext) -> Box<dyn Container>;

fn new_typed_map(_: &ContainerContext) -> Box<dyn Container> {
    Box::new(typed_map::TypedMapContainer::new())
}

fn new_xml(ctx: &ContainerContext) -> Box<dyn Container> {
    Box::new(xml::XmlContainer::new(ctx, false))
}

fn new_xml_envelope(ctx: &ContainerContext) -> Box<dyn Container> {
    Box::new(xml::XmlContainer::new(ctx, true))
}

fn new_json(_: &ContainerContext) -> Box<dyn Container> {
    Box::new(json::JsonContainer::new(false))
}

fn new_camel_json(_: &ContainerContext) -> Box<dyn Container> {
    Box::new(json::JsonContainer::new(true))
}

fn new_flat(_: &ContainerContext) -> Box<dyn Container> {
    Box::new(flat::FlatKeyContainer::new())
}

fn new_hybrid(_: &ContainerContext) -> Box<dyn Container> {
    Box::new(hybrid::HybridContainer::new())
}

const ENCODINGS: &[(&str, EncodingKind, ContainerCtor)] = &[
    ("typed-map", EncodingKind::TypedMap, new_typed_map),
    ("xml", EncodingKind::Xml, new_xml),
    ("xml-envelope", EncodingKind::XmlEnvelope, new_xml_envelope),
    ("json", EncodingKind::Json, new_json),
    ("camel-json", EncodingKind::CamelJson, new_camel_json),
    ("flat", EncodingKind::Flat, new_flat),
    ("hybrid", EncodingKind::Hybrid, new_hybrid),
];

impl EncodingKind {
    pub fn from_key(key: &str) -> Result<Self> {
        ENCODINGS
            .iter()
            .find(|(k, _, _)| k.eq_ignore_ascii_case(key.trim()))
            .map(|(_, kind, _)| *kind)
            .ok_or_else(|| PumpError::UnknownEncoding(key.to_string()))
    }

    pub fn key(&self) -> &'static str {
        ENCODINGS.iter().find(|(_, kind, _)| kind == self).map(|(k, _, _)| *k).unwrap_or("unknown")
    }

    pub fn create(&self, ctx: &ContainerContext) -> Box<dyn Container> {
        let ctor = ENCODINGS
            .iter()
            .find(|(_, kind, _)| kind == self)
            .map(|(_, _, ctor)| *ctor)
            .unwrap_or(new_typed_map);
        ctor(ctx)
    }
}

/// Encoded record ready to be framed and published.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    TypedMap(BTreeMap<String, SdtValue>),
    Xml(XmlFragment),
    Json(serde_json::Value),
    Hybrid { map: BTreeMap<String, SdtValue>, json: serde_json::Value },
}

impl WirePayload {
    pub fn content_type(&self) -> &'static str {
        match self {
            WirePayload::Xml(_) => "application/xml",
            _ => "application/json",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            WirePayload::TypedMap(map) => serde_json::to_vec(map)?,
            WirePayload::Xml(fragment) => fragment.render().into_bytes(),
            WirePayload::Json(value) => serde_json::to_vec(value)?,
            WirePayload::Hybrid { map, json } => {
                serde_json::to_vec(&serde_json::json!({ "map": map, "json": json }))?
            }
        };
        Ok(bytes)
    }
}

/// Fan-out container delegating every call to one child per encoding.
pub struct ContainerSet {
    children: Vec<Box<dyn Container>>,
}

impl ContainerSet {
    pub fn new(kinds: &[EncodingKind], ctx: &ContainerContext) -> Self {
        let mut distinct: Vec<EncodingKind> = kinds.to_vec();
        distinct.sort();
        distinct.dedup();
        debug!("Opening container set {:?} for {}", distinct, ctx.base_path);
        Self { children: distinct.iter().map(|kind| kind.create(ctx)).collect() }
    }

    pub fn kinds(&self) -> Vec<EncodingKind> {
        self.children.iter().map(|c| c.kind()).collect()
    }

    pub fn start_nested(&mut self, name: &str, multiple: bool) {
        for child in &mut self.children {
            child.start_nested(name, multiple);
        }
    }

    pub fn close_nested(&mut self, name: &str) {
        for child in &mut self.children {
            child.close_nested(name);
        }
    }

    pub fn put(&mut self, name: &str, value: Scalar, multiple: bool) {
        for child in &mut self.children {
            child.put(name, value.clone(), multiple);
        }
    }

    pub fn put_typed(&mut self, xsd: XsdType, name: &str, raw: &str, multiple: bool) {
        for child in &mut self.children {
            child.put_typed(xsd, name, raw, multiple);
        }
    }

    pub fn finish(self) -> BTreeMap<EncodingKind, WirePayload> {
        self.children.into_iter().map(|c| (c.kind(), c.finish())).collect()
    }
}
