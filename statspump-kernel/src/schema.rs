//! Element type lookup for SEMP replies.
//!
//! The decoder asks the registry for the declared type of every leaf it
//! meets, keyed by the absolute element path (`/rpc-reply/rpc/show/...`).
//! Paths the registry does not know decode as [`XsdType::Unknown`], which the
//! containers store as plain strings.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{PumpError, Result};

/// Declared XML schema type of a reply element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum XsdType {
    String,
    Long,
    UnsignedLong,
    Int,
    UnsignedInt,
    Short,
    UnsignedShort,
    Byte,
    UnsignedByte,
    Boolean,
    Float,
    Double,
    Time,
    Date,
    DateTime,
    Integer,
    NonNegativeInteger,
    Decimal,
    Unknown,
}

impl XsdType {
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.rsplit(':').next().unwrap_or(raw);
        let ty = match name.to_ascii_lowercase().as_str() {
            "string" => XsdType::String,
            "long" => XsdType::Long,
            "unsignedlong" => XsdType::UnsignedLong,
            "int" => XsdType::Int,
            "unsignedint" => XsdType::UnsignedInt,
            "short" => XsdType::Short,
            "unsignedshort" => XsdType::UnsignedShort,
            "byte" => XsdType::Byte,
            "unsignedbyte" => XsdType::UnsignedByte,
            "boolean" => XsdType::Boolean,
            "float" => XsdType::Float,
            "double" => XsdType::Double,
            "time" => XsdType::Time,
            "date" => XsdType::Date,
            "datetime" => XsdType::DateTime,
            "integer" => XsdType::Integer,
            "nonnegativeinteger" => XsdType::NonNegativeInteger,
            "decimal" => XsdType::Decimal,
            "unknown" => XsdType::Unknown,
            _ => return None,
        };
        Some(ty)
    }
}

impl TryFrom<String> for XsdType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        XsdType::parse(&value).ok_or_else(|| format!("unknown schema type '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SchemaEntry {
    #[serde(rename = "type")]
    pub xsd_type: XsdType,
    #[serde(default)]
    pub multiple: bool,
}

impl SchemaEntry {
    pub const UNKNOWN: SchemaEntry = SchemaEntry { xsd_type: XsdType::Unknown, multiple: false };

    pub fn new(xsd_type: XsdType) -> Self {
        Self { xsd_type, multiple: false }
    }

    pub fn multiple(xsd_type: XsdType) -> Self {
        Self { xsd_type, multiple: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entries: HashMap<String, SchemaEntry>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Types of the elements the built-in maintenance pollers read.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let vpn = "/rpc-reply/rpc/show/message-vpn/vpn";
        registry.insert(format!("{vpn}/name"), SchemaEntry::new(XsdType::String));
        registry.insert(format!("{vpn}/enabled"), SchemaEntry::new(XsdType::Boolean));
        registry.insert(format!("{vpn}/operational"), SchemaEntry::new(XsdType::Boolean));
        registry.insert(format!("{vpn}/locally-configured"), SchemaEntry::new(XsdType::Boolean));
        registry.insert(format!("{vpn}/local-status"), SchemaEntry::new(XsdType::String));
        registry.insert(format!("{vpn}/unique-subscriptions"), SchemaEntry::new(XsdType::UnsignedLong));
        registry.insert(format!("{vpn}/connections"), SchemaEntry::new(XsdType::UnsignedInt));
        registry.insert("/rpc-reply/rpc/show/hostname/hostname".to_string(), SchemaEntry::new(XsdType::String));
        registry.insert(
            "/rpc-reply/rpc/show/redundancy/redundancy-mode".to_string(),
            SchemaEntry::new(XsdType::String),
        );
        registry.insert(
            "/rpc-reply/rpc/show/message-spool/message-spool-info/current-persist-usage".to_string(),
            SchemaEntry::new(XsdType::Double),
        );
        registry
    }

    /// Loads `path: {type, multiple}` entries from a YAML file on top of the builtins.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PumpError::Schema(format!("schema file {} not found", path.display())));
        }
        let text = std::fs::read_to_string(path)?;
        let loaded: HashMap<String, SchemaEntry> = serde_yaml::from_str(&text)
            .map_err(|e| PumpError::Schema(format!("{}: {e}", path.display())))?;
        let mut registry = Self::with_builtins();
        registry.entries.extend(loaded);
        Ok(registry)
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: SchemaEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn lookup(&self, path: &str) -> SchemaEntry {
        self.entries.get(path).copied().unwrap_or(SchemaEntry::UNKNOWN)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
