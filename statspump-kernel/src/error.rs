use thiserror::Error;

/// Failure classes raised by the pump.
///
/// Configuration variants are fatal at startup. Everything else is caught by
/// the poll cycle or bus worker that hit it, logged, and the pump carries on.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown container encoding: {0}")]
    UnknownEncoding(String),
    #[error("unknown local bus listener: {0}")]
    UnknownListener(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("SEMP request to {host} failed: {source}")]
    Http {
        host: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("appliance {0} is unreachable")]
    Unreachable(String),
    #[error("SEMP request to {host} returned HTTP {status}")]
    HttpStatus { host: String, status: u16 },
    #[error("SEMP reply reported failure: {0}")]
    SempReply(String),
    #[error("malformed SEMP reply: {0}")]
    Decode(String),
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("bus queue {0} is closed")]
    QueueClosed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PumpError {
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PumpError::Config(_)
                | PumpError::UnknownEncoding(_)
                | PumpError::UnknownListener(_)
                | PumpError::Schema(_)
                | PumpError::Yaml(_)
        )
    }

    /// Transport-level failures mean the node could not be talked to at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            PumpError::Unreachable(_) => true,
            PumpError::Http { source, .. } => source.is_connect() || source.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PumpError>;
