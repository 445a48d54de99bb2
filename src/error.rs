use thiserror::Error;

/// Failures of the acquisition pipeline.
///
/// Startup variants (`Config`, `ConnectTimeout`, `Connect`, `Bind`) end the
/// process. Everything else is scoped to a single tick or message and is only
/// logged by the loop that hit it.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("unable to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: rumqttc::ConnectionError,
    },
    #[error("cannot start metrics exporter on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("timed out {0}")]
    Timeout(String),
    #[error("broker rejected subscription to {filter:?}")]
    SubscriptionRejected { filter: String },
    #[error("MQTT session closed before the broker answered")]
    SessionClosed,
    #[error("unable to encode probe request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("sink {sink} rejected update: {reason}")]
    Sink { sink: &'static str, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A payload that could not be turned into a reading. Always carries the
/// offending payload so it can be logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unable to unmarshal message payload {payload:?}: {reason}")]
    Json { payload: String, reason: String },
    #[error("expected exactly two tokens in {payload:?}")]
    TokenCount { payload: String },
    #[error("unsupported unit in {payload:?}, expected kW")]
    Unit { payload: String },
    #[error("invalid number in {payload:?}")]
    Number { payload: String },
    #[error("power value in {payload:?} does not fit an unsigned 16-bit watt reading")]
    OutOfRange { payload: String },
}

impl ParseError {
    pub fn payload(&self) -> &str {
        match self {
            ParseError::Json { payload, .. }
            | ParseError::TokenCount { payload }
            | ParseError::Unit { payload }
            | ParseError::Number { payload }
            | ParseError::OutOfRange { payload } => payload,
        }
    }
}
