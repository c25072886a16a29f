use thiserror::Error;

/// Errors that can occur in the SignalR client.
#[derive(Error, Debug)]
pub enum SignalRError {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The negotiate endpoint answered with something other than `200 OK`.
    #[error("Negotiate request failed with status {status}: {body}")]
    NegotiateStatus { status: u16, body: String },

    /// The negotiate endpoint returned an `error` field.
    #[error("Negotiation failed: {0}")]
    NegotiateFailed(String),

    #[error("Negotiate redirection limit exceeded")]
    RedirectLimitExceeded,

    #[error("No compatible transports found on the server")]
    NoCompatibleTransport,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport is not started")]
    TransportNotStarted,

    #[error("Cannot act while connection is not active")]
    NotConnected,

    #[error("Connection closed while connecting")]
    ClosedWhileConnecting,

    /// The connection stopped before a pending invocation completed.
    #[error("Connection closed{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionClosed(Option<String>),

    /// Error text sent by the hub in a completion message.
    #[error("{0}")]
    Hub(String),

    #[error("Invocation of '{0}' completed without a result but one is required")]
    MissingResult(String),

    #[error("Failed to decode result {payload}: {source}")]
    ResultDecode {
        payload: serde_json::Value,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode argument {index}: {message}")]
    ArgumentDecode { index: usize, message: String },

    #[error("Expected {expected} arguments but received {actual}")]
    ArgumentCount { expected: usize, actual: usize },

    #[error(
        "'{0}' already has a value returning handler; multiple return values are not supported"
    )]
    DuplicateResultHandler(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for SignalRError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Shorthand for results produced by this crate.
pub type Result<T, E = SignalRError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_closed_message_includes_reason() {
        let err = SignalRError::ConnectionClosed(Some("bye".into()));
        assert_eq!(err.to_string(), "Connection closed: bye");
        assert_eq!(
            SignalRError::ConnectionClosed(None).to_string(),
            "Connection closed"
        );
    }

    #[test]
    fn hub_error_is_server_text() {
        let err = SignalRError::Hub("Custom error.".into());
        assert_eq!(err.to_string(), "Custom error.");
    }
}
