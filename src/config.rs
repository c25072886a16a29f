//! Connection configuration.

use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Result, SignalRError};
use crate::transport::TransportKind;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_NEGOTIATE_REDIRECTS: u32 = 100;
pub const DEFAULT_LONG_POLLING_TIMEOUT: Duration = Duration::from_secs(100);

/// Which transports the client is willing to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportChoice {
    /// Any transport the server offers, best first.
    #[default]
    All,
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportChoice {
    pub fn allows(self, kind: TransportKind) -> bool {
        match self {
            Self::All => true,
            Self::WebSockets => kind == TransportKind::WebSockets,
            Self::ServerSentEvents => kind == TransportKind::ServerSentEvents,
            Self::LongPolling => kind == TransportKind::LongPolling,
        }
    }
}

/// Settings for a [`HubConnection`](crate::HubConnection).
#[derive(Debug, Clone)]
pub struct HubConnectionConfig {
    pub transport: TransportChoice,
    /// Connect straight to the WebSocket endpoint without calling `/negotiate`.
    /// Only valid together with [`TransportChoice::WebSockets`].
    pub skip_negotiation: bool,
    /// Extra headers sent with negotiate and transport requests.
    pub headers: HeaderMap,
    /// Bearer token added as `Authorization` header.
    pub access_token: Option<String>,
    pub handshake_timeout: Duration,
    /// How long the client stays silent before sending a ping.
    pub keep_alive_interval: Duration,
    /// How long the server may stay silent before the connection is dropped.
    pub server_timeout: Duration,
    pub max_negotiate_redirects: u32,
    /// Client-side timeout of a single long-polling request.
    pub long_polling_timeout: Duration,
}

impl Default for HubConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportChoice::All,
            skip_negotiation: false,
            headers: HeaderMap::new(),
            access_token: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            max_negotiate_redirects: DEFAULT_MAX_NEGOTIATE_REDIRECTS,
            long_polling_timeout: DEFAULT_LONG_POLLING_TIMEOUT,
        }
    }
}

impl HubConnectionConfig {
    pub fn with_transport(mut self, transport: TransportChoice) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    /// Adds a header sent with every HTTP and WebSocket request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SignalRError::InvalidHeader(e.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| SignalRError::InvalidHeader(e.to_string()))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    pub fn with_max_negotiate_redirects(mut self, max: u32) -> Self {
        self.max_negotiate_redirects = max;
        self
    }

    pub fn with_long_polling_timeout(mut self, timeout: Duration) -> Self {
        self.long_polling_timeout = timeout;
        self
    }

    /// Headers for the first request: configured headers plus the access token.
    pub(crate) fn initial_headers(&self) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        if let Some(token) = &self.access_token {
            insert_bearer(&mut headers, token)?;
        }
        Ok(headers)
    }
}

/// Sets `Authorization: Bearer {token}`, replacing any previous value.
pub(crate) fn insert_bearer(headers: &mut HeaderMap, token: &str) -> Result<()> {
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| SignalRError::InvalidHeader(e.to_string()))?;
    headers.insert(http::header::AUTHORIZATION, value);
    Ok(())
}
