//! Byte-level transports underneath the hub protocol.
//!
//! A [`Transport`] moves opaque frames; it knows nothing about hub messages.
//! Three implementations are provided: [`WebSocketTransport`] (duplex),
//! [`ServerSentEventsTransport`] (GET event stream + POST per send) and
//! [`LongPollingTransport`] (GET loop + POST per send).

mod long_polling;
mod sse;
mod websocket;

pub use long_polling::LongPollingTransport;
pub use sse::ServerSentEventsTransport;
pub use websocket::WebSocketTransport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use http::HeaderMap;
use url::Url;

use crate::error::{Result, SignalRError};
use crate::protocol::TransferFormat;

/// Stream of frames produced by [`Transport::receive`].
pub type FrameStream = BoxStream<'static, Result<Vec<u8>>>;

/// Transport names as advertised by the negotiate endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportKind {
    /// Preference order used when the caller accepts any transport.
    pub const PREFERENCE: [TransportKind; 3] = [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::LongPolling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSockets => "WebSockets",
            Self::ServerSentEvents => "ServerSentEvents",
            Self::LongPolling => "LongPolling",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::PREFERENCE.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether this transport can carry the given payload format.
    pub fn supports(self, format: TransferFormat) -> bool {
        !(self == Self::ServerSentEvents && format == TransferFormat::Binary)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform contract over WebSocket, SSE and Long Polling.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes connectivity. Returns once `send` and `receive` are usable.
    async fn start(&self, url: &Url) -> Result<()>;

    /// Transmits one opaque frame.
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Frames received from the server until `stop` or an error.
    ///
    /// Only one subscriber is supported per started transport.
    fn receive(&self) -> FrameStream;

    /// Releases all resources. Safe to call more than once.
    async fn stop(&self) -> Result<()>;
}

/// Builds the transport selected for a connection cycle.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        kind: TransportKind,
        format: TransferFormat,
        headers: HeaderMap,
    ) -> Result<Arc<dyn Transport>>;
}

/// Factory for the stock transports, sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    http: reqwest::Client,
    long_polling_timeout: Duration,
}

impl DefaultTransportFactory {
    pub fn new(http: reqwest::Client, long_polling_timeout: Duration) -> Self {
        Self {
            http,
            long_polling_timeout,
        }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        format: TransferFormat,
        headers: HeaderMap,
    ) -> Result<Arc<dyn Transport>> {
        if !kind.supports(format) {
            return Err(SignalRError::InvalidConfiguration(format!(
                "{kind} does not support the {} transfer format",
                format.as_str()
            )));
        }
        Ok(match kind {
            TransportKind::WebSockets => Arc::new(WebSocketTransport::new(format, headers)),
            TransportKind::ServerSentEvents => {
                Arc::new(ServerSentEventsTransport::new(self.http.clone(), headers))
            }
            TransportKind::LongPolling => Arc::new(LongPollingTransport::new(
                self.http.clone(),
                headers,
                self.long_polling_timeout,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in TransportKind::PREFERENCE {
            assert_eq!(TransportKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(TransportKind::from_name("Carrier Pigeon"), None);
    }

    #[test]
    fn sse_is_text_only() {
        assert!(TransportKind::ServerSentEvents.supports(TransferFormat::Text));
        assert!(!TransportKind::ServerSentEvents.supports(TransferFormat::Binary));
        assert!(TransportKind::LongPolling.supports(TransferFormat::Binary));
    }

    #[test]
    fn factory_rejects_binary_sse() {
        let factory = DefaultTransportFactory::new(reqwest::Client::new(), Duration::from_secs(1));
        let result = factory.create(
            TransportKind::ServerSentEvents,
            TransferFormat::Binary,
            HeaderMap::new(),
        );
        assert!(matches!(result, Err(SignalRError::InvalidConfiguration(_))));
    }
}
