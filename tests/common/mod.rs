#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc as futures_mpsc;
use futures_util::StreamExt;
use http::HeaderMap;
use signalr_client::transport::FrameStream;
use signalr_client::{
    HubConnection, HubConnectionConfig, JsonHubProtocol, Result, SignalRError, TransferFormat,
    Transport, TransportChoice, TransportFactory, TransportKind,
};
use tokio::sync::mpsc;
use url::Url;

pub const PING: &str = "{\"type\":6}\u{1e}";
pub const HANDSHAKE_REQUEST: &str = "{\"protocol\":\"json\",\"version\":1}\u{1e}";

/// In-memory transport driven by a [`ServerSide`].
pub struct MockTransport {
    incoming_tx: futures_mpsc::UnboundedSender<Result<Vec<u8>>>,
    incoming_rx: Mutex<Option<futures_mpsc::UnboundedReceiver<Result<Vec<u8>>>>>,
    sent_tx: mpsc::UnboundedSender<Vec<u8>>,
    handshake_reply: Option<Vec<u8>>,
    handshake_sent: AtomicBool,
    pub started_urls: Mutex<Vec<Url>>,
    pub stop_calls: AtomicUsize,
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, url: &Url) -> Result<()> {
        self.started_urls.lock().unwrap().push(url.clone());
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.stop_calls.load(Ordering::SeqCst) > 0 {
            return Err(SignalRError::TransportNotStarted);
        }
        let first = !self.handshake_sent.swap(true, Ordering::SeqCst);
        let _ = self.sent_tx.send(frame);
        if first {
            if let Some(reply) = &self.handshake_reply {
                let _ = self.incoming_tx.unbounded_send(Ok(reply.clone()));
            }
        }
        Ok(())
    }

    fn receive(&self) -> FrameStream {
        match self.incoming_rx.lock().unwrap().take() {
            Some(rx) => rx.boxed(),
            None => futures_util::stream::empty().boxed(),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The "server" end of a [`MockTransport`].
pub struct ServerSide {
    incoming: futures_mpsc::UnboundedSender<Result<Vec<u8>>>,
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ServerSide {
    /// Delivers a frame to the client as is.
    pub fn push(&self, frame: &str) {
        self.incoming
            .unbounded_send(Ok(frame.as_bytes().to_vec()))
            .unwrap();
    }

    /// Delivers one JSON message followed by the record separator.
    pub fn push_message(&self, json: &str) {
        self.push(&format!("{json}\u{1e}"));
    }

    pub fn fail(&self, message: &str) {
        self.incoming
            .unbounded_send(Err(SignalRError::Transport(message.into())))
            .unwrap();
    }

    /// Next frame sent by the client, pings included.
    pub async fn next_frame(&mut self) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("timed out waiting for a sent frame")
            .expect("transport dropped");
        String::from_utf8(frame).unwrap()
    }

    /// Next non-ping message sent by the client, without the record separator.
    pub async fn next_message(&mut self) -> String {
        loop {
            let frame = self.next_frame().await;
            if frame != PING {
                return frame.trim_end_matches('\u{1e}').to_string();
            }
        }
    }

    /// Every frame sent so far that has not been read yet.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(String::from_utf8(frame).unwrap());
        }
        frames
    }
}

/// Hands out one shared [`MockTransport`] and records the kinds requested.
pub struct MockTransportFactory {
    transport: Arc<MockTransport>,
    pub kinds: Mutex<Vec<TransportKind>>,
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        _format: TransferFormat,
        _headers: HeaderMap,
    ) -> Result<Arc<dyn Transport>> {
        self.kinds.lock().unwrap().push(kind);
        Ok(self.transport.clone())
    }
}

/// Hands out a different [`MockTransport`] for each start, in order.
pub struct SequenceFactory {
    transports: Mutex<VecDeque<Arc<MockTransport>>>,
}

impl TransportFactory for SequenceFactory {
    fn create(
        &self,
        _kind: TransportKind,
        _format: TransferFormat,
        _headers: HeaderMap,
    ) -> Result<Arc<dyn Transport>> {
        let transport = self
            .transports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SignalRError::Transport("no transport left".into()))?;
        Ok(transport)
    }
}

/// A disconnected connection whose starts use `transports` one by one.
pub fn connection_over(transports: Vec<Arc<MockTransport>>) -> HubConnection {
    let factory = Arc::new(SequenceFactory {
        transports: Mutex::new(transports.into()),
    });
    HubConnection::with_transport_factory(
        "http://example.com/hub",
        JsonHubProtocol,
        direct_websocket_config(),
        factory,
    )
    .unwrap()
}

pub fn mock_transport(handshake_reply: Option<&str>) -> (Arc<MockTransport>, ServerSide) {
    let (incoming_tx, incoming_rx) = futures_mpsc::unbounded();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        incoming_tx: incoming_tx.clone(),
        incoming_rx: Mutex::new(Some(incoming_rx)),
        sent_tx,
        handshake_reply: handshake_reply.map(|r| r.as_bytes().to_vec()),
        handshake_sent: AtomicBool::new(false),
        started_urls: Mutex::new(Vec::new()),
        stop_calls: AtomicUsize::new(0),
    });
    let server = ServerSide {
        incoming: incoming_tx,
        sent: sent_rx,
    };
    (transport, server)
}

pub fn direct_websocket_config() -> HubConnectionConfig {
    HubConnectionConfig::default()
        .with_skip_negotiation(true)
        .with_transport(TransportChoice::WebSockets)
}

pub struct TestConnection {
    pub connection: HubConnection,
    pub transport: Arc<MockTransport>,
    pub factory: Arc<MockTransportFactory>,
    pub server: ServerSide,
}

/// A disconnected connection over a mock transport that answers the
/// handshake with `handshake_reply`.
pub fn test_connection(
    url: &str,
    config: HubConnectionConfig,
    handshake_reply: Option<&str>,
) -> TestConnection {
    let (transport, server) = mock_transport(handshake_reply);
    let factory = Arc::new(MockTransportFactory {
        transport: transport.clone(),
        kinds: Mutex::new(Vec::new()),
    });
    let connection =
        HubConnection::with_transport_factory(url, JsonHubProtocol, config, factory.clone())
            .unwrap();
    TestConnection {
        connection,
        transport,
        factory,
        server,
    }
}

/// A started connection whose handshake frame has already been consumed.
pub async fn connected(config: HubConnectionConfig) -> TestConnection {
    let mut test = test_connection("http://example.com/hub", config, Some("{}\u{1e}"));
    test.connection.start().await.unwrap();
    assert_eq!(test.server.next_frame().await, HANDSHAKE_REQUEST);
    test
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
