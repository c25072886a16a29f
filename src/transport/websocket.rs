use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{self, SplitSink, SplitStream},
};
use http::HeaderMap;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, client::IntoClientRequest},
};
use tracing::debug;
use url::Url;

use super::{FrameStream, Transport};
use crate::error::{Result, SignalRError};
use crate::protocol::TransferFormat;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Duplex, frame-preserving WebSocket transport.
///
/// Text protocols travel as text frames, binary protocols as binary frames.
pub struct WebSocketTransport {
    format: TransferFormat,
    headers: HeaderMap,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
}

impl WebSocketTransport {
    pub fn new(format: TransferFormat, headers: HeaderMap) -> Self {
        Self {
            format,
            headers,
            sink: tokio::sync::Mutex::new(None),
            stream: Mutex::new(None),
        }
    }
}

/// Maps the hub URL onto the matching WebSocket scheme.
pub(crate) fn websocket_url(url: &Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalRError::InvalidConfiguration(format!(
                "unsupported URL scheme '{other}'"
            )));
        }
    };
    let mut ws_url = url.clone();
    ws_url
        .set_scheme(scheme)
        .map_err(|()| SignalRError::InvalidConfiguration(format!("cannot use {scheme} for {url}")))?;
    ws_url.set_fragment(None);
    Ok(ws_url)
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&self, url: &Url) -> Result<()> {
        let ws_url = websocket_url(url)?;
        debug!("WebSocket URL: {}", ws_url);

        let mut request = ws_url.as_str().into_client_request()?;
        request.headers_mut().extend(self.headers.clone());
        let (ws_stream, _) = connect_async(request).await?;
        let (sink, stream) = ws_stream.split();

        *self.sink.lock().await = Some(sink);
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SignalRError::TransportNotStarted)?;
        let message = match self.format {
            TransferFormat::Text => Message::text(
                String::from_utf8(frame).map_err(|e| SignalRError::Transport(e.to_string()))?,
            ),
            TransferFormat::Binary => Message::binary(frame),
        };
        sink.send(message).await?;
        Ok(())
    }

    fn receive(&self) -> FrameStream {
        let Some(ws_stream) = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return stream::once(async { Err(SignalRError::TransportNotStarted) }).boxed();
        };

        ws_stream
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().as_bytes().to_vec())),
                    Ok(Message::Binary(data)) => Some(Ok(data.to_vec())),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "WebSocket closed by server");
                        None
                    }
                    // Ping/Pong are answered by tungstenite itself
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed()
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "WebSocket close failed");
            }
        }
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn http_schemes_map_to_ws() {
        let url = Url::parse("http://localhost:5000/hub?id=1").unwrap();
        assert_eq!(websocket_url(&url).unwrap().as_str(), "ws://localhost:5000/hub?id=1");

        let url = Url::parse("https://example.com/hub").unwrap();
        assert_eq!(websocket_url(&url).unwrap().scheme(), "wss");

        let url = Url::parse("ftp://example.com/hub").unwrap();
        assert!(websocket_url(&url).is_err());
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let transport = WebSocketTransport::new(TransferFormat::Text, HeaderMap::new());
        assert!(matches!(
            transport.send(b"x".to_vec()).await,
            Err(SignalRError::TransportNotStarted)
        ));
        // stop is idempotent even when never started
        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn echoes_text_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() {
                    ws.send(message).await.unwrap();
                }
            }
        });

        let transport = WebSocketTransport::new(TransferFormat::Text, HeaderMap::new());
        let url = Url::parse(&format!("http://{addr}/hub")).unwrap();
        transport.start(&url).await.unwrap();

        let mut frames = transport.receive();
        transport.send(b"{\"type\":6}\x1e".to_vec()).await.unwrap();
        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(frame, b"{\"type\":6}\x1e".to_vec());

        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
        server.await.unwrap();
    }
}
