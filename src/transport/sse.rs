use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{
    Stream, StreamExt,
    stream::{self, BoxStream},
};
use http::{HeaderMap, StatusCode, header::ACCEPT};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{FrameStream, Transport};
use crate::error::{Result, SignalRError};

/// Server-Sent Events transport: one long-lived GET for receiving, one POST
/// per frame sent.
pub struct ServerSentEventsTransport {
    http: reqwest::Client,
    headers: HeaderMap,
    url: Mutex<Option<Url>>,
    events: Mutex<Option<BoxStream<'static, reqwest::Result<Bytes>>>>,
    cancel: CancellationToken,
}

impl ServerSentEventsTransport {
    pub fn new(http: reqwest::Client, headers: HeaderMap) -> Self {
        Self {
            http,
            headers,
            url: Mutex::new(None),
            events: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for ServerSentEventsTransport {
    async fn start(&self, url: &Url) -> Result<()> {
        let response = self
            .http
            .get(url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SignalRError::Transport(format!(
                "SSE connection failed with status {status}"
            )));
        }
        debug!(%url, "SSE stream opened");

        *self.url.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.clone());
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(response.bytes_stream().boxed());
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SignalRError::TransportNotStarted);
        }
        let url = self
            .url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SignalRError::TransportNotStarted)?;
        post_frame(&self.http, &self.headers, url, frame).await
    }

    fn receive(&self) -> FrameStream {
        let Some(events) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return stream::once(async { Err(SignalRError::TransportNotStarted) }).boxed();
        };
        parse_sse_events(events)
            .take_until(self.cancel.clone().cancelled_owned())
            .boxed()
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.url.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

/// POSTs one frame; shared by the SSE and Long Polling transports.
pub(super) async fn post_frame(
    http: &reqwest::Client,
    headers: &HeaderMap,
    url: Url,
    frame: Vec<u8>,
) -> Result<()> {
    let response = http
        .post(url)
        .headers(headers.clone())
        .body(frame)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SignalRError::Transport(format!(
            "send failed with status {status}"
        )));
    }
    Ok(())
}

/// Turns an SSE byte stream into one frame per event.
///
/// The `data:` lines of an event are joined with `\n`; a blank line ends the
/// event. Comments and other fields are ignored.
fn parse_sse_events<S>(byte_stream: S) -> impl Stream<Item = Result<Vec<u8>>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
    stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), Vec::new(), false),
        |(mut byte_stream, mut buffer, mut data, done)| async move {
            if done {
                return None;
            }

            loop {
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line = buffer.split_to(newline_pos + 1);
                    line.truncate(newline_pos);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }

                    if line.is_empty() {
                        if !data.is_empty() {
                            let event = std::mem::take(&mut data);
                            return Some((Ok(event), (byte_stream, buffer, data, false)));
                        }
                        continue;
                    }

                    if let Some(value) = line.strip_prefix(b"data:") {
                        let value = value.strip_prefix(b" ").unwrap_or(value);
                        if !data.is_empty() {
                            data.push(b'\n');
                        }
                        data.extend_from_slice(value);
                    }
                    continue;
                }

                match byte_stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(e.into()), (byte_stream, buffer, data, true)));
                    }
                    None => return None,
                }
            }
        },
    )
}
