use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use http::{HeaderMap, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{FrameStream, Transport, sse::post_frame};
use crate::error::{Result, SignalRError};

/// Long Polling transport: repeated GETs for receiving, one POST per frame
/// sent, DELETE to end the connection.
pub struct LongPollingTransport {
    http: reqwest::Client,
    headers: HeaderMap,
    poll_timeout: Duration,
    url: Mutex<Option<Url>>,
    cancel: CancellationToken,
}

impl LongPollingTransport {
    pub fn new(http: reqwest::Client, headers: HeaderMap, poll_timeout: Duration) -> Self {
        Self {
            http,
            headers,
            poll_timeout,
            url: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn current_url(&self) -> Option<Url> {
        self.url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct PollState {
    http: reqwest::Client,
    headers: HeaderMap,
    url: Url,
    poll_timeout: Duration,
    cancel: CancellationToken,
    done: bool,
}

impl PollState {
    /// Polls until a non-empty payload, the end of the stream, or a failure.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            let request = self
                .http
                .get(self.url.clone())
                .headers(self.headers.clone())
                .timeout(self.poll_timeout)
                .send();
            let response = tokio::select! {
                () = self.cancel.cancelled() => return None,
                response = request => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Some(Err(e.into())),
            };

            match response.status() {
                StatusCode::NO_CONTENT => {
                    debug!("Long polling terminated by the server");
                    return None;
                }
                StatusCode::OK => {
                    let body = match response.bytes().await {
                        Ok(body) => body,
                        Err(e) => return Some(Err(e.into())),
                    };
                    if body.is_empty() {
                        continue;
                    }
                    return Some(Ok(body.to_vec()));
                }
                status => {
                    return Some(Err(SignalRError::Transport(format!(
                        "long polling failed with status {status}"
                    ))));
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LongPollingTransport {
    async fn start(&self, url: &Url) -> Result<()> {
        *self.url.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.clone());
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let url = self.current_url().ok_or(SignalRError::TransportNotStarted)?;
        post_frame(&self.http, &self.headers, url, frame).await
    }

    fn receive(&self) -> FrameStream {
        let Some(url) = self.current_url() else {
            return stream::once(async { Err(SignalRError::TransportNotStarted) }).boxed();
        };
        let state = PollState {
            http: self.http.clone(),
            headers: self.headers.clone(),
            url,
            poll_timeout: self.poll_timeout,
            cancel: self.cancel.clone(),
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            let frame = state.next_frame().await?;
            state.done = frame.is_err();
            Some((frame, state))
        })
        .boxed()
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let Some(url) = self.url.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };

        match self.http.delete(url).headers(self.headers.clone()).send().await {
            Ok(response) => debug!(status = %response.status(), "Long polling DELETE sent"),
            Err(e) => debug!(error = %e, "Long polling DELETE failed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> LongPollingTransport {
        LongPollingTransport::new(reqwest::Client::new(), HeaderMap::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn empty_polls_are_skipped_and_204_ends_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{\"type\":6}\x1e".to_vec()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let transport = transport();
        let url = Url::parse(&format!("{}/hub?id=1", server.uri())).unwrap();
        transport.start(&url).await.unwrap();

        let frames: Vec<_> = transport.receive().collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &b"{\"type\":6}\x1e".to_vec());
    }

    #[tokio::test]
    async fn non_200_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transport = transport();
        let url = Url::parse(&format!("{}/hub", server.uri())).unwrap();
        transport.start(&url).await.unwrap();

        let frames: Vec<_> = transport.receive().collect().await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(SignalRError::Transport(_))));
    }

    #[tokio::test]
    async fn stop_deletes_once() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/hub"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hub"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport();
        let url = Url::parse(&format!("{}/hub", server.uri())).unwrap();
        transport.start(&url).await.unwrap();
        transport.send(b"x".to_vec()).await.unwrap();

        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
        assert!(matches!(
            transport.send(b"x".to_vec()).await,
            Err(SignalRError::TransportNotStarted)
        ));
    }
}
