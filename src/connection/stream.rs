use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures_channel::mpsc;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::session::Session;
use crate::error::{Result, SignalRError};
use crate::protocol::HubMessage;

/// Items of a server-to-client stream started with
/// [`HubConnection::stream`](super::HubConnection::stream).
///
/// The stream ends when the server completes the invocation. Dropping it
/// before then asks the server to cancel the invocation.
pub struct HubStream<T> {
    invocation_id: String,
    items: mpsc::UnboundedReceiver<Result<Value>>,
    session: Weak<Session>,
    finished: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T> HubStream<T> {
    pub(crate) fn new(
        invocation_id: String,
        items: mpsc::UnboundedReceiver<Result<Value>>,
        session: Weak<Session>,
    ) -> Self {
        Self {
            invocation_id,
            items,
            session,
            finished: false,
            _item: PhantomData,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }
}

impl<T: DeserializeOwned> Stream for HubStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.items.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(payload))) => Poll::Ready(Some(
                serde_json::from_value(payload.clone())
                    .map_err(|source| SignalRError::ResultDecode { payload, source }),
            )),
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for HubStream<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if !session.bus.remove(&self.invocation_id) {
            return;
        }
        let cancel = HubMessage::CancelInvocation {
            invocation_id: self.invocation_id.clone(),
        };
        if let Err(e) = session.send_message(&cancel) {
            debug!(invocation_id = %self.invocation_id, error = %e, "Failed to cancel stream");
        }
    }
}
