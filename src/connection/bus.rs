//! Correlation of server completions with waiting client calls.
//!
//! Every blocking `invoke` and every server-to-client stream registers its
//! invocation id here before the request is sent. Incoming `Completion` and
//! `StreamItem` messages are routed back by id; unmatched ones are dropped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_channel::{mpsc, oneshot};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SignalRError};
use crate::protocol::Completion;

/// A pending invocation awaiting a response from the server.
pub(crate) enum PendingInvocation {
    /// Awaiting a single `Completion` message.
    Single(oneshot::Sender<Completion>),
    /// Receiving `StreamItem` messages until a `Completion`.
    Stream(mpsc::UnboundedSender<Result<Value>>),
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<String, PendingInvocation>,
    closed: bool,
}

/// Pending calls of one connection cycle.
#[derive(Default)]
pub(crate) struct MessageBus {
    pending: Mutex<PendingTable>,
}

impl MessageBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: String, pending: PendingInvocation) -> Result<()> {
        let mut table = self.table();
        if table.closed {
            return Err(SignalRError::NotConnected);
        }
        table.entries.insert(id, pending);
        Ok(())
    }

    /// Registers a blocking invocation and returns a receiver for its completion.
    pub(crate) fn register_pending(&self, id: String) -> Result<oneshot::Receiver<Completion>> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, PendingInvocation::Single(tx))?;
        Ok(rx)
    }

    /// Registers a streaming invocation and returns a receiver for its items.
    ///
    /// The receiver ends after the `Completion`; an error completion is
    /// delivered as a final `Err` item.
    pub(crate) fn register_stream(&self, id: String) -> Result<mpsc::UnboundedReceiver<Result<Value>>> {
        let (tx, rx) = mpsc::unbounded();
        self.insert(id, PendingInvocation::Stream(tx))?;
        Ok(rx)
    }

    /// Forgets a pending invocation. Returns whether it was still pending.
    pub(crate) fn remove(&self, id: &str) -> bool {
        self.table().entries.remove(id).is_some()
    }

    /// Fulfils the waiter matching the completion's invocation id.
    pub(crate) fn complete_invocation(&self, completion: Completion) {
        let Some(pending) = self.table().entries.remove(completion.invocation_id()) else {
            debug!(
                invocation_id = %completion.invocation_id(),
                "Dropping completion for unknown invocation"
            );
            return;
        };

        match pending {
            PendingInvocation::Single(tx) => {
                let _ = tx.send(completion);
            }
            PendingInvocation::Stream(tx) => {
                if let Completion::Error { error, .. } = completion {
                    let _ = tx.unbounded_send(Err(SignalRError::Hub(error)));
                }
            }
        }
    }

    /// Sends a stream item to a pending streaming invocation.
    pub(crate) fn send_stream_item(&self, id: &str, item: Value) {
        match self.table().entries.get(id) {
            Some(PendingInvocation::Stream(tx)) => {
                let _ = tx.unbounded_send(Ok(item));
            }
            Some(PendingInvocation::Single(_)) => {
                warn!(invocation_id = %id, "Stream item received for a non-streaming invocation");
            }
            None => debug!(invocation_id = %id, "Dropping stream item for unknown invocation"),
        }
    }

    /// Fails every pending call and rejects new registrations.
    pub(crate) fn close(&self, reason: Option<String>) {
        let entries = {
            let mut table = self.table();
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        for (_, pending) in entries {
            // Dropping a oneshot sender wakes its waiter with `Canceled`.
            if let PendingInvocation::Stream(tx) = pending {
                let _ = tx.unbounded_send(Err(SignalRError::ConnectionClosed(reason.clone())));
            }
        }
    }
}
