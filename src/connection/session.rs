//! State owned by one `start()`/`stop()` cycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_channel::oneshot;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::bus::MessageBus;
use super::keep_alive::Activity;
use crate::error::{Result, SignalRError};
use crate::protocol::{Completion, HubMessage, HubProtocol, ProtocolError};
use crate::transport::{Transport, TransportKind};

/// An encoded frame waiting for the writer task.
pub(crate) struct Outbound {
    frame: Vec<u8>,
    /// Whether writing it restarts the ping countdown. Pings do not.
    keeps_alive: bool,
}

/// An active connection cycle.
///
/// Outgoing messages are encoded here and queued for the writer task, so
/// sending never waits on the network. Cancelling `cancel` tears down every
/// task spawned for the cycle.
pub(crate) struct Session {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) transport_kind: TransportKind,
    protocol: Arc<dyn HubProtocol>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pub(crate) bus: MessageBus,
    pub(crate) cancel: CancellationToken,
    pub(crate) ping_activity: Activity,
    pub(crate) server_activity: Activity,
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        transport_kind: TransportKind,
        protocol: Arc<dyn HubProtocol>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            transport,
            transport_kind,
            protocol,
            outbound,
            bus: MessageBus::new(),
            cancel: CancellationToken::new(),
            ping_activity: Activity::default(),
            server_activity: Activity::default(),
        });
        (session, outbound_rx)
    }

    /// Queues a message; once written it counts as keep-alive activity.
    pub(crate) fn send_message(&self, message: &HubMessage) -> Result<()> {
        self.enqueue(message, true)
    }

    /// Queues a ping without restarting the ping countdown.
    pub(crate) fn send_ping(&self) -> Result<()> {
        self.enqueue(&HubMessage::Ping, false)
    }

    pub(crate) fn parse(&self, frame: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
        self.protocol.parse_messages(frame)
    }

    fn enqueue(&self, message: &HubMessage, keeps_alive: bool) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SignalRError::NotConnected);
        }
        let frame = self.protocol.write_message(message)?;
        self.outbound
            .send(Outbound { frame, keeps_alive })
            .map_err(|_| SignalRError::NotConnected)
    }

    /// Stops the transport, then cancels the cycle's tasks and fails every
    /// pending call.
    pub(crate) async fn shutdown(&self, reason: Option<String>) {
        if let Err(e) = self.transport.stop().await {
            warn!(error = %e, "Failed to stop transport");
        }
        self.cancel.cancel();
        self.bus.close(reason);
    }
}

/// Writes queued frames to the transport in order until cancelled.
///
/// `activity` is reset after each successful write of a non-ping frame.
pub(crate) async fn run_writer(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    activity: Activity,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = outbound.recv() => next,
        };
        let Some(Outbound { frame, keeps_alive }) = next else {
            return Ok(());
        };
        transport.send(frame).await?;
        if keeps_alive {
            activity.reset();
        }
    }
}

/// The completion of a blocking invocation.
///
/// Dropping it before the server answers unregisters the invocation, so a
/// caller that gives up does not leave an entry behind.
pub(crate) struct PendingCall {
    session: Weak<Session>,
    invocation_id: String,
    completion: oneshot::Receiver<Completion>,
}

impl PendingCall {
    pub(crate) fn register(session: &Arc<Session>, invocation_id: String) -> Result<Self> {
        let completion = session.bus.register_pending(invocation_id.clone())?;
        Ok(Self {
            session: Arc::downgrade(session),
            invocation_id,
            completion,
        })
    }
}

impl Future for PendingCall {
    type Output = Result<Completion, oneshot::Canceled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.completion.poll_unpin(cx)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.bus.remove(&self.invocation_id);
        }
    }
}
