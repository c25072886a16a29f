//! SignalR hub connection.
//!
//! This module drives one connection through its lifecycle:
//! - negotiating and starting a transport, then the handshake,
//! - keep-alive pings and the server timeout watchdog,
//! - routing inbound messages to pending calls and registered handlers,
//! - tearing everything down on `stop()`.

mod bus;
mod handlers;
mod keep_alive;
mod session;
mod state;
mod stream;

pub use handlers::{HandlerError, Registration};
pub use state::ConnectionState;
pub use stream::HubStream;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::StreamExt;
use http::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use self::handlers::{HandlerRegistry, dispatch};
use self::keep_alive::{WatchdogResult, run_ping_loop, run_server_timeout};
use self::session::{Outbound, PendingCall, Session, run_writer};
use crate::arguments::{FromArguments, IntoArguments};
use crate::config::{HubConnectionConfig, TransportChoice};
use crate::error::{Result, SignalRError};
use crate::negotiate::negotiate;
use crate::protocol::handshake::parse_handshake_response;
use crate::protocol::{
    Completion, HandshakeRequest, HubMessage, HubProtocol, Invocation, TransferFormat,
};
use crate::transport::{DefaultTransportFactory, FrameStream, Transport, TransportFactory, TransportKind};

const SERVER_TIMEOUT_REASON: &str =
    "Server timeout elapsed without receiving a message from the server.";

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection to a SignalR hub.
///
/// Handlers registered with [`on`](Self::on) and
/// [`on_with_result`](Self::on_with_result) survive `stop()`/`start()`
/// cycles. Dropping the connection cancels all of its background tasks.
///
/// # Example
///
/// ```no_run
/// use signalr_client::{HubConnection, HubConnectionConfig, JsonHubProtocol};
///
/// # async fn example() -> signalr_client::Result<()> {
/// let connection = HubConnection::new(
///     "http://localhost:5000/chathub",
///     JsonHubProtocol,
///     HubConnectionConfig::default(),
/// )?;
/// connection.on("ReceiveMessage", |(user, text): (String, String)| async move {
///     println!("{user}: {text}");
///     Ok(())
/// });
/// connection.start().await?;
/// connection.send("SendMessage", ("me", "hello"))?;
/// let sum: i32 = connection.invoke_with_result("Add", (1, 2)).await?;
/// connection.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct HubConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("url", &self.inner.url)
            .finish_non_exhaustive()
    }
}

struct Inner {
    url: Url,
    config: HubConnectionConfig,
    protocol: Arc<dyn HubProtocol>,
    http: reqwest::Client,
    transport_factory: Arc<dyn TransportFactory>,
    state: watch::Sender<ConnectionState>,
    handlers: HandlerRegistry,
    /// Lock order: `cycle` before `session`, `close_reason` and `connection_id`.
    cycle: Mutex<StartCycle>,
    session: Mutex<Option<Arc<Session>>>,
    close_reason: Mutex<Option<String>>,
    connection_id: Mutex<Option<String>>,
}

/// Identity of the latest `start()`.
///
/// Moves into and out of `Connecting` happen while this is locked, so a
/// start that was stopped, or overtaken by a newer start, can recognise
/// itself and back off.
#[derive(Default)]
struct StartCycle {
    generation: u64,
    /// Cancelled by `stop()`; `None` once the cycle is over.
    cancel: Option<CancellationToken>,
}

impl StartCycle {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.cancel.is_some()
    }
}

/// Where and how the transport connects.
struct Endpoint {
    url: Url,
    kind: TransportKind,
    headers: HeaderMap,
    connection_id: Option<String>,
}

/// What the inbound loop does after a frame.
enum Flow {
    Continue,
    Stop(Option<String>),
}

impl HubConnection {
    /// Creates a disconnected connection using the stock transports.
    pub fn new(
        url: &str,
        protocol: impl HubProtocol + 'static,
        config: HubConnectionConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::new();
        let factory = DefaultTransportFactory::new(http.clone(), config.long_polling_timeout);
        Self::build(url, Arc::new(protocol), config, http, Arc::new(factory))
    }

    /// Creates a disconnected connection whose transports come from `factory`.
    pub fn with_transport_factory(
        url: &str,
        protocol: impl HubProtocol + 'static,
        config: HubConnectionConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        Self::build(url, Arc::new(protocol), config, reqwest::Client::new(), factory)
    }

    fn build(
        url: &str,
        protocol: Arc<dyn HubProtocol>,
        config: HubConnectionConfig,
        http: reqwest::Client,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(SignalRError::InvalidConfiguration(
                "A valid url is required.".into(),
            ));
        }
        let url = Url::parse(url.trim())?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                config,
                protocol,
                http,
                transport_factory,
                state,
                handlers: HandlerRegistry::new(),
                cycle: Mutex::new(StartCycle::default()),
                session: Mutex::new(None),
                close_reason: Mutex::new(None),
                connection_id: Mutex::new(None),
            }),
        })
    }

    /// Connects to the hub.
    ///
    /// Does nothing unless the connection is [`ConnectionState::Disconnected`].
    /// Returns once the handshake has completed.
    ///
    /// # Errors
    ///
    /// Negotiation, transport start and handshake failures are returned here;
    /// the connection is left disconnected.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let Some((generation, cancel)) = inner.begin_start() else {
            debug!(state = %inner.state(), "Ignoring start on a connection that is not disconnected");
            return Ok(());
        };
        info!(url = %inner.url, generation, "Starting connection");

        match inner.connect(generation, &cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if inner.abandon_start(generation, &e) {
                    error!(error = %e, "Failed to start connection");
                } else {
                    debug!(error = %e, generation, "Start was stopped or superseded");
                }
                Err(e)
            }
        }
    }

    /// Disconnects and fails every pending call. Does nothing when already
    /// disconnected.
    pub async fn stop(&self) {
        self.inner.stop(None, None).await;
    }

    /// Invokes a hub method without waiting for, or expecting, a response.
    pub fn send(&self, method: &str, args: impl IntoArguments) -> Result<()> {
        let arguments = args.into_arguments()?;
        let session = self.inner.active_session()?;
        session.send_message(
            &Invocation::NonBlocking {
                target: method.to_string(),
                arguments,
            }
            .into(),
        )
    }

    /// Invokes a hub method that returns nothing and waits for it to complete.
    pub async fn invoke(&self, method: &str, args: impl IntoArguments) -> Result<()> {
        match self.invoke_completion(method, args).await? {
            Completion::Simple { .. } => Ok(()),
            Completion::Resulted { .. } => {
                warn!(method, "Invocation returned a result but none was expected; discarding it");
                Ok(())
            }
            Completion::Error { error, .. } => Err(SignalRError::Hub(error)),
        }
    }

    /// Invokes a hub method and decodes its result.
    ///
    /// # Errors
    ///
    /// * [`SignalRError::Hub`] with the server's message if the method failed;
    /// * [`SignalRError::MissingResult`] if the method completed without a value;
    /// * [`SignalRError::ResultDecode`] if the value does not decode into `R`.
    pub async fn invoke_with_result<R: DeserializeOwned>(
        &self,
        method: &str,
        args: impl IntoArguments,
    ) -> Result<R> {
        match self.invoke_completion(method, args).await? {
            Completion::Simple { .. } => Err(SignalRError::MissingResult(method.to_string())),
            Completion::Resulted { result, .. } => serde_json::from_value(result.clone())
                .map_err(|source| SignalRError::ResultDecode {
                    payload: result,
                    source,
                }),
            Completion::Error { error, .. } => Err(SignalRError::Hub(error)),
        }
    }

    async fn invoke_completion(&self, method: &str, args: impl IntoArguments) -> Result<Completion> {
        let arguments = args.into_arguments()?;
        let session = self.inner.active_session()?;
        let invocation_id = Uuid::new_v4().to_string();
        // Dropping `completion` unregisters the call, including when the send fails.
        let completion = PendingCall::register(&session, invocation_id.clone())?;

        let message = Invocation::Blocking {
            invocation_id,
            target: method.to_string(),
            arguments,
        };
        session.send_message(&message.into())?;
        drop(session);

        completion
            .await
            .map_err(|_| SignalRError::ConnectionClosed(self.close_reason()))
    }

    /// Starts a server-to-client stream.
    pub fn stream<T: DeserializeOwned>(
        &self,
        method: &str,
        args: impl IntoArguments,
    ) -> Result<HubStream<T>> {
        let arguments = args.into_arguments()?;
        let session = self.inner.active_session()?;
        let invocation_id = Uuid::new_v4().to_string();
        let items = session.bus.register_stream(invocation_id.clone())?;

        let message = HubMessage::StreamInvocation {
            invocation_id: invocation_id.clone(),
            target: method.to_string(),
            arguments,
            stream_ids: Vec::new(),
        };
        if let Err(e) = session.send_message(&message) {
            session.bus.remove(&invocation_id);
            return Err(e);
        }
        Ok(HubStream::new(invocation_id, items, Arc::downgrade(&session)))
    }

    /// Registers a handler for server calls to `target`.
    ///
    /// Any number of these may be registered per method; each runs in its own
    /// task. Errors and panics are logged.
    pub fn on<A, F, Fut>(&self, target: &str, callback: F) -> Registration
    where
        A: FromArguments + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.inner.handlers.add(target, callback)
    }

    /// Registers the handler that answers server calls to `target` expecting
    /// a result.
    ///
    /// # Errors
    ///
    /// [`SignalRError::DuplicateResultHandler`] if `target` already has one.
    pub fn on_with_result<A, R, F, Fut>(&self, target: &str, callback: F) -> Result<Registration>
    where
        A: FromArguments + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.inner.handlers.add_with_result(target, callback)
    }

    /// Removes every handler registered for `target`.
    pub fn off(&self, target: &str) {
        self.inner.handlers.remove_all(target);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Subscribes to state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Why the connection last stopped, if it stopped with an error.
    pub fn close_reason(&self) -> Option<String> {
        locked(&self.inner.close_reason).clone()
    }

    /// Connection id assigned by the negotiate endpoint.
    pub fn connection_id(&self) -> Option<String> {
        locked(&self.inner.connection_id).clone()
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        if let Some(cancel) = locked(&self.inner.cycle).cancel.take() {
            cancel.cancel();
        }
        if let Some(session) = locked(&self.inner.session).take() {
            session.cancel.cancel();
            session.bus.close(None);
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to `Connecting` and opens a new start cycle, unless the
    /// connection is not disconnected.
    fn begin_start(&self) -> Option<(u64, CancellationToken)> {
        let mut cycle = locked(&self.cycle);
        let moved = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !moved {
            return None;
        }
        let cancel = CancellationToken::new();
        cycle.generation += 1;
        cycle.cancel = Some(cancel.clone());
        *locked(&self.close_reason) = None;
        Some((cycle.generation, cancel))
    }

    /// Returns to `Disconnected` after a failed start. Leaves the state alone
    /// when a `stop()` or a newer `start()` already took over; returns whether
    /// the failure was recorded.
    fn abandon_start(&self, generation: u64, error: &SignalRError) -> bool {
        let mut cycle = locked(&self.cycle);
        if !cycle.is_current(generation) {
            return false;
        }
        cycle.cancel = None;
        self.state.send_replace(ConnectionState::Disconnected);
        *locked(&self.close_reason) = Some(error.to_string());
        true
    }

    fn active_session(&self) -> Result<Arc<Session>> {
        if self.state() != ConnectionState::Connected {
            return Err(SignalRError::NotConnected);
        }
        locked(&self.session).clone().ok_or(SignalRError::NotConnected)
    }

    async fn connect(self: &Arc<Self>, generation: u64, cancel: &CancellationToken) -> Result<()> {
        let format = self.protocol.transfer_format();
        let endpoint = tokio::select! {
            () = cancel.cancelled() => return Err(SignalRError::ClosedWhileConnecting),
            endpoint = self.resolve_endpoint(format) => endpoint?,
        };

        let transport = self
            .transport_factory
            .create(endpoint.kind, format, endpoint.headers)?;
        debug!(transport = %endpoint.kind, url = %endpoint.url, "Starting transport");

        let opened = tokio::select! {
            () = cancel.cancelled() => Err(SignalRError::ClosedWhileConnecting),
            opened = self.handshake(transport.as_ref(), &endpoint.url) => opened,
        };
        let result = opened.and_then(|(frames, leftover)| {
            self.activate(
                generation,
                transport.clone(),
                endpoint.kind,
                endpoint.connection_id,
                frames,
                leftover,
            )
        });

        if result.is_err() {
            if let Err(stop_error) = transport.stop().await {
                warn!(error = %stop_error, "Failed to stop transport");
            }
        }
        result
    }

    async fn resolve_endpoint(&self, format: TransferFormat) -> Result<Endpoint> {
        let headers = self.config.initial_headers()?;
        if self.config.skip_negotiation {
            if self.config.transport != TransportChoice::WebSockets {
                return Err(SignalRError::InvalidConfiguration(
                    "Negotiation can only be skipped when using the WebSocket transport directly."
                        .into(),
                ));
            }
            return Ok(Endpoint {
                url: self.url.clone(),
                kind: TransportKind::WebSockets,
                headers,
                connection_id: None,
            });
        }

        let negotiated = negotiate(
            &self.http,
            &self.url,
            headers,
            self.config.transport,
            format,
            self.config.max_negotiate_redirects,
        )
        .await?;
        Ok(Endpoint {
            url: negotiated.url,
            kind: negotiated.transport,
            headers: negotiated.headers,
            connection_id: Some(negotiated.connection_id),
        })
    }

    /// Starts the transport and completes the handshake. Returns the inbound
    /// frames and any bytes that followed the handshake response.
    async fn handshake(&self, transport: &dyn Transport, url: &Url) -> Result<(FrameStream, Vec<u8>)> {
        transport.start(url).await?;

        let mut frames = transport.receive();
        let request = HandshakeRequest::new(self.protocol.name(), self.protocol.version());
        transport.send(request.to_bytes()?).await?;

        let frame = match time::timeout(self.config.handshake_timeout, frames.next()).await {
            Err(_) => return Err(SignalRError::HandshakeTimeout),
            Ok(None) => {
                return Err(SignalRError::HandshakeFailed(
                    "Connection closed before the handshake completed".into(),
                ));
            }
            Ok(Some(frame)) => frame?,
        };
        let (response, rest) = parse_handshake_response(&frame)
            .map_err(|e| SignalRError::HandshakeFailed(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(SignalRError::HandshakeFailed(error));
        }
        debug!("Handshake completed");
        Ok((frames, rest.to_vec()))
    }

    /// Installs the session and moves to `Connected`, if the start cycle
    /// `generation` is still the current one.
    fn activate(
        self: &Arc<Self>,
        generation: u64,
        transport: Arc<dyn Transport>,
        kind: TransportKind,
        connection_id: Option<String>,
        frames: FrameStream,
        leftover: Vec<u8>,
    ) -> Result<()> {
        let (session, outbound) = {
            let cycle = locked(&self.cycle);
            if !cycle.is_current(generation) {
                return Err(SignalRError::ClosedWhileConnecting);
            }
            let (session, outbound) = Session::new(transport, kind, self.protocol.clone());
            *locked(&self.session) = Some(session.clone());
            *locked(&self.connection_id) = connection_id;
            self.state.send_replace(ConnectionState::Connected);
            (session, outbound)
        };
        info!(transport = %kind, "Connected");

        self.spawn_session_tasks(&session, outbound, frames, leftover);
        Ok(())
    }

    fn spawn_session_tasks(
        self: &Arc<Self>,
        session: &Arc<Session>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        frames: FrameStream,
        leftover: Vec<u8>,
    ) {
        let weak = Arc::downgrade(self);

        tokio::spawn({
            let weak = weak.clone();
            let session = session.clone();
            async move {
                let result = run_writer(
                    session.transport.clone(),
                    outbound,
                    session.ping_activity.clone(),
                    session.cancel.clone(),
                )
                .await;
                if let Err(e) = result {
                    stop_if_current(&weak, &session, format!("Failed to send message: {e}")).await;
                }
            }
        });

        tokio::spawn(run_inbound(
            weak.clone(),
            session.clone(),
            self.handlers.clone(),
            frames,
            leftover,
        ));

        // Long polling requests already act as keep-alives.
        if session.transport_kind == TransportKind::LongPolling {
            return;
        }

        let ping_session = session.clone();
        tokio::spawn(run_ping_loop(
            self.config.keep_alive_interval,
            session.ping_activity.clone(),
            session.cancel.clone(),
            move || {
                if let Err(e) = ping_session.send_ping() {
                    debug!(error = %e, "Failed to queue ping");
                }
            },
        ));

        let timeout = self.config.server_timeout;
        let session = session.clone();
        tokio::spawn(async move {
            let result = run_server_timeout(
                timeout,
                session.server_activity.clone(),
                session.cancel.clone(),
            )
            .await;
            if result == WatchdogResult::TimedOut {
                stop_if_current(&weak, &session, SERVER_TIMEOUT_REASON.to_string()).await;
            }
        });
    }

    /// Disconnects, cancelling a start in progress. With `only`, does nothing
    /// unless that session is the active one.
    async fn stop(&self, reason: Option<String>, only: Option<&Arc<Session>>) {
        let (previous, session) = {
            let mut cycle = locked(&self.cycle);
            let mut current = locked(&self.session);
            if let Some(expected) = only {
                if !current.as_ref().is_some_and(|s| Arc::ptr_eq(s, expected)) {
                    return;
                }
            }
            if let Some(cancel) = cycle.cancel.take() {
                cancel.cancel();
            }

            let mut previous = ConnectionState::Disconnected;
            self.state.send_if_modified(|state| {
                previous = std::mem::replace(state, ConnectionState::Disconnected);
                previous != ConnectionState::Disconnected
            });
            if previous != ConnectionState::Disconnected {
                *locked(&self.close_reason) = reason.clone();
                *locked(&self.connection_id) = None;
            }
            (previous, current.take())
        };

        if previous == ConnectionState::Disconnected {
            debug!("Connection already stopped");
            return;
        }
        match &reason {
            Some(reason) => warn!(%reason, "Connection stopped with an error"),
            None => info!(from = %previous, "Connection stopped"),
        }
        if let Some(session) = session {
            session.shutdown(reason).await;
        }
    }
}

/// Stops the connection if `session` is still its active cycle.
async fn stop_if_current(inner: &Weak<Inner>, session: &Arc<Session>, reason: impl Into<Option<String>>) {
    if let Some(inner) = inner.upgrade() {
        inner.stop(reason.into(), Some(session)).await;
    }
}

async fn run_inbound(
    inner: Weak<Inner>,
    session: Arc<Session>,
    handlers: HandlerRegistry,
    mut frames: FrameStream,
    leftover: Vec<u8>,
) {
    if !leftover.is_empty() {
        if let Flow::Stop(reason) = process_frame(&session, &handlers, &leftover) {
            stop_if_current(&inner, &session, reason).await;
            return;
        }
    }

    loop {
        let frame = tokio::select! {
            () = session.cancel.cancelled() => return,
            frame = frames.next() => frame,
        };
        let flow = match frame {
            Some(Ok(frame)) => {
                session.server_activity.reset();
                process_frame(&session, &handlers, &frame)
            }
            Some(Err(e)) => Flow::Stop(Some(e.to_string())),
            None => {
                debug!("Transport closed by the server");
                Flow::Stop(None)
            }
        };
        if let Flow::Stop(reason) = flow {
            stop_if_current(&inner, &session, reason).await;
            return;
        }
    }
}

fn process_frame(session: &Arc<Session>, handlers: &HandlerRegistry, frame: &[u8]) -> Flow {
    let messages = match session.parse(frame) {
        Ok(messages) => messages,
        Err(e) => {
            error!(error = %e, "Failed to parse incoming messages");
            return Flow::Stop(Some(format!("Failed to parse incoming messages: {e}")));
        }
    };

    for message in messages {
        match message {
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                debug!(?error, allow_reconnect, "Server closed the connection");
                return Flow::Stop(error);
            }
            HubMessage::Ping => {}
            HubMessage::Invocation(invocation) => {
                let matched = handlers.lookup(invocation.target());
                dispatch(session, invocation, matched);
            }
            HubMessage::Completion(completion) => session.bus.complete_invocation(completion),
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => session.bus.send_stream_item(&invocation_id, item),
            other => warn!(message_type = ?other.message_type(), "Ignoring unsupported message"),
        }
    }
    Flow::Continue
}
