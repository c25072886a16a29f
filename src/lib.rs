//! Rust client for ASP.NET Core SignalR.
//!
//! This crate implements the client side of the SignalR hub protocol:
//! negotiation, the WebSocket, Server-Sent Events and Long Polling
//! transports, the JSON and MessagePack hub protocols, keep-alive handling
//! and server-to-client method calls.
//!
//! # Quick start
//!
//! ```no_run
//! use signalr_client::{HubConnection, HubConnectionConfig, JsonHubProtocol};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = HubConnection::new(
//!         "http://localhost:5000/chathub",
//!         JsonHubProtocol,
//!         HubConnectionConfig::default(),
//!     )?;
//!
//!     connection.on_with_result("GetClientTime", |_: ()| async { Ok(42) })?;
//!     connection.start().await?;
//!
//!     connection.invoke("SendMessage", ("user", "hello")).await?;
//!
//!     connection.stop().await;
//!     Ok(())
//! }
//! ```

pub mod arguments;
pub mod config;
pub mod connection;
pub mod error;
pub mod negotiate;
pub mod protocol;
pub mod transport;

pub use arguments::{FromArguments, IntoArguments};
pub use config::{HubConnectionConfig, TransportChoice};
pub use connection::{ConnectionState, HandlerError, HubConnection, HubStream, Registration};
pub use error::{Result, SignalRError};
pub use protocol::{
    Completion, HubMessage, HubProtocol, Invocation, JsonHubProtocol, MessagePackHubProtocol,
    ProtocolError, TransferFormat,
};
pub use transport::{DefaultTransportFactory, Transport, TransportFactory, TransportKind};
