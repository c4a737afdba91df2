//! Messages, endpoints, the endpoint registry and TCP sessions for gate.
//!
//! A [`TcpSession`] owns one socket and runs a reader task and a writer
//! task. Inbound frames become pooled [`Message`]s tagged with their
//! owning session and pushed onto a caller-supplied receive queue; outbound
//! messages go through a bounded queue drained by the writer. Faults are
//! reported once per session on an error queue.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gate_session::{Endpoint, EndpointRegistry, SendMode, TcpSession};
//! use gate_wire::NodeAddress;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let listener = gate_session::listen_tcp("127.0.0.1:7000".parse()?).await?;
//! let registry = EndpointRegistry::new();
//! let (recv_tx, mut recv_rx) = mpsc::channel(1024);
//! let (err_tx, _err_rx) = mpsc::channel(64);
//!
//! let (stream, _) = listener.accept().await?;
//! let session = TcpSession::new(stream, 256);
//! let node = NodeAddress::gateway_session(1, 1);
//! session.set_node(node);
//! session.set_recv_queue(recv_tx);
//! session.set_error_queue(err_tx);
//! registry.insert(node, session.clone());
//! session.start(CancellationToken::new())?;
//!
//! while let Some(msg) = recv_rx.recv().await {
//!     if let Some(owner) = msg.session().cloned() {
//!         owner.send_message(msg, SendMode::Blocking).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod error;
pub mod message;
pub mod registry;
pub mod stream;
pub mod tcp;
pub mod transport;

// Re-export main types
pub use endpoint::{Endpoint, SendMode, UserData};
pub use error::SessionError;
pub use message::{read_message, Body, CborBody, Message, MessagePool, PoolStats};
pub use registry::EndpointRegistry;
pub use stream::{SessionFault, SessionState, SessionStats, StreamSessionBase};
pub use tcp::{SessionConfig, TcpSession, WRITER_GRACE};
pub use transport::{connect_tcp, listen_tcp};
