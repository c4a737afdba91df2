//! Gateway binary.
//!
//! Accepts client TCP connections, wraps each one in a session with a
//! gateway-scoped node address, and echoes inbound messages back to the
//! session they arrived on.

use anyhow::Context;
use clap::Parser;
use gate_session::{
    listen_tcp, Endpoint, EndpointRegistry, Message, MessagePool, SendMode, SessionError,
    SessionFault, TcpSession,
};
use gate_wire::NodeAddress;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::GateConfig;
use logging::GateLogFormatter;

/// Gateway accepting client sessions
#[derive(Parser, Debug)]
#[command(name = "gate", version, about = "Gateway for framed client sessions")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Listen address, e.g. 0.0.0.0:7000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Gateway instance id
    #[arg(long)]
    gateway_id: Option<u16>,

    /// Per-frame read deadline, e.g. 60s
    #[arg(long)]
    read_timeout: Option<humantime::Duration>,

    /// Per-session outbound queue capacity
    #[arg(long)]
    send_queue_size: Option<usize>,

    /// Treat peers as trusted intranet nodes
    #[arg(long)]
    intranet: bool,
}

impl Args {
    fn apply(&self, config: &mut GateConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(gateway_id) = self.gateway_id {
            config.gateway_id = gateway_id;
        }
        if let Some(timeout) = self.read_timeout {
            config.read_timeout = Duration::from(timeout);
        }
        if let Some(size) = self.send_queue_size {
            config.send_queue_size = size;
        }
        if self.intranet {
            config.intranet = true;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("gate={}", args.log_level).parse()?)
        .add_directive(format!("gate_session={}", args.log_level).parse()?)
        .add_directive(format!("gate_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(GateLogFormatter::new("gate".to_string()))
        .init();

    info!("Starting gate v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GateConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let listener = listen_tcp(config.listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let registry = Arc::new(EndpointRegistry::new());
    let pool = Arc::new(MessagePool::new(config.pool_capacity));
    let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue_size);
    let (err_tx, err_rx) = mpsc::channel(config.error_queue_size);
    let shutdown = CancellationToken::new();

    let dispatcher = tokio::spawn(dispatch_loop(recv_rx, Arc::clone(&pool)));
    let fault_consumer = tokio::spawn(fault_loop(err_rx, Arc::clone(&registry)));

    let gateway = Gateway {
        config,
        registry: Arc::clone(&registry),
        pool,
        recv_tx,
        err_tx,
        next_session: AtomicU32::new(1),
    };

    tokio::select! {
        res = gateway.accept_loop(&listener, &shutdown) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful close first so queued replies are flushed, then cancel stragglers
    registry.close_all().await;
    shutdown.cancel();
    drop(gateway);

    let _ = dispatcher.await;
    let _ = fault_consumer.await;
    info!("gate stopped");
    Ok(())
}

struct Gateway {
    config: GateConfig,
    registry: Arc<EndpointRegistry>,
    pool: Arc<MessagePool>,
    recv_tx: mpsc::Sender<Message>,
    err_tx: mpsc::Sender<SessionFault>,
    next_session: AtomicU32,
}

impl Gateway {
    async fn accept_loop(
        &self,
        listener: &TcpListener,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            if let Err(e) = stream.set_nodelay(true) {
                component_warn!("accept", "set_nodelay failed for {}: {}", peer, e);
            }

            let session = TcpSession::with_config(
                stream,
                &self.config.session_config(),
                Arc::clone(&self.pool),
                self.config.codec(),
            );
            let node = self.allocate_node();
            session.set_node(node);
            session.set_recv_queue(self.recv_tx.clone());
            session.set_error_queue(self.err_tx.clone());

            if !self.registry.insert_if_absent(node, session.clone()) {
                component_warn!("accept", "node {} already registered, dropping {}", node, peer);
                session.close().await;
                continue;
            }

            if let Err(e) = Arc::clone(&session).start(shutdown.child_token()) {
                component_warn!("accept", "failed to start session {}: {}", node, e);
                self.registry.remove(node);
                session.close().await;
                continue;
            }
            component_info!("accept", "session {} registered for {}", node, peer);
        }
    }

    fn allocate_node(&self) -> NodeAddress {
        let mut id = self.next_session.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            id = self.next_session.fetch_add(1, Ordering::Relaxed);
        }
        NodeAddress::gateway_session(self.config.gateway_id, id)
    }
}

/// Placeholder handler: send every message back to the session it came from
async fn dispatch_loop(mut rx: mpsc::Receiver<Message>, pool: Arc<MessagePool>) {
    while let Some(msg) = rx.recv().await {
        let Some(owner) = msg.session().cloned() else {
            pool.release(msg);
            continue;
        };
        component_debug!(
            "dispatch",
            "echo command={} seq={} to {}",
            msg.command,
            msg.seq,
            owner.node()
        );
        match owner.send_message(msg, SendMode::NonBlocking).await {
            Ok(()) => {}
            Err(SessionError::OutboundOverflow) => {
                component_warn!("dispatch", "outbound queue full for {}, reply dropped", owner.node());
            }
            Err(e) => {
                component_debug!("dispatch", "reply to {} not sent: {}", owner.node(), e);
            }
        }
    }
    info!("dispatch loop finished, pool {:?}", pool.stats());
}

/// Log every fault and drop the failed session from the registry
async fn fault_loop(mut rx: mpsc::Receiver<SessionFault>, registry: Arc<EndpointRegistry>) {
    while let Some(fault) = rx.recv().await {
        match &fault.reason {
            SessionError::PeerClosed | SessionError::Cancelled => {
                component_info!("fault", "session {} ({}) ended: {}", fault.node, fault.remote_addr, fault.reason);
            }
            reason => {
                component_error!("fault", "session {} ({}) failed: {}", fault.node, fault.remote_addr, reason);
            }
        }
        registry.remove(fault.node);
    }
}
