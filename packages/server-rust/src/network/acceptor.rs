//! Connection acceptor with deferred startup and graceful drain.
//!
//! Lifecycle: `new()` allocates shared state, `start()` binds the listener
//! and reports the bound port, `serve()` accepts until shutdown and then
//! drains. Between `start()` and `serve()` the rest of the server can be
//! wired up against the registry and shutdown controller.
//!
//! Each admitted connection runs a read/frame/dispatch/reply loop, either
//! on its own task or on the worker pool. Within a connection requests are
//! handled strictly in arrival order.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::config::NetworkConfig;
use super::connection::{ConnectionGuard, ConnectionInfo, ConnectionRegistry};
use super::framing::{FrameError, RawRequest, RequestCodec};
use super::pool::WorkerPool;
use super::shutdown::{ShutdownController, ShutdownKind};

/// Reply sent before closing a connection whose request outgrew the limit.
const TOO_LONG_MESSAGE: &[u8] = b"Request message too long\n";

/// How long a rejected connection gets to receive the busy message.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// RequestProcessor
// ---------------------------------------------------------------------------

/// What the acceptor does with a framed request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Processed {
    /// Bytes to write back. Empty means write nothing.
    pub reply: Vec<u8>,
    /// Whether the connection may carry another request.
    pub keep_alive: bool,
}

impl Processed {
    #[must_use]
    pub fn reply(reply: Vec<u8>, keep_alive: bool) -> Self {
        Self { reply, keep_alive }
    }

    /// Write nothing and close.
    #[must_use]
    pub fn close() -> Self {
        Self::default()
    }
}

/// The server side of the acceptor: turns framed requests into replies.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    async fn process_request(&self, request: &RawRequest, conn: &Arc<ConnectionInfo>)
        -> Processed;

    /// When true every connection is closed after its first reply.
    fn one_request_per_connection(&self) -> bool {
        false
    }
}

/// How `serve()` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOutcome {
    pub kind: ShutdownKind,
    /// `false` if the drain timeout expired with work still in flight.
    pub drained: bool,
}

impl ServeOutcome {
    /// Process exit status for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match (self.drained, self.kind) {
            (false, _) => 2,
            (true, ShutdownKind::Loop) => 100,
            (true, ShutdownKind::Normal) => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

/// Owns the listening socket and every connection loop.
pub struct Acceptor {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    connections: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl Acceptor {
    /// Creates an acceptor without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
            connections: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.connections)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which differs from the configured one
    /// when port 0 asks the OS to choose.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Accepts connections until shutdown, then drains.
    ///
    /// Shutdown comes from `signal` resolving or from anyone calling
    /// `trigger_shutdown` on the controller. The listener is closed at once;
    /// open connections get up to `drain_timeout` to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve<P: RequestProcessor>(
        self,
        processor: Arc<P>,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<ServeOutcome> {
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let config = self.config;
        let connections = self.connections;
        let shutdown = self.shutdown;

        let signal_ctrl = Arc::clone(&shutdown);
        let signal_task = tokio::spawn(async move {
            signal.await;
            signal_ctrl.trigger_shutdown(ShutdownKind::Normal);
        });

        let pool = config.worker_pool.map(|size| {
            info!(size, "using worker pool");
            WorkerPool::start(size, config.max_connections)
        });

        let mut stop = shutdown.shutdown_receiver();
        let mut tick = tokio::time::interval(config.accept_poll_interval);
        shutdown.set_ready();

        while stop.borrow().is_none() {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tick.tick() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        admit(stream, peer, &config, &connections, &shutdown, &processor, pool.as_ref()).await;
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        drop(listener);
        signal_task.abort();
        info!(
            connections = connections.count(),
            pending_requests = shutdown.pending_count(),
            "listener closed, draining"
        );

        let deadline = tokio::time::Instant::now() + config.drain_timeout;
        let pool_drained = match pool {
            Some(pool) => {
                info!(workers = pool.size(), queued = pool.queued(), "draining worker pool");
                pool.shutdown(config.drain_timeout).await
            }
            None => true,
        };
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let drained = shutdown
            .wait_for_drain(&connections, remaining, config.drain_poll_interval)
            .await
            && pool_drained;

        let kind = shutdown.shutdown_kind().unwrap_or(ShutdownKind::Normal);
        if drained {
            info!(?kind, "drain complete");
        } else {
            warn!(
                ?kind,
                connections = connections.count(),
                pending_requests = shutdown.pending_count(),
                "drain timed out, abandoning in-flight connections"
            );
        }
        Ok(ServeOutcome { kind, drained })
    }
}

/// Admission control: either reject with the busy message or hand the
/// connection to a task/worker.
async fn admit<P: RequestProcessor>(
    stream: TcpStream,
    peer: SocketAddr,
    config: &NetworkConfig,
    connections: &Arc<ConnectionRegistry>,
    shutdown: &Arc<ShutdownController>,
    processor: &Arc<P>,
    pool: Option<&WorkerPool>,
) {
    let open = connections.count();
    if open >= config.max_connections || shutdown.is_shutting_down() {
        warn!(%peer, connections = open, "rejecting connection: server busy");
        tokio::spawn(reject(stream, Bytes::from(config.busy_message.clone())));
        return;
    }

    let slot = connections.register(peer);
    debug!(conn = slot.info().id.0, %peer, "connection admitted");
    let job = Box::pin(serve_connection(
        stream,
        slot,
        Arc::clone(processor),
        Arc::clone(shutdown),
        config.request_timeout.filter(|t| !t.is_zero()),
        config.max_request_size,
    ));
    match pool {
        Some(pool) => {
            if let Err(e) = pool.submit(job).await {
                warn!(error = %e, %peer, "dropping connection");
            }
        }
        None => {
            tokio::spawn(job);
        }
    }
}

async fn reject(mut stream: TcpStream, message: Bytes) {
    let _ = tokio::time::timeout(REJECT_WRITE_TIMEOUT, async {
        stream.write_all(&message).await?;
        stream.shutdown().await
    })
    .await;
}

enum ReadOutcome {
    Request(RawRequest),
    Closed,
    TimedOut,
    TooLarge(usize),
    Failed(std::io::Error),
}

async fn read_next(
    framed: &mut Framed<TcpStream, RequestCodec>,
    timeout: Option<Duration>,
) -> ReadOutcome {
    let next = match timeout {
        Some(limit) => match tokio::time::timeout(limit, framed.next()).await {
            Ok(next) => next,
            Err(_) => return ReadOutcome::TimedOut,
        },
        None => framed.next().await,
    };
    match next {
        Some(Ok(request)) => ReadOutcome::Request(request),
        Some(Err(FrameError::TooLarge { limit })) => ReadOutcome::TooLarge(limit),
        Some(Err(FrameError::Io(e))) => ReadOutcome::Failed(e),
        None => ReadOutcome::Closed,
    }
}

/// The per-connection loop. Holds the connection's registry slot until it returns.
async fn serve_connection<P: RequestProcessor>(
    stream: TcpStream,
    slot: ConnectionGuard,
    processor: Arc<P>,
    shutdown: Arc<ShutdownController>,
    timeout: Option<Duration>,
    max_request_size: usize,
) {
    let conn = Arc::clone(slot.info());
    let mut framed = Framed::new(stream, RequestCodec::new(max_request_size));
    let mut stop = shutdown.shutdown_receiver();

    loop {
        if stop.borrow().is_some() {
            debug!(conn = conn.id.0, "closing connection for shutdown");
            break;
        }
        let outcome = tokio::select! {
            outcome = read_next(&mut framed, timeout) => outcome,
            _ = stop.changed() => continue,
        };

        match outcome {
            ReadOutcome::Request(request) => {
                let pending = shutdown.pending_request();
                conn.record_request();
                let processed = processor.process_request(&request, &conn).await;
                if !processed.reply.is_empty() {
                    if let Err(e) = framed.send(Bytes::from(processed.reply)).await {
                        debug!(conn = conn.id.0, error = %e, "reply write failed");
                        break;
                    }
                }
                drop(pending);
                if !processed.keep_alive
                    || !request.complete
                    || processor.one_request_per_connection()
                {
                    break;
                }
            }
            ReadOutcome::Closed => break,
            ReadOutcome::TimedOut => {
                debug!(conn = conn.id.0, "closing client connection after timeout");
                break;
            }
            ReadOutcome::TooLarge(limit) => {
                warn!(conn = conn.id.0, peer = %conn.peer, limit, "request too long");
                let _ = framed.send(Bytes::from_static(TOO_LONG_MESSAGE)).await;
                break;
            }
            ReadOutcome::Failed(e) => {
                debug!(conn = conn.id.0, error = %e, "read failed");
                break;
            }
        }
    }

    drop(framed);
    debug!(
        conn = conn.id.0,
        requests = conn.requests(),
        "connection closed"
    );
    drop(slot);
}
