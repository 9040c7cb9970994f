//! The RPC server: binds the method registry to the acceptor.
//!
//! Binary-framed requests are decoded and dispatched by opname. HTTP
//! requests go through the router in [`super::router`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rpcserve_core::{Protocol, RequestEnvelope};
use tracing::{debug, error, info};

use super::admin::{HealthProbe, TcpProbe};
use super::config::ServerConfig;
use super::recording::TrafficRecorder;
use crate::method::{DispatchEnv, MethodRegistry, SessionConfig};
use crate::network::acceptor::{Acceptor, Processed, RequestProcessor, ServeOutcome};
use crate::network::config::NetworkConfig;
use crate::network::connection::{ConnectionInfo, ConnectionRegistry};
use crate::network::framing::{self, Framing, RawRequest};
use crate::network::shutdown::ShutdownController;
use crate::tracker::CallTracker;

/// Dispatches framed requests to registered methods and admin pages.
pub struct RpcServer {
    pub(super) config: ServerConfig,
    pub(super) network: NetworkConfig,
    pub(super) registry: Arc<MethodRegistry>,
    pub(super) tracker: Arc<CallTracker>,
    pub(super) recorder: TrafficRecorder,
    pub(super) shutdown: Arc<ShutdownController>,
    pub(super) connections: Arc<ConnectionRegistry>,
    pub(super) health: Box<dyn HealthProbe>,
    pub(super) session: Arc<SessionConfig>,
    pub(super) port: u16,
}

impl RpcServer {
    /// Binds the listener and wires a server to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn bind(
        config: ServerConfig,
        network: NetworkConfig,
        registry: MethodRegistry,
    ) -> anyhow::Result<BoundServer> {
        let mut acceptor = Acceptor::new(network);
        let port = acceptor.start().await?;
        let server = Self::new(config, registry, &acceptor, port);
        Ok(BoundServer { acceptor, server })
    }

    /// Wires a server to an acceptor that is already listening on `port`.
    #[must_use]
    pub fn new(config: ServerConfig, registry: MethodRegistry, acceptor: &Acceptor, port: u16) -> Self {
        Self {
            recorder: TrafficRecorder::new(&config.recording, port),
            health: Box::new(TcpProbe::new(config.health.clone())),
            session: Arc::new(config.session.clone()),
            network: acceptor.config().clone(),
            registry: Arc::new(registry),
            tracker: Arc::new(CallTracker::new()),
            shutdown: acceptor.shutdown_controller(),
            connections: acceptor.connections(),
            config,
            port,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn tracker(&self) -> Arc<CallTracker> {
        Arc::clone(&self.tracker)
    }

    /// Live connections, shared with the acceptor.
    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.connections)
    }

    #[must_use]
    pub fn recorder(&self) -> &TrafficRecorder {
        &self.recorder
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Reverse-proxy rules for the served methods.
    #[must_use]
    pub fn proxy_config(&self) -> String {
        self.registry.proxy_config(self.port)
    }

    pub(super) fn dispatch_env(&self, conn: &Arc<ConnectionInfo>) -> DispatchEnv {
        DispatchEnv {
            connection: Arc::clone(conn),
            session: Arc::clone(&self.session),
            limits: self.config.response_limits(),
            registry: Some(Arc::clone(&self.registry)),
        }
    }

    /// Runs one binary-framed call and returns the framed reply.
    ///
    /// `None` means nothing is sent back: the frame did not decode or
    /// named no registered method. `metadata` is folded into the decoded
    /// request when the call was tunnelled through HTTP.
    pub(super) async fn dispatch_binary(
        &self,
        frame: &[u8],
        conn: &Arc<ConnectionInfo>,
        metadata: Option<&RequestEnvelope>,
    ) -> Option<Vec<u8>> {
        let mut request = match RequestEnvelope::from_frame(frame) {
            Ok(request) => request,
            Err(e) => {
                info!(conn = conn.id.0, peer = %conn.peer, error = %e, "invalid rpc request");
                return None;
            }
        };
        debug!(conn = conn.id.0, peer = %conn.peer, opname = %request.opname, "rpc request");

        let Some(handler) = self.registry.get(&request.opname) else {
            info!(conn = conn.id.0, opname = %request.opname, "undefined opname received");
            return None;
        };
        let name = handler.name().to_string();
        let input_json = handler.to_json(&request.payload, false);
        let recording = handler.can_record() && self.recorder.is_recording();
        if recording {
            self.recorder.record_input(&name, &input_json);
        }
        let call = self.tracker.begin(&name, Protocol::Binary, input_json);

        if let Some(metadata) = metadata {
            request.merge_metadata(metadata);
        }
        let reply = handler.process_binary(&self.dispatch_env(conn), &request).await;
        drop(call);

        if recording {
            let output = if reply.success {
                handler.output_to_json(&reply.payload)
            } else {
                reply.error_message()
            };
            self.recorder.record_output(&name, reply.success, &output);
        }

        match reply.to_frame() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(opname = %name, error = %e, "failed to encode reply");
                None
            }
        }
    }
}

#[async_trait]
impl RequestProcessor for RpcServer {
    async fn process_request(&self, request: &RawRequest, conn: &Arc<ConnectionInfo>) -> Processed {
        if !request.complete && framing::is_complete(&request.bytes).is_none() {
            debug!(conn = conn.id.0, len = request.bytes.len(), "dropping incomplete request");
            return Processed::close();
        }
        match request.framing {
            Framing::Binary => match self.dispatch_binary(&request.bytes, conn, None).await {
                Some(reply) => Processed::reply(reply, true),
                None => Processed::close(),
            },
            Framing::Http => self.process_http(&request.bytes, conn).await,
        }
    }

    fn one_request_per_connection(&self) -> bool {
        self.config.one_request_per_connection
    }
}

// ---------------------------------------------------------------------------
// BoundServer
// ---------------------------------------------------------------------------

/// A server whose listener is bound but not yet accepting.
pub struct BoundServer {
    acceptor: Acceptor,
    server: RpcServer,
}

impl BoundServer {
    #[must_use]
    pub fn port(&self) -> u16 {
        self.server.port
    }

    #[must_use]
    pub fn server(&self) -> &RpcServer {
        &self.server
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        self.acceptor.shutdown_controller()
    }

    /// Replaces the outbound connectivity check behind `_health`.
    #[must_use]
    pub fn with_health_probe(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.server.health = Box::new(probe);
        self
    }

    /// Accepts connections until shutdown, then drains.
    ///
    /// # Errors
    ///
    /// Propagates acceptor failures.
    pub async fn serve(
        self,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<ServeOutcome> {
        info!(
            port = self.server.port,
            methods = self.server.registry.len(),
            identities = %self.server.registry.identities().join(","),
            "serving"
        );
        info!("sample proxy config:\n{}", self.server.proxy_config());
        self.acceptor.serve(Arc::new(self.server), signal).await
    }
}
