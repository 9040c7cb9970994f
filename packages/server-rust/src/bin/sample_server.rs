//! Sample RPC server hosting a few arithmetic methods.
//!
//! Run with `--help` for options. Every option also reads an `RPC_*`
//! environment variable.

use std::fmt::Write as _;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::Parser;
use rpcserve_core::{MethodStatus, RequestEnvelope};
use rpcserve_server::method::{
    method_fn, CallContext, DispatchEnv, ForwardEntry, MockOutcome, RegistryBuilder, ServerMethod,
    SessionConfig, StaticDirectory,
};
use rpcserve_server::network::{ConnectionId, ConnectionInfo, NetworkConfig};
use rpcserve_server::service::{HealthConfig, RecordingConfig, RpcServer, ServerConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rpc-sample-server")]
struct Args {
    #[arg(long, env = "RPC_HOST", default_value = "0.0.0.0")]
    host: String,

    /// 0 picks a free port.
    #[arg(long, env = "RPC_PORT", default_value_t = 8080)]
    port: u16,

    /// Comma-separated server identities to serve.
    #[arg(long, env = "RPC_IDENTITIES", default_value = "calc")]
    identities: String,

    #[arg(long, env = "RPC_MAX_CONNECTIONS", default_value_t = 1024)]
    max_connections: usize,

    /// Per-request read timeout in seconds; 0 waits forever.
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,

    #[arg(long, env = "RPC_MAX_REQUEST_SIZE", default_value_t = 100_000_000)]
    max_request_size: usize,

    #[arg(long, env = "RPC_MAX_BINARY_RESPONSE_SIZE", default_value_t = 100_000_000)]
    max_binary_response_size: usize,

    #[arg(long, env = "RPC_MAX_JSON_RESPONSE_SIZE", default_value_t = 100_000_000)]
    max_json_response_size: usize,

    /// Serve connections from a fixed pool of workers.
    #[arg(long, env = "RPC_WORKER_POOL")]
    worker_pool: bool,

    #[arg(long, env = "RPC_POOL_SIZE", default_value_t = NetworkConfig::DEFAULT_POOL_SIZE)]
    pool_size: usize,

    /// Close each connection after one reply.
    #[arg(long, env = "RPC_ONE_REQUEST_PER_CONNECTION")]
    one_request_per_connection: bool,

    /// Drain limit in seconds; defaults to the request timeout.
    #[arg(long, env = "RPC_DRAIN_TIMEOUT_SECS")]
    drain_timeout_secs: Option<u64>,

    #[arg(long, env = "RPC_WEBROOT", default_value = ".")]
    webroot: PathBuf,

    /// Pretty-print JSON replies by default.
    #[arg(long, env = "RPC_DEBUG_JSON")]
    debug_json: bool,

    #[arg(long, env = "RPC_RECORD_INPUT", default_value = "recorded_input")]
    record_input: PathBuf,

    #[arg(long, env = "RPC_RECORD_OUTPUT")]
    record_output: Option<PathBuf>,

    #[arg(long, env = "RPC_MAX_RECORDING_SECS", default_value_t = 3600)]
    max_recording_secs: u64,

    /// Targets for the `_health` connectivity probe.
    #[arg(long, env = "RPC_HEALTH_TARGETS", value_delimiter = ',')]
    health_targets: Vec<SocketAddr>,

    /// Address of a `math` server to forward `REMOTE_ADD` to.
    #[arg(long, env = "RPC_MATH_SERVER")]
    math_server: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "RPC_LOG_JSON")]
    log_json: bool,

    /// Run every method's self-check and exit.
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn network_config(&self) -> NetworkConfig {
        let request_timeout = (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs));
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            max_connections: self.max_connections,
            request_timeout,
            max_request_size: self.max_request_size,
            worker_pool: self.worker_pool.then_some(self.pool_size),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs.unwrap_or(self.timeout_secs)),
            ..NetworkConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            identities: self.identities.clone(),
            webroot: self.webroot.clone(),
            debug_json: self.debug_json,
            max_binary_response_size: self.max_binary_response_size,
            max_json_response_size: self.max_json_response_size,
            one_request_per_connection: self.one_request_per_connection,
            recording: RecordingConfig {
                input_path: self.record_input.clone(),
                output_path: self.record_output.clone(),
                max_duration: Duration::from_secs(self.max_recording_secs),
            },
            session: SessionConfig::default(),
            health: HealthConfig {
                targets: self.health_targets.clone(),
                ..HealthConfig::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Pair {
    a: i64,
    b: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Empty {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Triple {
    a: i64,
    b: i64,
    c: i64,
}

struct Add;

#[async_trait]
impl ServerMethod for Add {
    type Input = Pair;
    type Output = i64;

    async fn call(&self, _ctx: &mut CallContext, input: Pair) -> Result<i64, String> {
        input
            .a
            .checked_add(input.b)
            .ok_or_else(|| "integer overflow".to_string())
    }

    /// `ADD:<n>` answers `n`.
    async fn mock(&self, _ctx: &mut CallContext, mock_type: &str, _input: &Pair) -> MockOutcome<i64> {
        mock_type.parse().map_or(MockOutcome::Failure, MockOutcome::Success)
    }

    async fn validate(&self, ctx: &mut CallContext, out: &mut String) -> MethodStatus {
        match self.call(ctx, Pair { a: 1, b: 10 }).await {
            Ok(11) => MethodStatus::Valid,
            other => {
                let _ = writeln!(out, "1 + 10 gave {other:?}");
                MethodStatus::Invalid
            }
        }
    }
}

/// Adds three numbers by cascading to `ADD` twice.
struct Add3;

#[async_trait]
impl ServerMethod for Add3 {
    type Input = Triple;
    type Output = i64;

    async fn call(&self, ctx: &mut CallContext, input: Triple) -> Result<i64, String> {
        let ab: i64 = ctx.cascade("ADD", Pair { a: input.a, b: input.b }).await?;
        ctx.cascade("ADD", Pair { a: ab, b: input.c }).await
    }
}

fn registry_builder(math_server: Option<SocketAddr>) -> anyhow::Result<RegistryBuilder> {
    let mut builder = RegistryBuilder::new();
    builder
        .register("calc", "ADD", Pair { a: 1, b: 10 }, Add)?
        .register("calc", "ADD3", Triple { a: 1, b: 2, c: 3 }, Add3)?
        .register(
            "calc",
            "SUB",
            Pair { a: 10, b: 1 },
            method_fn(|_ctx: &mut CallContext, p: Pair| {
                p.a.checked_sub(p.b).ok_or_else(|| "integer overflow".to_string())
            }),
        )?
        .register(
            "all",
            "WHOAMI",
            Empty {},
            method_fn(|ctx: &mut CallContext, _: Empty| Ok::<_, String>(ctx.peer().to_string())),
        )?;

    if let Some(addr) = math_server {
        let directory = Arc::new(StaticDirectory::new().with("math", addr));
        builder.register_forward::<Pair, i64>(
            "calc",
            "REMOTE_ADD",
            Pair { a: 1, b: 10 },
            ForwardEntry::new("math", "ADD"),
            directory,
        )?;
    }
    Ok(builder)
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        tracing_subscriber::fmt()
            .compact()
            .with_ansi(ansi)
            .with_env_filter(filter)
            .init();
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn validate_and_exit(builder: &RegistryBuilder, config: &ServerConfig) -> i32 {
    let registry = Arc::new(builder.build(&config.identities));
    let env = DispatchEnv {
        connection: Arc::new(ConnectionInfo::new(ConnectionId(0), SocketAddr::from(([127, 0, 0, 1], 0)))),
        session: Arc::new(config.session.clone()),
        limits: config.response_limits(),
        registry: Some(Arc::clone(&registry)),
    };
    let report = registry.validate_all(&env, &RequestEnvelope::default()).await;
    print!("{}", report.text);
    i32::from(report.status != MethodStatus::Valid)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let network = args.network_config();
    let config = args.server_config();
    let builder = registry_builder(args.math_server).context("registering methods")?;

    if args.validate {
        std::process::exit(validate_and_exit(&builder, &config).await);
    }

    let registry = builder.build(&config.identities);
    let bound = RpcServer::bind(config, network, registry)
        .await
        .with_context(|| format!("binding {}:{}", args.host, args.port))?;
    info!(port = bound.port(), "rpc server listening");

    let outcome = bound.serve(shutdown_signal()).await?;
    info!(?outcome, code = outcome.exit_code(), "server stopped");
    std::process::exit(outcome.exit_code());
}
