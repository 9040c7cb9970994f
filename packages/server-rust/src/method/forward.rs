//! Methods that forward to another server of this framework.
//!
//! A forward entry names the remote server identity and method. The
//! registry keeps the entry as routing metadata for proxy configuration,
//! and installs a [`ForwardMethod`] so direct calls still work.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rpcserve_core::{MethodStatus, RequestEnvelope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::context::CallContext;
use super::handler::ServerMethod;
use crate::network::client::RpcClient;

/// Default bound on a forwarded call.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a forwarded opname goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEntry {
    pub remote_identity: String,
    pub remote_method: String,
    pub timeout: Duration,
}

impl ForwardEntry {
    #[must_use]
    pub fn new(remote_identity: impl Into<String>, remote_method: impl Into<String>) -> Self {
        Self {
            remote_identity: remote_identity.into(),
            remote_method: remote_method.into(),
            timeout: DEFAULT_FORWARD_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Resolves a server identity to an address to call.
pub trait RemoteDirectory: Send + Sync {
    fn resolve(&self, identity: &str) -> Option<SocketAddr>;
}

/// A fixed identity to address map.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    addrs: HashMap<String, SocketAddr>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, identity: impl Into<String>, addr: SocketAddr) -> Self {
        self.addrs.insert(identity.into(), addr);
        self
    }
}

impl RemoteDirectory for StaticDirectory {
    fn resolve(&self, identity: &str) -> Option<SocketAddr> {
        self.addrs.get(identity).copied()
    }
}

/// Calls `remote_method` on the remote identity with the caller's metadata.
pub struct ForwardMethod<I, O> {
    entry: ForwardEntry,
    directory: Arc<dyn RemoteDirectory>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> ForwardMethod<I, O> {
    #[must_use]
    pub fn new(entry: ForwardEntry, directory: Arc<dyn RemoteDirectory>) -> Self {
        Self {
            entry,
            directory,
            _types: PhantomData,
        }
    }

    fn resolve(&self) -> Result<SocketAddr, String> {
        self.directory
            .resolve(&self.entry.remote_identity)
            .ok_or_else(|| format!("no address for server {}", self.entry.remote_identity))
    }
}

#[async_trait]
impl<I, O> ServerMethod for ForwardMethod<I, O>
where
    I: Serialize + DeserializeOwned + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn call(&self, ctx: &mut CallContext, input: I) -> Result<O, String> {
        let addr = self.resolve()?;
        let mut request =
            RequestEnvelope::with_input(&self.entry.remote_method, &input).map_err(|e| e.to_string())?;
        request.referrer = ctx.referrer().to_string();
        request.cookie = ctx.cookie_header();
        request.http_header = ctx.headers().clone();
        request.arg_map = ctx.args().clone();

        let timeout = self.entry.timeout;
        let exchange = async {
            let mut client = RpcClient::connect(addr).await.map_err(|e| e.to_string())?;
            client.call_envelope(request).await.map_err(|e| e.to_string())
        };
        let reply = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(remote = %self.entry.remote_identity, method = %self.entry.remote_method, error = %e, "forward failed");
                return Err(e);
            }
            Err(_) => {
                warn!(remote = %self.entry.remote_identity, method = %self.entry.remote_method, ?timeout, "forward timed out");
                return Err(format!("forward to {} timed out", self.entry.remote_method));
            }
        };

        for cookie in &reply.cookies {
            ctx.push_set_cookie(cookie.clone());
        }
        if !reply.success {
            return Err(reply.error_message());
        }
        reply.output().map_err(|e| e.to_string())
    }

    /// Valid when the remote identity resolves.
    async fn validate(&self, _ctx: &mut CallContext, out: &mut String) -> MethodStatus {
        match self.resolve() {
            Ok(addr) => {
                let _ = writeln!(
                    out,
                    "forwards to {} on {} ({addr})",
                    self.entry.remote_method, self.entry.remote_identity
                );
                MethodStatus::Valid
            }
            Err(e) => {
                out.push_str(&e);
                out.push('\n');
                MethodStatus::Invalid
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rpcserve_core::{serial, ReplyEnvelope};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::method::context::tests::context_for;
    use crate::method::handler::tests::Pair;

    async fn fake_remote(reply: ReplyEnvelope) -> (SocketAddr, tokio::task::JoinHandle<RequestEnvelope>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut prefix = [0u8; 4];
            stream.read_exact(&mut prefix).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
            stream.read_exact(&mut body).await.unwrap();
            stream.write_all(&reply.to_frame().unwrap()).await.unwrap();
            serial::from_binary(&body).unwrap()
        });
        (addr, handle)
    }

    fn forward_to(addr: SocketAddr) -> ForwardMethod<Pair, i64> {
        let directory = StaticDirectory::new().with("math", addr);
        ForwardMethod::new(ForwardEntry::new("math", "MULTIPLY"), Arc::new(directory))
    }

    #[tokio::test]
    async fn forwards_input_and_caller_metadata() {
        let mut reply = ReplyEnvelope::ok(serial::to_binary(&12i64).unwrap());
        reply.cookies.push("remote=1".into());
        let (addr, remote) = fake_remote(reply).await;

        let mut request = RequestEnvelope::default();
        request.referrer = "http://origin/".into();
        request.cookie = "rpcsession=abc".into();
        request.arg_map.insert("q".into(), "{}".into());
        let mut ctx = context_for(&request);

        let out = forward_to(addr).call(&mut ctx, Pair { a: 3, b: 4 }).await.unwrap();
        assert_eq!(out, 12);
        assert_eq!(ctx.output_cookies(), ["remote=1"]);

        let seen = remote.await.unwrap();
        assert_eq!(seen.opname, "MULTIPLY");
        assert_eq!(serial::from_binary::<Pair>(&seen.payload).unwrap(), Pair { a: 3, b: 4 });
        assert_eq!(seen.referrer, "http://origin/");
        assert_eq!(seen.cookie, "rpcsession=abc");
        assert!(seen.arg_map.contains_key("q"));
    }

    #[tokio::test]
    async fn unresolvable_identity_fails() {
        let method: ForwardMethod<Pair, i64> =
            ForwardMethod::new(ForwardEntry::new("nowhere", "X"), Arc::new(StaticDirectory::new()));
        let mut ctx = context_for(&RequestEnvelope::default());
        let err = method.call(&mut ctx, Pair::default()).await.unwrap_err();
        assert_eq!(err, "no address for server nowhere");

        let mut out = String::new();
        assert_eq!(method.validate(&mut ctx, &mut out).await, MethodStatus::Invalid);
    }

    #[tokio::test]
    async fn slow_remote_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let directory = StaticDirectory::new().with("math", addr);
        let method: ForwardMethod<Pair, i64> = ForwardMethod::new(
            ForwardEntry::new("math", "MULTIPLY").with_timeout(Duration::from_millis(100)),
            Arc::new(directory),
        );
        let mut ctx = context_for(&RequestEnvelope::default());
        let err = method.call(&mut ctx, Pair::default()).await.unwrap_err();
        assert_eq!(err, "forward to MULTIPLY timed out");
    }
}
