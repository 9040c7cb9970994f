//! Per-call context handed to every method invocation.
//!
//! A `CallContext` is built fresh for each request from the connection and
//! the request envelope. It owns the parsed input cookies (guaranteeing a
//! session id), the caller's referrer, headers and arguments, and collects
//! outbound cookies that end up on the reply. Cascades copy the caller's
//! context into a nested one so composed methods see the same caller.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rpcserve_core::{HeaderMap, RequestEnvelope};

use super::handler::{run_method, ServerMethod};
use super::registry::MethodRegistry;
use crate::network::connection::ConnectionInfo;
use crate::network::http::{url_decode, url_encode};

/// Session cookie settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the cookie carrying the session id.
    pub cookie_name: String,
    /// Lifetime given to a freshly issued session cookie.
    pub max_age: Duration,
    /// User-Agent that marks a call as coming from another server.
    pub internal_user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "rpcsession".to_string(),
            max_age: Duration::from_secs(10 * 365 * 24 * 3600),
            internal_user_agent: "rpcserve-client".to_string(),
        }
    }
}

/// Attributes of an outbound cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieOptions {
    pub max_age: Option<Duration>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

/// Formats a `Set-Cookie` value. Name and value are percent-encoded.
#[must_use]
pub fn make_cookie(name: &str, value: &str, options: &CookieOptions) -> String {
    let mut cookie = format!("{}={}", url_encode(name), url_encode(value));
    if let Some(max_age) = options.max_age {
        let _ = write!(cookie, "; Max-Age={}", max_age.as_secs());
    }
    if let Some(path) = options.path.as_deref().filter(|p| !p.is_empty()) {
        let _ = write!(cookie, "; path={path}");
    }
    if let Some(domain) = options.domain.as_deref().filter(|d| !d.is_empty()) {
        let _ = write!(cookie, "; domain={domain}");
    }
    if options.secure {
        cookie.push_str("; secure");
    }
    if options.http_only {
        cookie.push_str("; HttpOnly");
    }
    cookie
}

/// Parses a `Cookie` header into name/value pairs. Later pairs win.
#[must_use]
pub fn parse_cookies(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let decode = |s: &str| url_decode(s).unwrap_or_else(|| s.to_string());
            Some((decode(name), decode(value.trim())))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// CallContext
// ---------------------------------------------------------------------------

/// Everything a method may know about its caller.
pub struct CallContext {
    connection: Arc<ConnectionInfo>,
    referrer: String,
    cookies: BTreeMap<String, String>,
    headers: HeaderMap,
    args: BTreeMap<String, String>,
    internal_call: bool,
    output_cookies: Vec<String>,
    session: Arc<SessionConfig>,
    registry: Option<Arc<MethodRegistry>>,
}

impl CallContext {
    /// Builds the context for a request, issuing a session cookie if the
    /// caller has none.
    #[must_use]
    pub fn from_request(
        connection: Arc<ConnectionInfo>,
        request: &RequestEnvelope,
        session: Arc<SessionConfig>,
        registry: Option<Arc<MethodRegistry>>,
    ) -> Self {
        let user_agent = request.http_header.get("user-agent").unwrap_or_default();
        let internal_call = user_agent.is_empty() || user_agent == session.internal_user_agent;
        let mut ctx = Self {
            connection,
            referrer: request.referrer.clone(),
            cookies: parse_cookies(&request.cookie),
            headers: request.http_header.clone(),
            args: request.arg_map.clone(),
            internal_call,
            output_cookies: Vec::new(),
            session,
            registry,
        };
        ctx.ensure_session();
        ctx
    }

    fn ensure_session(&mut self) {
        if self.session_id().is_some() {
            return;
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = self.session.cookie_name.clone();
        self.cookies.insert(name.clone(), id.clone());
        let options = CookieOptions {
            max_age: Some(self.session.max_age),
            path: Some("/".to_string()),
            ..CookieOptions::default()
        };
        self.set_cookie(&name, &id, &options);
    }

    /// A context for a nested call: same caller, fresh outbound cookies.
    ///
    /// The `q` argument is dropped since it holds the outer call's input.
    #[must_use]
    pub fn nested(&self) -> Self {
        let mut args = self.args.clone();
        args.remove("q");
        Self {
            connection: Arc::clone(&self.connection),
            referrer: self.referrer.clone(),
            cookies: self.cookies.clone(),
            headers: self.headers.clone(),
            args,
            internal_call: self.internal_call,
            output_cookies: Vec::new(),
            session: Arc::clone(&self.session),
            registry: self.registry.clone(),
        }
    }

    /// Runs another method in place with this caller's context.
    ///
    /// The callee's mock path applies under `name`, and cookies it sets are
    /// passed on to this caller's reply.
    ///
    /// # Errors
    ///
    /// Returns the callee's error string.
    pub async fn cascade_to<M: ServerMethod>(
        &mut self,
        name: &str,
        method: &M,
        input: M::Input,
    ) -> Result<M::Output, String> {
        let mut nested = self.nested();
        let result = run_method(method, name, &mut nested, input).await;
        self.output_cookies.append(&mut nested.output_cookies);
        result
    }

    /// Runs a registered method by name with this caller's context.
    ///
    /// # Errors
    ///
    /// Fails if no registry is attached, the name is unknown, the types do
    /// not match the registered method, or the callee returns an error.
    pub async fn cascade<I, O>(&mut self, opname: &str, input: I) -> Result<O, String>
    where
        I: Send + 'static,
        O: 'static,
    {
        let registry = self
            .registry
            .clone()
            .ok_or_else(|| format!("cannot cascade to {opname}: no method registry"))?;
        let handler = registry
            .get(opname)
            .ok_or_else(|| format!("cannot cascade to unknown method: {opname}"))?;
        let output: Box<dyn Any + Send> = handler.cascade(self, Box::new(input)).await?;
        output
            .downcast::<O>()
            .map(|out| *out)
            .map_err(|_| format!("cascade output type mismatch for method: {opname}"))
    }

    /// Queues a `Set-Cookie` for the reply.
    pub fn set_cookie(&mut self, name: &str, value: &str, options: &CookieOptions) {
        self.output_cookies.push(make_cookie(name, value, options));
    }

    /// Queues an already formatted `Set-Cookie` value.
    pub fn push_set_cookie(&mut self, cookie: String) {
        self.output_cookies.push(cookie);
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionInfo> {
        &self.connection
    }

    /// The caller's IP address and port.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.connection.peer
    }

    #[must_use]
    pub fn referrer(&self) -> &str {
        &self.referrer
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.cookie(&self.session.cookie_name)
            .filter(|id| !id.is_empty())
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    /// `true` when the caller is another server rather than a user agent.
    #[must_use]
    pub fn is_internal_call(&self) -> bool {
        self.internal_call
    }

    #[must_use]
    pub fn output_cookies(&self) -> &[String] {
        &self.output_cookies
    }

    /// Moves the collected outbound cookies out of the context.
    pub fn take_output_cookies(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output_cookies)
    }

    /// Rebuilds a `Cookie` header from the input cookies.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", url_encode(k), url_encode(v)))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
