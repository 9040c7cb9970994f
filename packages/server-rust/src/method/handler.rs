//! Typed server methods and their type-erased handler wrapper.
//!
//! Application code implements [`ServerMethod`] (or wraps a closure with
//! [`method_fn`]). Registration wraps it in a [`TypedHandler`], which the
//! registry stores as `Arc<dyn MethodHandler>`. The wrapper owns the
//! calling conventions: payload decoding, the mock override, output encoding
//! with the response size limits, and cookie propagation.

use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use rpcserve_core::{serial, ErrorMessage, MethodStatus, ReplyEnvelope, RequestEnvelope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use super::context::{CallContext, SessionConfig};
use super::registry::MethodRegistry;
use crate::network::connection::ConnectionInfo;

/// Error text for binary payloads that do not decode as the method's input.
pub const BINARY_PARSE_ERROR: &str = "RPC parsing error -- server mismatch?";

/// Shown by `to_json` when a binary payload does not decode.
pub const BAD_PAYLOAD_JSON: &str = "[Error in RPC string]";

// ---------------------------------------------------------------------------
// ServerMethod
// ---------------------------------------------------------------------------

/// Result of a mock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome<T> {
    /// Use this output instead of running the method.
    Success(T),
    /// The mock was selected but could not produce an output.
    Failure,
    /// This method has no such mock; run the real method.
    Unimplemented,
}

/// An operation callable over RPC.
#[async_trait]
pub trait ServerMethod: Send + Sync + 'static {
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Runs the operation. An `Err` is returned to the caller verbatim.
    async fn call(&self, ctx: &mut CallContext, input: Self::Input)
        -> Result<Self::Output, String>;

    /// Produces canned output when the caller selects `mock_type`.
    async fn mock(
        &self,
        _ctx: &mut CallContext,
        _mock_type: &str,
        _input: &Self::Input,
    ) -> MockOutcome<Self::Output> {
        MockOutcome::Unimplemented
    }

    /// Self-check used by `_validate`. Findings go to `out`.
    async fn validate(&self, _ctx: &mut CallContext, out: &mut String) -> MethodStatus {
        out.push_str("Not implemented yet!\n");
        MethodStatus::NotImplemented
    }

    /// Whether calls may be captured by the traffic recorder.
    fn can_record(&self) -> bool {
        true
    }

    /// Whether a JSON call may omit `q`.
    fn allow_empty_request(&self) -> bool {
        false
    }
}

/// Extracts the mock type selected for `opname` from a `mock` argument of
/// the form `NAME:type+*:type`. The first entry naming `opname` or `*` wins.
#[must_use]
pub fn mock_selector(args: &BTreeMap<String, String>, opname: &str) -> Option<String> {
    let selector = args.get("mock")?;
    selector.split('+').find_map(|entry| {
        let parts: Vec<&str> = entry.split(':').collect();
        let [target, mock_type] = parts.as_slice() else {
            return None;
        };
        let target = target.trim();
        (target == "*" || target.eq_ignore_ascii_case(opname))
            .then(|| mock_type.trim().to_string())
    })
}

/// Runs `method` under `name`, honouring a mock selected by the caller.
pub(crate) async fn run_method<M: ServerMethod>(
    method: &M,
    name: &str,
    ctx: &mut CallContext,
    input: M::Input,
) -> Result<M::Output, String> {
    if let Some(mock_type) = mock_selector(ctx.args(), name).filter(|m| !m.is_empty()) {
        match method.mock(ctx, &mock_type, &input).await {
            MockOutcome::Success(output) => return Ok(output),
            MockOutcome::Failure => {
                return Err(format!("failed to generate mock for method: {name}"));
            }
            MockOutcome::Unimplemented => {}
        }
    }
    method.call(ctx, input).await
}

// ---------------------------------------------------------------------------
// FnMethod
// ---------------------------------------------------------------------------

/// A [`ServerMethod`] backed by a plain closure.
pub struct FnMethod<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Wraps a closure as a server method.
pub fn method_fn<I, O, F>(f: F) -> FnMethod<I, O, F>
where
    F: Fn(&mut CallContext, I) -> Result<O, String> + Send + Sync + 'static,
{
    FnMethod {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<I, O, F> ServerMethod for FnMethod<I, O, F>
where
    I: Serialize + DeserializeOwned + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(&mut CallContext, I) -> Result<O, String> + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    async fn call(&self, ctx: &mut CallContext, input: I) -> Result<O, String> {
        (self.f)(ctx, input)
    }
}

// ---------------------------------------------------------------------------
// MethodHandler
// ---------------------------------------------------------------------------

/// Upper bounds on encoded method output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseLimits {
    pub max_binary: usize,
    pub max_json: usize,
}

impl Default for ResponseLimits {
    fn default() -> Self {
        Self {
            max_binary: 100_000_000,
            max_json: 100_000_000,
        }
    }
}

/// Server-side facts every dispatch needs.
#[derive(Clone)]
pub struct DispatchEnv {
    pub connection: Arc<ConnectionInfo>,
    pub session: Arc<SessionConfig>,
    pub limits: ResponseLimits,
    /// Enables cascades by name.
    pub registry: Option<Arc<MethodRegistry>>,
}

impl DispatchEnv {
    fn context(&self, request: &RequestEnvelope) -> CallContext {
        CallContext::from_request(
            Arc::clone(&self.connection),
            request,
            Arc::clone(&self.session),
            self.registry.clone(),
        )
    }
}

/// Type-erased view of a registered method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Registered spelling of the opname.
    fn name(&self) -> &str;

    /// Binary calling convention: `MsgPack` in, `MsgPack` out.
    async fn process_binary(&self, env: &DispatchEnv, request: &RequestEnvelope) -> ReplyEnvelope;

    /// JSON calling convention: the payload is JSON text.
    async fn process_json(
        &self,
        env: &DispatchEnv,
        request: &RequestEnvelope,
        pretty: bool,
    ) -> ReplyEnvelope;

    async fn validate(
        &self,
        env: &DispatchEnv,
        request: &RequestEnvelope,
        out: &mut String,
    ) -> MethodStatus;

    /// Runs the method for a cascading caller with type-erased input/output.
    async fn cascade(
        &self,
        caller: &mut CallContext,
        input: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, String>;

    /// Renders a binary input payload as JSON.
    fn to_json(&self, payload: &[u8], pretty: bool) -> String;

    /// Renders a binary output payload as JSON.
    fn output_to_json(&self, payload: &[u8]) -> String;

    fn sample_input_json(&self) -> String;

    fn can_record(&self) -> bool;

    fn allow_empty_request(&self) -> bool;
}

/// Adapts a [`ServerMethod`] to [`MethodHandler`].
pub struct TypedHandler<M: ServerMethod> {
    name: String,
    sample: M::Input,
    method: M,
}

impl<M: ServerMethod> TypedHandler<M> {
    #[must_use]
    pub fn new(name: impl Into<String>, sample: M::Input, method: M) -> Self {
        Self {
            name: name.into(),
            sample,
            method,
        }
    }

    /// Aborts if an encoded response exceeds its limit. Oversized output is
    /// a deployment error, not something a caller can fix.
    fn enforce_limit(&self, kind: &str, size: usize, limit: usize, request: impl FnOnce() -> String) {
        if size > limit {
            error!(
                method = %self.name,
                size,
                limit,
                request = %request(),
                "serialized {kind} response too large; raise the {kind} response size limit"
            );
            std::process::abort();
        }
    }
}

fn binary_error(msg: &str) -> Vec<u8> {
    serial::to_binary(&ErrorMessage::new(msg)).unwrap_or_else(|_| msg.as_bytes().to_vec())
}

fn json_error(msg: &str) -> Vec<u8> {
    serial::to_json(&ErrorMessage::new(msg), true)
        .map_or_else(|_| msg.as_bytes().to_vec(), String::into_bytes)
}

#[async_trait]
impl<M: ServerMethod> MethodHandler for TypedHandler<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_binary(&self, env: &DispatchEnv, request: &RequestEnvelope) -> ReplyEnvelope {
        let Ok(input) = serial::from_binary::<M::Input>(&request.payload) else {
            return ReplyEnvelope::failed(binary_error(BINARY_PARSE_ERROR));
        };

        let mut ctx = env.context(request);
        let mut reply = match run_method(&self.method, &self.name, &mut ctx, input).await {
            Ok(output) => match serial::to_binary(&output) {
                Ok(bytes) => {
                    self.enforce_limit("binary", bytes.len(), env.limits.max_binary, || {
                        self.to_json(&request.payload, false)
                    });
                    ReplyEnvelope::ok(bytes)
                }
                Err(e) => ReplyEnvelope::failed(binary_error(&e.to_string())),
            },
            Err(msg) => ReplyEnvelope::failed(binary_error(&msg)),
        };
        reply.cookies = ctx.take_output_cookies();
        reply
    }

    async fn process_json(
        &self,
        env: &DispatchEnv,
        request: &RequestEnvelope,
        pretty: bool,
    ) -> ReplyEnvelope {
        let text = String::from_utf8_lossy(&request.payload);
        let input = match serial::from_json::<M::Input>(&text) {
            Ok(input) => input,
            Err(e) => return ReplyEnvelope::failed(json_error(&e.to_string())),
        };

        let mut ctx = env.context(request);
        let mut reply = match run_method(&self.method, &self.name, &mut ctx, input).await {
            Ok(output) => match serial::to_json(&output, pretty) {
                Ok(json) => {
                    self.enforce_limit("json", json.len(), env.limits.max_json, || {
                        text.to_string()
                    });
                    ReplyEnvelope::ok(json.into_bytes())
                }
                Err(e) => ReplyEnvelope::failed(json_error(&e.to_string())),
            },
            Err(msg) => ReplyEnvelope::failed(json_error(&msg)),
        };
        reply.cookies = ctx.take_output_cookies();
        reply
    }

    async fn validate(
        &self,
        env: &DispatchEnv,
        request: &RequestEnvelope,
        out: &mut String,
    ) -> MethodStatus {
        let mut ctx = env.context(request);
        self.method.validate(&mut ctx, out).await
    }

    async fn cascade(
        &self,
        caller: &mut CallContext,
        input: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, String> {
        let input = input
            .downcast::<M::Input>()
            .map_err(|_| format!("cascade input type mismatch for method: {}", self.name))?;
        let output = caller.cascade_to(&self.name, &self.method, *input).await?;
        Ok(Box::new(output))
    }

    fn to_json(&self, payload: &[u8], pretty: bool) -> String {
        serial::from_binary::<M::Input>(payload)
            .ok()
            .and_then(|input| serial::to_json(&input, pretty).ok())
            .unwrap_or_else(|| BAD_PAYLOAD_JSON.to_string())
    }

    fn output_to_json(&self, payload: &[u8]) -> String {
        serial::from_binary::<M::Output>(payload)
            .ok()
            .and_then(|output| serial::to_json(&output, false).ok())
            .unwrap_or_else(|| BAD_PAYLOAD_JSON.to_string())
    }

    fn sample_input_json(&self) -> String {
        serial::to_json(&self.sample, true).unwrap_or_default()
    }

    fn can_record(&self) -> bool {
        self.method.can_record()
    }

    fn allow_empty_request(&self) -> bool {
        self.method.allow_empty_request()
    }
}
