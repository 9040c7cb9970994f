//! Method registration and dispatch.

pub mod context;
pub mod forward;
pub mod handler;
pub mod registry;

pub use context::{make_cookie, CallContext, CookieOptions, SessionConfig};
pub use forward::{ForwardEntry, ForwardMethod, RemoteDirectory, StaticDirectory};
pub use handler::{
    method_fn, DispatchEnv, FnMethod, MethodHandler, MockOutcome, ResponseLimits, ServerMethod,
    TypedHandler,
};
pub use registry::{MethodRegistry, RegistryBuilder, RegistryError, ValidationReport, SHARED_IDENTITY};
