//! `rpcserve` core: wire envelopes, payload codecs, and binary framing.

pub mod envelope;
pub mod frame;
pub mod serial;
pub mod status;

pub use envelope::{HeaderMap, ReplyEnvelope, RequestEnvelope};
pub use serial::CodecError;
pub use status::{ErrorMessage, MethodStatus, Protocol};
