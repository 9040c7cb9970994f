//! Opname registration and lookup.
//!
//! Methods are registered into named server identities through a
//! [`RegistryBuilder`] during startup. [`RegistryBuilder::build`] then
//! freezes the namespaces a server serves into an immutable
//! [`MethodRegistry`], which is shared read-only by every connection.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use rpcserve_core::{MethodStatus, RequestEnvelope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::forward::{ForwardEntry, ForwardMethod, RemoteDirectory};
use super::handler::{DispatchEnv, MethodHandler, ServerMethod, TypedHandler};

/// Identity whose methods every server serves.
pub const SHARED_IDENTITY: &str = "all";

/// Opnames claimed by the HTTP layer.
const RESERVED_NAMES: [&str; 3] = ["GET", "POST", "URL"];

/// Registration failures. All of them are startup bugs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("method name must not be empty")]
    EmptyName,
    #[error("method name contains whitespace: {0:?}")]
    Whitespace(String),
    #[error("method name must not start with '_': {0}")]
    Underscore(String),
    #[error("method name is reserved: {0}")]
    Reserved(String),
    #[error("method {name} already registered for identity {identity}")]
    Duplicate { identity: String, name: String },
}

/// Checks an opname against the naming rules.
///
/// # Errors
///
/// Returns the first rule the name breaks.
pub fn validate_opname(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::EmptyName);
    }
    if name.chars().any(char::is_whitespace) {
        return Err(RegistryError::Whitespace(name.to_string()));
    }
    if name.starts_with('_') {
        return Err(RegistryError::Underscore(name.to_string()));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(RegistryError::Reserved(name.to_string()));
    }
    Ok(())
}

fn split_identities(identities: &str) -> Vec<String> {
    identities
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone)]
struct Entry {
    handler: Arc<dyn MethodHandler>,
    forward: Option<ForwardEntry>,
}

type Namespace = BTreeMap<String, Entry>;

// ---------------------------------------------------------------------------
// RegistryBuilder
// ---------------------------------------------------------------------------

/// Collects registrations before the server starts.
#[derive(Default)]
pub struct RegistryBuilder {
    identities: HashMap<String, Namespace>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` as `opname` for each identity in the
    /// comma-separated `identities` list.
    ///
    /// # Errors
    ///
    /// Fails on a bad name or when any target identity already sees the
    /// name. Nothing is inserted on failure.
    pub fn register<M: ServerMethod>(
        &mut self,
        identities: &str,
        opname: &str,
        sample: M::Input,
        method: M,
    ) -> Result<&mut Self, RegistryError> {
        let handler: Arc<dyn MethodHandler> = Arc::new(TypedHandler::new(opname, sample, method));
        self.insert(identities, opname, handler, None)
    }

    /// Registers `opname` as a forward to `entry.remote_method` on the
    /// server identity `entry.remote_identity`.
    ///
    /// # Errors
    ///
    /// Same rules as [`RegistryBuilder::register`].
    pub fn register_forward<I, O>(
        &mut self,
        identities: &str,
        opname: &str,
        sample: I,
        entry: ForwardEntry,
        directory: Arc<dyn RemoteDirectory>,
    ) -> Result<&mut Self, RegistryError>
    where
        I: Serialize + DeserializeOwned + Send + Sync + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
    {
        let method = ForwardMethod::<I, O>::new(entry.clone(), directory);
        let handler: Arc<dyn MethodHandler> = Arc::new(TypedHandler::new(opname, sample, method));
        self.insert(identities, opname, handler, Some(entry))
    }

    fn insert(
        &mut self,
        identities: &str,
        opname: &str,
        handler: Arc<dyn MethodHandler>,
        forward: Option<ForwardEntry>,
    ) -> Result<&mut Self, RegistryError> {
        validate_opname(opname)?;
        let targets = split_identities(identities);
        let key = opname.to_ascii_lowercase();

        for identity in &targets {
            if let Some(existing) = self.conflict(identity, &key) {
                return Err(RegistryError::Duplicate {
                    identity: existing,
                    name: opname.to_string(),
                });
            }
        }

        let entry = Entry { handler, forward };
        for identity in targets {
            debug!(identity = %identity, method = opname, "registered method");
            self.identities
                .entry(identity)
                .or_default()
                .insert(key.clone(), entry.clone());
        }
        Ok(self)
    }

    /// Names the identity that already sees `key` from `identity`'s view.
    fn conflict(&self, identity: &str, key: &str) -> Option<String> {
        let has = |id: &str| self.identities.get(id).is_some_and(|ns| ns.contains_key(key));
        if identity == SHARED_IDENTITY {
            return self
                .identities
                .keys()
                .find(|id| has(id))
                .cloned();
        }
        [identity, SHARED_IDENTITY]
            .into_iter()
            .find(|id| has(id))
            .map(str::to_string)
    }

    /// Freezes the namespaces of the comma-separated server `identities`
    /// plus the shared one.
    #[must_use]
    pub fn build(&self, identities: &str) -> MethodRegistry {
        let mut selected = split_identities(identities);
        if !selected.iter().any(|id| id == SHARED_IDENTITY) {
            selected.push(SHARED_IDENTITY.to_string());
        }

        let mut methods = Namespace::new();
        for identity in &selected {
            let Some(namespace) = self.identities.get(identity) else {
                continue;
            };
            for (key, entry) in namespace {
                methods.entry(key.clone()).or_insert_with(|| entry.clone());
            }
        }
        MethodRegistry {
            identities: selected,
            methods,
        }
    }
}

// ---------------------------------------------------------------------------
// MethodRegistry
// ---------------------------------------------------------------------------

/// Outcome of validating every registered method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub status: MethodStatus,
    pub text: String,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub not_implemented: Vec<String>,
}

/// Immutable opname to handler map served by one server.
pub struct MethodRegistry {
    identities: Vec<String>,
    methods: Namespace,
}

impl MethodRegistry {
    /// Case-insensitive lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods
            .get(&name.to_ascii_lowercase())
            .map(|e| Arc::clone(&e.handler))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(&name.to_ascii_lowercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered spellings, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .values()
            .map(|e| e.handler.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Forward metadata for `name`, if it is a forwarded method.
    #[must_use]
    pub fn forward(&self, name: &str) -> Option<&ForwardEntry> {
        self.methods
            .get(&name.to_ascii_lowercase())
            .and_then(|e| e.forward.as_ref())
    }

    /// The identities this registry was built for, shared one included.
    #[must_use]
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    /// Runs one method's self-check.
    pub async fn validate_method(
        &self,
        env: &DispatchEnv,
        request: &RequestEnvelope,
        name: &str,
        out: &mut String,
    ) -> MethodStatus {
        let handler = if name.is_empty() { None } else { self.get(name) };
        let Some(handler) = handler else {
            let _ = writeln!(out, "Invalid Method: {name}");
            return MethodStatus::NotImplemented;
        };
        let _ = writeln!(out, "\n# {}: Validating... #", handler.name());
        let status = handler.validate(env, request, out).await;
        let _ = writeln!(out, "{}: {status}", handler.name());
        status
    }

    /// Runs every method's self-check and summarises the results.
    ///
    /// The server is Invalid when at least half of its methods fail, else
    /// `NotImplemented` when at least half are unimplemented. Failures win
    /// when both reach half.
    pub async fn validate_all(&self, env: &DispatchEnv, request: &RequestEnvelope) -> ValidationReport {
        let mut text = String::from("Validating server...\n");
        let (mut passed, mut failed, mut not_implemented) = (Vec::new(), Vec::new(), Vec::new());

        for name in self.names() {
            match self.validate_method(env, request, &name, &mut text).await {
                MethodStatus::Valid => passed.push(name),
                MethodStatus::Invalid => failed.push(name),
                MethodStatus::NotImplemented => not_implemented.push(name),
            }
        }

        let total = self.len();
        let mut status = MethodStatus::Valid;
        if failed.len() * 2 >= total && !failed.is_empty() {
            status = MethodStatus::Invalid;
        } else if not_implemented.len() * 2 >= total && !not_implemented.is_empty() {
            status = MethodStatus::NotImplemented;
        }

        let mut section = |title: &str, verb: &str, names: &[String]| {
            if names.is_empty() {
                return;
            }
            let _ = writeln!(text, "\n{title}: {} of {total} methods {verb}.", names.len());
            let _ = writeln!(text, "Methods {verb}: {}", names.join("  "));
        };
        section("FAILURE", "failed", &failed);
        section("Not Implemented", "not implemented", &not_implemented);
        section("PASSED", "passed", &passed);
        let _ = writeln!(text, "\nFINAL STATUS: {status}");

        ValidationReport {
            status,
            text,
            passed,
            failed,
            not_implemented,
        }
    }

    /// Reverse-proxy rules routing each opname to this server or, for
    /// forwarded methods, to the remote identity's balancer.
    #[must_use]
    pub fn proxy_config(&self, port: u16) -> String {
        let mut out = String::new();
        for entry in self.methods.values().rev() {
            let name = entry.handler.name();
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            let _ = match &entry.forward {
                Some(fwd) => writeln!(
                    out,
                    "ProxyPass /{name} balancer://{}_cluster/{}",
                    fwd.remote_identity, fwd.remote_method
                ),
                None => writeln!(out, "ProxyPass /{name} $backend/{name}"),
            };
        }
        let _ = writeln!(out, "ProxyPass /URL http://localhost:{port}/URL");
        out
    }
}
