//! Name → handler table built once at startup.
//!
//! The registry knows nothing about where handlers come from: collaborators
//! implement [`CommandSource`] and add their commands during
//! [`BridgeService::initialize`](crate::BridgeService::initialize). After that
//! the table is shared read-only behind an `Arc`.

use crate::error::BridgeError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a handler. Its message is forwarded to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// A named command's implementation.
///
/// Handlers run only inside the host context, one at a time, so they may call
/// host APIs that are not thread-safe. They still need `Send + Sync` because
/// the registry that owns them is shared with network threads.
pub trait CommandHandler: Send + Sync {
    fn call(&self, parameters: Value) -> HandlerResult;
}

impl<F> CommandHandler for F
where
    F: Fn(Value) -> HandlerResult + Send + Sync,
{
    fn call(&self, parameters: Value) -> HandlerResult {
        self(parameters)
    }
}

/// Adapter that deserializes parameters into `P` and serializes the `R` result.
pub struct Typed<P, R, F> {
    handler: F,
    _shape: PhantomData<fn(P) -> R>,
}

/// Wrap a strongly typed function as a [`CommandHandler`].
///
/// Parameters that do not match `P` fail with a `HandlerError` instead of
/// reaching the function.
pub fn typed<P, R, F>(handler: F) -> Typed<P, R, F>
where
    P: DeserializeOwned,
    R: Serialize,
    F: Fn(P) -> Result<R, HandlerError> + Send + Sync,
{
    Typed {
        handler,
        _shape: PhantomData,
    }
}

impl<P, R, F> CommandHandler for Typed<P, R, F>
where
    P: DeserializeOwned,
    R: Serialize,
    F: Fn(P) -> Result<R, HandlerError> + Send + Sync,
{
    fn call(&self, parameters: Value) -> HandlerResult {
        let parameters: P = serde_json::from_value(parameters)
            .map_err(|err| HandlerError::new(format!("invalid parameters: {err}")))?;
        let result = (self.handler)(parameters)?;
        serde_json::to_value(result)
            .map_err(|err| HandlerError::new(format!("unserializable result: {err}")))
    }
}

/// Anything that contributes commands at startup (a plugin module, a static table...).
pub trait CommandSource {
    /// Label used in logs.
    fn name(&self) -> &str;

    fn register(&self, registry: &mut CommandRegistry) -> Result<(), BridgeError>;
}

#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn CommandHandler>>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from every source in order. The first conflict aborts.
    pub fn from_sources(sources: &[&dyn CommandSource]) -> Result<Self, BridgeError> {
        let mut registry = Self::new();
        for source in sources {
            let before = registry.len();
            source.register(&mut registry)?;
            tracing::debug!(
                source = source.name(),
                added = registry.len() - before,
                "registered command source"
            );
        }
        Ok(registry)
    }

    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> Result<(), BridgeError>
    where
        H: CommandHandler + 'static,
    {
        self.register_shared(name, Arc::new(handler))
    }

    /// Register an already shared handler. Duplicate names are rejected and the
    /// existing entry is left untouched.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), BridgeError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(BridgeError::InvalidCommandName(name));
        }
        if self.commands.contains_key(&name) {
            return Err(BridgeError::DuplicateCommand(name));
        }
        self.commands.insert(name, handler);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn CommandHandler>, BridgeError> {
        self.commands
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownCommand(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
