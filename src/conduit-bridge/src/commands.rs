//! Commands every bridge can offer regardless of the host.

use crate::error::BridgeError;
use crate::registry::{CommandRegistry, CommandSource, HandlerResult};
use serde_json::{json, Value};

/// `ping` → `{"pong": true}` and `echo` → the parameters unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCommands;

impl CommandSource for BuiltinCommands {
    fn name(&self) -> &str {
        "builtin"
    }

    fn register(&self, registry: &mut CommandRegistry) -> Result<(), BridgeError> {
        registry.register("ping", |_: Value| -> HandlerResult { Ok(json!({ "pong": true })) })?;
        registry.register("echo", |parameters: Value| -> HandlerResult { Ok(parameters) })?;
        Ok(())
    }
}
