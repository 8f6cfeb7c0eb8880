//! Command bridge between network clients and a single-threaded host.
//!
//! This crate provides:
//! - A newline-delimited JSON protocol ([`Request`] / [`Response`])
//! - A command registry with late-bound dispatch by name
//! - A host execution proxy that runs handlers only on the host's own thread,
//!   one at a time, during the host's idle callbacks
//! - A TCP listener with per-connection multiplexing and backpressure
//! - A lifecycle controller ([`BridgeService`]) owned by the host process
//!
//! # Protocol
//!
//! ```text
//! → {"id":1,"command":"ping","parameters":{}}
//! ← {"id":1,"status":"success","result":{"pong":true},"error":null}
//! → {"id":2,"command":"doesNotExist","parameters":{}}
//! ← {"id":2,"status":"failure","result":null,"error":"UnknownCommandError: doesNotExist"}
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use conduit_bridge::{BridgeService, BuiltinCommands};
//! use conduit_core::BridgeConfig;
//!
//! let service = BridgeService::new(BridgeConfig::default());
//! let pump = service.initialize(&[&BuiltinCommands, &my_plugin_commands])?;
//! service.start()?;
//!
//! // in the host's idle callback, on the host's main thread:
//! pump.on_idle();
//!
//! // in the host's shutdown hook:
//! service.stop();
//! ```

pub mod best_effort;
pub mod client;
mod commands;
mod connection;
mod dispatcher;
mod error;
pub mod frame;
pub mod host;
pub mod protocol;
mod registry;
mod service;

pub use best_effort::BestEffort;
pub use client::{BridgeClient, ClientError};
pub use commands::BuiltinCommands;
pub use connection::{serve, ConnectionLimits};
pub use dispatcher::{Dispatcher, Stage};
pub use error::BridgeError;
pub use host::{HostExecutor, HostPump, PendingWork, PumpOutcome};
pub use protocol::{Request, RequestId, Response, Status};
pub use registry::{
    typed, CommandHandler, CommandRegistry, CommandSource, HandlerError, HandlerResult,
};
pub use service::{BridgeService, ServiceState};
