//! Turns one frame into exactly one response.

use crate::error::BridgeError;
use crate::host::HostExecutor;
use crate::protocol::{decode_request, Request, Response};
use crate::registry::CommandRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Progress of a request through the dispatcher; logged when a request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    Resolved,
    Submitted,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    executor: HostExecutor,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        executor: HostExecutor,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            executor,
            request_timeout,
        }
    }

    /// Decode, resolve, run on the host and build the response. Never fails:
    /// every error becomes a failure response.
    pub async fn dispatch(&self, frame: &[u8]) -> Response {
        let request = match decode_request(frame) {
            Ok(request) => request,
            Err(rejected) => {
                tracing::debug!(
                    stage = ?Stage::Received,
                    id = ?rejected.id,
                    error = %rejected.error,
                    "rejecting malformed request"
                );
                return Response::failure(rejected.id, &rejected.error);
            }
        };
        self.dispatch_request(request).await
    }

    pub async fn dispatch_request(&self, request: Request) -> Response {
        let Request {
            id,
            command,
            parameters,
        } = request;

        match self.execute(&command, parameters).await {
            Ok(result) => {
                tracing::debug!(id = %id, command = %command, "request completed");
                Response::success(id, result)
            }
            Err((stage, err)) => {
                tracing::debug!(
                    id = %id,
                    command = %command,
                    stage = ?stage,
                    error = %err,
                    "request failed"
                );
                Response::failure(Some(id), &err)
            }
        }
    }

    async fn execute(&self, command: &str, parameters: Value) -> Result<Value, (Stage, BridgeError)> {
        let handler = self
            .registry
            .resolve(command)
            .map_err(|err| (Stage::Decoded, err))?;
        let pending = self
            .executor
            .submit(command, handler, parameters)
            .map_err(|err| (Stage::Resolved, err))?;
        pending
            .wait(self.request_timeout)
            .await
            .map_err(|err| match err {
                BridgeError::Handler(_) => (Stage::Completed, err),
                other => (Stage::Submitted, other),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{self, HostPump};
    use crate::protocol::Status;
    use crate::registry::{HandlerError, HandlerResult};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn registry() -> Arc<CommandRegistry> {
        let mut registry = CommandRegistry::new();
        registry
            .register("ping", |_: Value| -> HandlerResult { Ok(json!({"pong": true})) })
            .unwrap();
        registry
            .register("fail", |_: Value| -> HandlerResult {
                Err(HandlerError::new("selection is empty"))
            })
            .unwrap();
        Arc::new(registry)
    }

    struct HostLoop {
        stop: Arc<AtomicBool>,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl HostLoop {
        fn spawn(pump: HostPump) -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let flag = stop.clone();
            let thread = thread::spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    pump.on_idle();
                    thread::sleep(Duration::from_millis(1));
                }
            });
            Self {
                stop,
                thread: Some(thread),
            }
        }
    }

    impl Drop for HostLoop {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn dispatcher(timeout: Duration) -> (Dispatcher, HostPump) {
        let (executor, pump) = host::channel();
        (Dispatcher::new(registry(), executor, timeout), pump)
    }

    #[tokio::test]
    async fn successful_command_echoes_id() {
        let (dispatcher, pump) = dispatcher(Duration::from_secs(5));
        let _host = HostLoop::spawn(pump);

        let response = dispatcher
            .dispatch(br#"{"id":1,"command":"ping","parameters":{}}"#)
            .await;
        assert_eq!(response, Response::success(json!(1), json!({"pong": true})));
    }

    #[tokio::test]
    async fn unknown_command_is_reported_without_running_host() {
        let (dispatcher, _pump) = dispatcher(Duration::from_secs(5));

        let response = dispatcher
            .dispatch(br#"{"id":2,"command":"doesNotExist","parameters":{}}"#)
            .await;
        assert_eq!(response.id, Some(json!(2)));
        assert_eq!(response.status, Status::Failure);
        assert_eq!(
            response.error.as_deref(),
            Some("UnknownCommandError: doesNotExist")
        );
        assert!(response.result.is_none());
    }

    #[tokio::test]
    async fn handler_failure_carries_message() {
        let (dispatcher, pump) = dispatcher(Duration::from_secs(5));
        let _host = HostLoop::spawn(pump);

        let response = dispatcher.dispatch(br#"{"id":"a","command":"fail"}"#).await;
        assert_eq!(response.id, Some(json!("a")));
        assert!(response.result.is_none());
        assert_eq!(
            response.error.as_deref(),
            Some("HandlerError: selection is empty")
        );
    }

    #[tokio::test]
    async fn busy_host_times_out() {
        let (dispatcher, _pump) = dispatcher(Duration::from_millis(50));

        let response = dispatcher.dispatch(br#"{"id":5,"command":"ping"}"#).await;
        assert_eq!(response.id, Some(json!(5)));
        assert!(response
            .error
            .as_deref()
            .unwrap()
            .starts_with("ExecutionTimeoutError"));
    }

    #[tokio::test]
    async fn malformed_frame_without_id() {
        let (dispatcher, _pump) = dispatcher(Duration::from_secs(1));
        let response = dispatcher.dispatch(b"][").await;
        assert_eq!(response.id, None);
        assert!(response
            .error
            .as_deref()
            .unwrap()
            .starts_with("MalformedRequestError"));
    }

    #[tokio::test]
    async fn closed_executor_reports_unavailable() {
        let (executor, _pump) = host::channel();
        executor.close();
        let dispatcher = Dispatcher::new(registry(), executor, Duration::from_secs(1));

        let response = dispatcher.dispatch(br#"{"id":9,"command":"ping"}"#).await;
        assert!(response
            .error
            .as_deref()
            .unwrap()
            .starts_with("ServiceUnavailableError"));
    }
}
