//! Hand-off of work from network threads into the host's single execution context.
//!
//! [`channel`] returns two ends of one queue:
//! - [`HostExecutor`] is cloned into network tasks; [`HostExecutor::submit`]
//!   enqueues and returns immediately with a [`PendingWork`] to await.
//! - [`HostPump`] stays with the host. The host calls [`HostPump::on_idle`]
//!   from its own idle callback; each call runs at most one item.
//!
//! Handlers never run concurrently and never re-enter: a pump call made from
//! inside a running handler is a no-op.

use crate::error::BridgeError;
use crate::registry::CommandHandler;
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub type Outcome = Result<Value, BridgeError>;

/// One request waiting for host-context execution.
struct WorkItem {
    seq: u64,
    command: String,
    handler: Arc<dyn CommandHandler>,
    parameters: Value,
    completion: oneshot::Sender<Outcome>,
    submitted_at: Instant,
}

struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    accepting: AtomicBool,
    executing: AtomicBool,
    next_seq: AtomicU64,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        // A poisoned queue still holds valid items; handlers never run under this lock.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a connected executor/pump pair. The executor starts open.
pub fn channel() -> (HostExecutor, HostPump) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        accepting: AtomicBool::new(true),
        executing: AtomicBool::new(false),
        next_seq: AtomicU64::new(1),
    });
    (
        HostExecutor {
            shared: shared.clone(),
        },
        HostPump { shared },
    )
}

/// Network-side handle: submits work and controls whether submissions are accepted.
#[derive(Clone)]
pub struct HostExecutor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for HostExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostExecutor")
            .field("accepting", &self.is_accepting())
            .field("queued", &self.queued())
            .field("executing", &self.is_executing())
            .finish()
    }
}

impl HostExecutor {
    /// Queue `handler(parameters)` for the host context. Never blocks on the host.
    pub fn submit(
        &self,
        command: &str,
        handler: Arc<dyn CommandHandler>,
        parameters: Value,
    ) -> Result<PendingWork, BridgeError> {
        let (completion, receiver) = oneshot::channel();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut queue = self.shared.lock_queue();
        // Checked under the lock so `close` cannot miss an item.
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(BridgeError::ServiceUnavailable(
                "host executor is closed".into(),
            ));
        }
        let before = queue.len();
        queue.retain(|item| !item.completion.is_closed());
        let abandoned = before - queue.len();
        queue.push_back(WorkItem {
            seq,
            command: command.to_string(),
            handler,
            parameters,
            completion,
            submitted_at: Instant::now(),
        });
        let depth = queue.len();
        drop(queue);

        if abandoned > 0 {
            tracing::debug!(abandoned, "pruned abandoned work items");
        }
        tracing::trace!(seq, command, depth, "work item queued for host");
        Ok(PendingWork { receiver })
    }

    pub fn open(&self) {
        let _queue = self.shared.lock_queue();
        self.shared.accepting.store(true, Ordering::Release);
    }

    /// Stop accepting work and release every queued item with `ServiceStopping`.
    ///
    /// An item already executing is left to finish. Returns the number released.
    pub fn close(&self) -> usize {
        let drained: Vec<WorkItem> = {
            let mut queue = self.shared.lock_queue();
            self.shared.accepting.store(false, Ordering::Release);
            queue.drain(..).collect()
        };
        let released = drained.len();
        for item in drained {
            let _ = item.completion.send(Err(BridgeError::ServiceStopping));
        }
        if released > 0 {
            tracing::info!(released, "released queued work on close");
        }
        released
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.shared.lock_queue().len()
    }

    pub fn is_executing(&self) -> bool {
        self.shared.executing.load(Ordering::Acquire)
    }

    /// Poll until no handler is running or `limit` elapses. Returns true if idle.
    pub fn wait_until_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.is_executing() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

/// What a single [`HostPump::on_idle`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Nothing runnable was queued.
    Idle,
    /// One item ran to completion (successfully or not).
    Executed { command: String },
    /// Another item is executing (re-entrant call) or the queue was contended.
    Busy,
}

/// Host-side end of the queue. Drive it from the host's idle callback.
pub struct HostPump {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for HostPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPump").finish_non_exhaustive()
    }
}

struct ExecutingFlag<'a>(&'a AtomicBool);

impl Drop for ExecutingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HostPump {
    /// Run at most one queued item on the calling (host) thread.
    ///
    /// Items whose waiter already gave up are dropped without running.
    pub fn on_idle(&self) -> PumpOutcome {
        if self
            .shared
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PumpOutcome::Busy;
        }
        let _flag = ExecutingFlag(&self.shared.executing);

        let item = loop {
            let next = match self.shared.queue.try_lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(TryLockError::WouldBlock) => return PumpOutcome::Busy,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().pop_front(),
            };
            match next {
                None => return PumpOutcome::Idle,
                Some(item) if item.completion.is_closed() => {
                    tracing::debug!(
                        seq = item.seq,
                        command = %item.command,
                        waited_ms = item.submitted_at.elapsed().as_millis() as u64,
                        "dropping abandoned work item"
                    );
                }
                Some(item) => break item,
            }
        };

        let WorkItem {
            seq,
            command,
            handler,
            parameters,
            completion,
            submitted_at,
        } = item;

        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(|| handler.call(parameters))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(BridgeError::Handler(err.message().to_string())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(seq, command = %command, panic = %message, "handler panicked");
                Err(BridgeError::Handler(format!("handler panicked: {message}")))
            }
        };

        tracing::debug!(
            seq,
            command = %command,
            ok = outcome.is_ok(),
            queued_ms = started.duration_since(submitted_at).as_millis() as u64,
            run_ms = started.elapsed().as_millis() as u64,
            "work item executed on host"
        );

        if completion.send(outcome).is_err() {
            tracing::debug!(seq, command = %command, "waiter gone; result discarded");
        }
        PumpOutcome::Executed { command }
    }

    /// Number of items waiting, as seen by the host.
    pub fn pending(&self) -> usize {
        self.shared.lock_queue().len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Completion side of a submitted item.
#[derive(Debug)]
pub struct PendingWork {
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingWork {
    /// Wait for the host to run the item, up to `limit`.
    ///
    /// On timeout the receiver is dropped, which marks the item abandoned so
    /// the host skips it if it has not started yet.
    pub async fn wait(self, limit: Duration) -> Outcome {
        match tokio::time::timeout(limit, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::ServiceStopping),
            Err(_) => Err(BridgeError::ExecutionTimeout(limit)),
        }
    }
}
