//! Lifecycle controller for the bridge.
//!
//! A [`BridgeService`] is created by the host's startup hook and kept for the
//! life of the process. `start`/`stop` are meant for host-side callers (a UI
//! toggle, a shutdown hook) and block briefly. Called from async code, `stop`
//! tears the runtime down on a helper thread.

use crate::connection::{self, ConnectionLimits};
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::host::{self, HostExecutor, HostPump};
use crate::registry::{CommandRegistry, CommandSource};
use conduit_core::BridgeConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServiceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

struct Wiring {
    registry: Arc<CommandRegistry>,
    executor: HostExecutor,
}

struct Listening {
    runtime: Runtime,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl Listening {
    fn shut_down(self, grace: Duration) {
        let Listening {
            runtime,
            shutdown,
            server,
            local_addr,
        } = self;
        let _ = shutdown.send(true);
        // `serve` already bounds its own drain by `grace`; allow the same again for the join.
        let joined = runtime.block_on(async { tokio::time::timeout(grace * 2, server).await });
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "listener task ended abnormally"),
            Err(_) => tracing::warn!("listener did not drain in time"),
        }
        runtime.shutdown_timeout(grace);
        tracing::info!(addr = %local_addr, "bridge stopped");
    }
}

/// Leaves the service `Stopped` however `stop` exits.
struct StoppedOnExit<'a>(&'a AtomicU8);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        self.0.store(ServiceState::Stopped as u8, Ordering::Release);
    }
}

pub struct BridgeService {
    config: BridgeConfig,
    state: AtomicU8,
    wiring: OnceLock<Wiring>,
    listening: Mutex<Option<Listening>>,
}

impl std::fmt::Debug for BridgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeService")
            .field("endpoint", &self.config.endpoint())
            .field("state", &self.state())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl BridgeService {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(ServiceState::Stopped as u8),
            wiring: OnceLock::new(),
            listening: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Populate the registry and wire the host queue. Allowed once.
    ///
    /// The returned pump belongs to the host: call [`HostPump::on_idle`] from
    /// the host's idle callback. The listener is not opened here.
    pub fn initialize(&self, sources: &[&dyn CommandSource]) -> Result<HostPump, BridgeError> {
        if self.wiring.get().is_some() {
            return Err(BridgeError::AlreadyInitialized);
        }
        let registry = CommandRegistry::from_sources(sources)?;
        let (executor, pump) = host::channel();
        let commands = registry.len();
        self.wiring
            .set(Wiring {
                registry: Arc::new(registry),
                executor,
            })
            .map_err(|_| BridgeError::AlreadyInitialized)?;
        tracing::info!(commands, "bridge initialized");
        Ok(pump)
    }

    pub fn is_initialized(&self) -> bool {
        self.wiring.get().is_some()
    }

    /// Open the listener. Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr, BridgeError> {
        let wiring = self.wiring.get().ok_or(BridgeError::NotInitialized)?;

        if let Err(current) = self.state.compare_exchange(
            ServiceState::Stopped as u8,
            ServiceState::Starting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match ServiceState::from_u8(current) {
                ServiceState::Stopping => BridgeError::ServiceStopping,
                _ => BridgeError::AlreadyRunning,
            });
        }

        match self.listen(wiring) {
            Ok(listening) => {
                let addr = listening.local_addr;
                *self.lock_listening() = Some(listening);
                self.state
                    .store(ServiceState::Running as u8, Ordering::Release);
                tracing::info!(%addr, "bridge started");
                Ok(addr)
            }
            Err(err) => {
                self.state
                    .store(ServiceState::Stopped as u8, Ordering::Release);
                tracing::error!(error = %err, "bridge failed to start");
                Err(err)
            }
        }
    }

    fn listen(&self, wiring: &Wiring) -> Result<Listening, BridgeError> {
        let endpoint = self.config.endpoint();
        let bind_error = |source: std::io::Error| BridgeError::Bind {
            endpoint: endpoint.clone(),
            source,
        };
        // Bound before the runtime exists so a failed bind has nothing to tear down.
        let bound = std::net::TcpListener::bind(&endpoint).map_err(bind_error)?;
        bound.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = bound.local_addr().map_err(bind_error)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads)
            .thread_name("conduit-net")
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;
        let listener = {
            let _entered = runtime.enter();
            TcpListener::from_std(bound)
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(source) => {
                runtime.shutdown_background();
                return Err(bind_error(source));
            }
        };

        wiring.executor.open();
        let dispatcher = Arc::new(Dispatcher::new(
            wiring.registry.clone(),
            wiring.executor.clone(),
            self.config.request_timeout(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = runtime.spawn(connection::serve(
            listener,
            dispatcher,
            ConnectionLimits::from(&self.config),
            shutdown_rx,
        ));

        Ok(Listening {
            runtime,
            shutdown,
            server,
            local_addr,
        })
    }

    /// Close the listener and release all waiting work. Idempotent; never fails.
    pub fn stop(&self) {
        if self
            .state
            .compare_exchange(
                ServiceState::Running as u8,
                ServiceState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!(state = ?self.state(), "stop ignored: bridge not running");
            return;
        }

        let _stopped = StoppedOnExit(&self.state);

        let grace = self.config.shutdown_grace();
        if let Some(wiring) = self.wiring.get() {
            let released = wiring.executor.close();
            tracing::debug!(released, "host queue closed");
        }

        let listening = self.lock_listening().take();
        if let Some(listening) = listening {
            if tokio::runtime::Handle::try_current().is_ok() {
                // Blocking on or dropping a runtime panics inside async code.
                std::thread::scope(|scope| {
                    scope.spawn(|| listening.shut_down(grace));
                });
            } else {
                listening.shut_down(grace);
            }
        }

        if let Some(wiring) = self.wiring.get() {
            if !wiring.executor.wait_until_idle(grace) {
                tracing::warn!("a handler was still running on the host after shutdown grace");
            }
        }
    }

    /// Lock-free read usable from any thread.
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.lock_listening()
            .as_ref()
            .map(|listening| listening.local_addr)
            .ok_or(BridgeError::NotRunning)
    }

    /// Registered command names, empty before `initialize`.
    pub fn commands(&self) -> Vec<String> {
        self.wiring
            .get()
            .map(|wiring| wiring.registry.names())
            .unwrap_or_default()
    }

    /// Items queued for the host but not yet started.
    pub fn pending_work(&self) -> usize {
        self.wiring
            .get()
            .map(|wiring| wiring.executor.queued())
            .unwrap_or(0)
    }

    fn lock_listening(&self) -> std::sync::MutexGuard<'_, Option<Listening>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BridgeService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::BuiltinCommands;

    fn local_config() -> BridgeConfig {
        BridgeConfig {
            port: 0,
            shutdown_grace_ms: 200,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn start_requires_initialize() {
        let service = BridgeService::new(local_config());
        assert!(matches!(service.start(), Err(BridgeError::NotInitialized)));
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[test]
    fn initialize_runs_once() {
        let service = BridgeService::new(local_config());
        service.initialize(&[&BuiltinCommands]).unwrap();
        assert!(matches!(
            service.initialize(&[&BuiltinCommands]),
            Err(BridgeError::AlreadyInitialized)
        ));
        assert_eq!(service.commands(), vec!["echo", "ping"]);
        assert!(!service.is_running());
    }

    #[test]
    fn failed_initialize_can_be_retried() {
        let service = BridgeService::new(local_config());
        let err = service
            .initialize(&[&BuiltinCommands, &BuiltinCommands])
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateCommand(_)));
        assert!(service.initialize(&[&BuiltinCommands]).is_ok());
    }

    #[test]
    fn start_stop_cycle() {
        let service = BridgeService::new(local_config());
        let _pump = service.initialize(&[&BuiltinCommands]).unwrap();

        let addr = service.start().unwrap();
        assert!(service.is_running());
        assert_eq!(service.local_addr().unwrap(), addr);
        assert!(matches!(service.start(), Err(BridgeError::AlreadyRunning)));

        service.stop();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(matches!(service.local_addr(), Err(BridgeError::NotRunning)));

        service.stop();
        assert_eq!(service.state(), ServiceState::Stopped);

        service.start().expect("restart after stop");
        assert!(service.is_running());
        service.stop();
        assert!(!service.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_and_drop_from_async_code() {
        let service = BridgeService::new(local_config());
        let _pump = service.initialize(&[&BuiltinCommands]).unwrap();

        service.start().unwrap();
        service.stop();
        assert_eq!(service.state(), ServiceState::Stopped);

        service.start().expect("restart after stop");
        assert!(service.is_running());
        drop(service);
    }

    #[test]
    fn bind_failure_leaves_service_stopped() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let service = BridgeService::new(BridgeConfig {
            port,
            ..local_config()
        });
        service.initialize(&[&BuiltinCommands]).unwrap();

        let err = service.start().unwrap_err();
        assert!(matches!(err, BridgeError::Bind { .. }));
        assert_eq!(service.state(), ServiceState::Stopped);
    }
}
