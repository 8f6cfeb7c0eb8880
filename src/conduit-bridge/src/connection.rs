//! Listener, per-connection sessions and response writers.
//!
//! Each accepted connection gets a reader loop (this task), one task per
//! in-flight request and a single writer task that owns the write half, so
//! responses finishing concurrently are written as whole frames.

use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::frame::{write_frame, FrameError, FrameReader};
use crate::protocol::Response;
use conduit_core::BridgeConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Per-listener resource limits.
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_in_flight: usize,
    pub idle_timeout: Duration,
    pub max_frame_bytes: usize,
    pub shutdown_grace: Duration,
}

impl From<&BridgeConfig> for ConnectionLimits {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_in_flight: config.max_in_flight_per_connection,
            idle_timeout: config.idle_timeout(),
            max_frame_bytes: config.max_frame_bytes,
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// Resolves once shutdown is requested or the controller went away.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Accept connections until shutdown, then give open sessions
/// `shutdown_grace` to flush before aborting them.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    limits: ConnectionLimits,
    mut shutdown: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(limits.max_connections));
    let mut sessions = JoinSet::new();
    let local = listener.local_addr().ok();
    tracing::info!(addr = ?local, max_connections = limits.max_connections, "bridge listening");

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => match slots.clone().try_acquire_owned() {
                    Ok(slot) => {
                        sessions.spawn(run_session(
                            stream,
                            peer,
                            dispatcher.clone(),
                            limits.clone(),
                            shutdown.clone(),
                            slot,
                        ));
                    }
                    Err(_) => {
                        tracing::warn!(%peer, limit = limits.max_connections, "connection refused: limit reached");
                        tokio::spawn(refuse(stream, peer, limits.max_connections));
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        tracing::error!(error = %err, "connection task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    let open = sessions.len();
    tracing::info!(open, "listener closed; draining connections");
    let drained = tokio::time::timeout(limits.shutdown_grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = sessions.len(), "closing connections forcibly");
        sessions.shutdown().await;
    }
}

async fn refuse(mut stream: TcpStream, peer: SocketAddr, limit: usize) {
    let response = Response::failure(
        None,
        &BridgeError::ServiceUnavailable(format!("connection limit of {limit} reached")),
    );
    if let Err(err) = write_frame(&mut stream, &response).await {
        tracing::debug!(%peer, error = %err, "failed to send refusal");
    }
    let _ = stream.shutdown().await;
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    limits: ConnectionLimits,
    mut shutdown: watch::Receiver<bool>,
    _slot: OwnedSemaphorePermit,
) {
    tracing::debug!(%peer, "connection opened");
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut frames = FrameReader::new(read_half, limits.max_frame_bytes);
    let (outbound, queue) = mpsc::channel::<Response>(limits.max_in_flight);
    let writer = tokio::spawn(write_responses(write_half, queue, peer));
    let in_flight = Arc::new(Semaphore::new(limits.max_in_flight));

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                tracing::debug!(%peer, "closing connection for shutdown");
                break;
            }
            next = tokio::time::timeout(limits.idle_timeout, frames.next_frame()) => next,
        };

        let frame = match next {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                tracing::debug!(%peer, "peer closed connection");
                break;
            }
            Ok(Err(FrameError::TooLarge { limit })) => {
                tracing::warn!(%peer, limit, "frame too large; closing connection");
                let err = BridgeError::Connection(format!("frame exceeds {limit} bytes"));
                let _ = outbound.send(Response::failure(None, &err)).await;
                break;
            }
            Ok(Err(err)) => {
                tracing::warn!(%peer, error = %err, "read failed; closing connection");
                break;
            }
            Err(_elapsed) => {
                if in_flight.available_permits() < limits.max_in_flight {
                    continue;
                }
                if frames.has_partial() {
                    tracing::info!(%peer, idle = ?limits.idle_timeout, "closing connection stalled mid-frame");
                } else {
                    tracing::info!(%peer, idle = ?limits.idle_timeout, "closing idle connection");
                }
                break;
            }
        };

        // Backpressure: stop reading until a request slot frees up.
        let permit = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            permit = in_flight.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let dispatcher = dispatcher.clone();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            let response = dispatcher.dispatch(&frame).await;
            if outbound.send(response).await.is_err() {
                tracing::debug!(%peer, "connection gone; response discarded");
            }
            drop(permit);
        });
    }

    // The writer finishes once every in-flight request has reported.
    drop(outbound);
    if let Err(err) = writer.await {
        tracing::error!(%peer, error = %err, "response writer failed");
    }
    tracing::debug!(%peer, "connection closed");
}

async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Response>,
    peer: SocketAddr,
) {
    while let Some(response) = queue.recv().await {
        if let Err(err) = write_frame(&mut writer, &response).await {
            tracing::warn!(%peer, error = %err, "write failed; dropping remaining responses");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
