//! Minimal async client for the bridge protocol, used by the CLI and tests.

use crate::frame::{FrameError, FrameReader};
use crate::protocol::{Request, RequestId, Response};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

const CLIENT_MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(std::io::Error),
    #[error("failed to send request: {0}")]
    Write(std::io::Error),
    #[error("failed to read response: {0}")]
    Read(#[from] FrameError),
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("request/response ID mismatch: sent {sent}, received {received}")]
    IdMismatch { sent: RequestId, received: String },
    #[error("bridge closed the connection")]
    Closed,
}

pub struct BridgeClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: AtomicU64,
}

impl BridgeClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half, CLIENT_MAX_FRAME),
            writer: write_half,
            next_id: AtomicU64::new(1),
        })
    }

    /// Send `command` with a fresh numeric id and wait for its response.
    ///
    /// Assumes no other request is outstanding on this client.
    pub async fn call(&mut self, command: &str, parameters: Value) -> Result<Response, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.call_with_id(Value::from(id), command, parameters).await
    }

    pub async fn call_with_id(
        &mut self,
        id: RequestId,
        command: &str,
        parameters: Value,
    ) -> Result<Response, ClientError> {
        let request = Request::new(id.clone(), command, parameters);
        self.send(&request).await?;
        let response = self.recv().await?.ok_or(ClientError::Closed)?;
        if response.id.as_ref() != Some(&id) {
            return Err(ClientError::IdMismatch {
                sent: id,
                received: response
                    .id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "null".into()),
            });
        }
        Ok(response)
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let mut bytes = serde_json::to_vec(request)?;
        bytes.push(b'\n');
        self.send_raw(&bytes).await
    }

    /// Write bytes as-is; framing is the caller's responsibility.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(bytes).await.map_err(ClientError::Write)?;
        self.writer.flush().await.map_err(ClientError::Write)
    }

    /// Next response in arrival order, or `None` once the bridge hangs up.
    pub async fn recv(&mut self) -> Result<Option<Response>, ClientError> {
        match self.reader.next_frame().await? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}
