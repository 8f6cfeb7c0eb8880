#![allow(dead_code)]

use conduit_bridge::{
    typed, BridgeError, CommandRegistry, CommandSource, HandlerError, HandlerResult, HostPump,
};
use conduit_core::BridgeConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub fn local_config() -> BridgeConfig {
    BridgeConfig {
        port: 0,
        request_timeout_secs: 5,
        idle_timeout_secs: 30,
        shutdown_grace_ms: 500,
        ..BridgeConfig::default()
    }
}

/// Stands in for the host application's main thread.
pub struct HostThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HostThread {
    pub fn spawn(pump: HostPump) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("host-main".into())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    pump.on_idle();
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for HostThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Blocking line-oriented client.
pub struct LineClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl LineClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let writer = stream.try_clone().unwrap();
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.writer.set_read_timeout(Some(timeout)).unwrap();
    }

    pub fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
        self.writer.flush().unwrap();
    }

    /// Write bytes as-is, without a terminator.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
        self.writer.flush().unwrap();
    }

    pub fn send(&mut self, request: &Value) {
        self.send_line(&request.to_string());
    }

    /// Next response, `None` on EOF.
    pub fn recv(&mut self) -> Option<Value> {
        self.try_recv().unwrap()
    }

    pub fn try_recv(&mut self) -> std::io::Result<Option<Value>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&line).unwrap()))
    }

    pub fn call(&mut self, request: Value) -> Value {
        self.send(&request);
        self.recv().expect("connection closed before response")
    }
}

#[derive(Deserialize)]
struct SleepParams {
    ms: u64,
}

/// Extra commands used by the integration suite.
#[derive(Default)]
pub struct TestCommands {
    pub counted: Arc<AtomicUsize>,
}

impl CommandSource for TestCommands {
    fn name(&self) -> &str {
        "test"
    }

    fn register(&self, registry: &mut CommandRegistry) -> Result<(), BridgeError> {
        registry.register("fail", |_: Value| -> HandlerResult {
            Err(HandlerError::new("no active document"))
        })?;
        registry.register(
            "sleep",
            typed(|params: SleepParams| {
                thread::sleep(Duration::from_millis(params.ms));
                Ok::<_, HandlerError>(json!({ "slept": params.ms }))
            }),
        )?;
        let counted = self.counted.clone();
        registry.register("count", move |_: Value| -> HandlerResult {
            Ok(json!(counted.fetch_add(1, Ordering::SeqCst) + 1))
        })?;
        registry.register("thread", |_: Value| -> HandlerResult {
            Ok(json!(thread::current().name().unwrap_or("")))
        })?;
        Ok(())
    }
}
