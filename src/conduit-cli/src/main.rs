use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conduit_bridge::{
    BestEffort, BridgeClient, BridgeError, BridgeService, BuiltinCommands, CommandRegistry,
    CommandSource, HandlerResult, PumpOutcome,
};
use conduit_core::{init_logging, AppDirs, BridgeConfig, Config};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "conduit", version, about = "Command bridge for single-threaded hosts")]
struct Cli {
    /// Listen/connect host override (takes precedence over config)
    #[arg(long, global = true)]
    host: Option<String>,
    /// Port override (takes precedence over config)
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the bridge inside a simulated host that pumps it on every idle tick
    Serve(ServeCommand),
    /// Send a single request and print the response
    Call(CallCommand),
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Parser, Clone)]
struct ServeCommand {
    /// Milliseconds between host idle ticks
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,
}

#[derive(Debug, Parser, Clone)]
struct CallCommand {
    /// Command name to invoke
    command: String,
    /// Parameters as a JSON document
    #[arg(long, default_value = "{}")]
    params: String,
    /// Correlation id (numeric ids are sent as numbers)
    #[arg(long, default_value = "1")]
    id: String,
}

#[derive(Debug, Error)]
enum CallError {
    #[error("--params is not valid JSON: {0}")]
    Params(#[source] serde_json::Error),
    #[error("bridge answered with failure: {0}")]
    Failed(String),
}

impl CallCommand {
    fn parameters(&self) -> Result<Value, CallError> {
        serde_json::from_str(&self.params).map_err(CallError::Params)
    }

    fn request_id(&self) -> Value {
        match self.id.parse::<u64>() {
            Ok(numeric) => Value::from(numeric),
            Err(_) => Value::from(self.id.clone()),
        }
    }
}

/// Commands backed by the simulated host's own state.
struct DemoHost {
    started: Instant,
}

impl CommandSource for DemoHost {
    fn name(&self) -> &str {
        "demo-host"
    }

    fn register(&self, registry: &mut CommandRegistry) -> Result<(), BridgeError> {
        let started = self.started;
        registry.register("host.info", move |_: Value| -> HandlerResult {
            let mut info = BestEffort::new();
            info.set("pid", std::process::id())
                .set("uptime_secs", started.elapsed().as_secs())
                .optional("thread", || thread::current().name().map(str::to_string))
                .field("cwd", || {
                    std::env::current_dir().map(|dir| dir.display().to_string())
                })
                .field("hostname", || std::env::var("HOSTNAME"));
            Ok(info.into_value())
        })
    }
}

fn apply_overrides(mut bridge: BridgeConfig, cli: &Cli) -> BridgeConfig {
    if let Some(host) = &cli.host {
        bridge.host = host.clone();
    }
    if let Some(port) = cli.port {
        bridge.port = port;
    }
    bridge
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let bridge = apply_overrides(config.bridge.clone(), &cli);
    bridge.validate()?;

    match &cli.command {
        Command::Serve(serve) => {
            let _logging = init_logging(&config.logging, &dirs)?;
            run_host(bridge, serve)
        }
        Command::Call(call) => run_call(&bridge, call),
        Command::Config => {
            println!("# {}", Config::config_path(&dirs).display());
            let effective = Config {
                bridge,
                ..config
            };
            print!("{}", toml::to_string_pretty(&effective)?);
            Ok(())
        }
    }
}

/// Plays the host application: this thread is the "main" thread and only
/// hands control to the bridge between its own ticks.
fn run_host(bridge: BridgeConfig, serve: &ServeCommand) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    watch_ctrl_c(running.clone())?;

    let service = BridgeService::new(bridge);
    let demo = DemoHost {
        started: Instant::now(),
    };
    let pump = service.initialize(&[&BuiltinCommands, &demo])?;
    let addr = service.start()?;
    tracing::info!(%addr, commands = ?service.commands(), "simulated host ready");
    println!("conduit listening on {addr} (Ctrl-C to stop)");

    let tick = Duration::from_millis(serve.tick_ms.max(1));
    while running.load(Ordering::SeqCst) {
        if let PumpOutcome::Executed { command } = pump.on_idle() {
            tracing::trace!(%command, "idle tick ran a command");
        }
        thread::sleep(tick);
    }

    tracing::info!("shutdown requested");
    service.stop();
    Ok(())
}

fn watch_ctrl_c(running: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    thread::Builder::new()
        .name("conduit-signal".into())
        .spawn(move || {
            if let Err(err) = runtime.block_on(tokio::signal::ctrl_c()) {
                tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                return;
            }
            running.store(false, Ordering::SeqCst);
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

fn run_call(bridge: &BridgeConfig, call: &CallCommand) -> Result<()> {
    let parameters = call.parameters()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build client runtime")?;

    let response = runtime.block_on(async {
        let mut client = BridgeClient::connect(bridge.endpoint()).await?;
        client
            .call_with_id(call.request_id(), &call.command, parameters)
            .await
    })?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    if let Some(error) = response.error {
        return Err(CallError::Failed(error).into());
    }
    Ok(())
}
