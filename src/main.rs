use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use strand::config::Config;
use strand::json as tree;
use strand::runtime::{Runtime, RuntimeConfig, RuntimeHandle};
use strand::server::Host;

const EXIT_BAD_ARGS: u8 = 1;
const EXIT_CANT_READ: u8 = 2;
const EXIT_CANT_OPEN: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "strand", version, about = "Embedded HTTP/WebSocket server")]
struct Args {
    /// Configuration file (JSON, or YAML by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen endpoint, e.g. http://:8080 (repeatable, replaces web.listen)
    #[arg(short, long)]
    listen: Vec<String>,

    /// Trace level or filter directive (overrides RUST_LOG)
    #[arg(short, long)]
    trace: Option<String>,

    /// Show request/response headers and bodies: any of H, B, h, b
    #[arg(long)]
    show: Option<String>,

    /// Exit after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Disable all timeouts
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_BAD_ARGS)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let filter = match &args.trace {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::from(EXIT_CANT_READ);
        }
    };

    match serve(&args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut overrides = json!({});
    if !args.listen.is_empty() {
        tree::set(&mut overrides, "web.listen", json!(args.listen));
    }
    if let Some(show) = &args.show {
        tree::set(&mut overrides, "web.show", Value::String(show.clone()));
    }
    match &args.config {
        Some(path) => Config::load(path, Some(overrides)),
        None => Config::from_value(overrides),
    }
}

fn serve(args: &Args, config: Config) -> Result<(), u8> {
    let rt = Runtime::new(RuntimeConfig {
        max_fibers: config.web.limits.fibers,
        timeouts_enabled: !args.debug,
        ..RuntimeConfig::default()
    })
    .map_err(|e| {
        tracing::error!(error = %e, "Cannot create runtime");
        EXIT_CANT_OPEN
    })?;

    let host = Host::new(config.web).map_err(|e| {
        tracing::error!(error = %e, "Invalid web configuration");
        EXIT_CANT_READ
    })?;
    let host = Rc::new(host);
    host.start(&rt).map_err(|e| {
        tracing::error!(error = %e, "Cannot open listener");
        EXIT_CANT_OPEN
    })?;

    watch_ctrl_c(rt.handle());
    let deadline = args.timeout.and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));
    let result = rt.run_until(deadline);

    host.stop();
    rt.close();
    result.map_err(|e| {
        tracing::error!(error = %e, "Event loop failed");
        EXIT_CANT_OPEN
    })
}

/// Waits for Ctrl-C on a helper thread and stops the runtime.
fn watch_ctrl_c(handle: RuntimeHandle) {
    let spawned = std::thread::Builder::new()
        .name("strand-signal".to_string())
        .spawn(move || {
            let signals = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(signals) => signals,
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot watch for Ctrl-C");
                    return;
                }
            };
            if signals.block_on(tokio::signal::ctrl_c()).is_ok() {
                tracing::info!("Shutdown signal received");
                handle.stop();
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "Cannot start signal thread");
    }
}
