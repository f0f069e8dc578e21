//! MemsFCR - Rover MEMS 1.6 fault code reader
//!
//! Connects to the ECU over a serial cable (or the built-in emulator),
//! serves the web interface over a websocket and logs live data.

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use memsfcr::config::{self, Config, LoopCount, Output};
use memsfcr::constants::serial as serial_constants;
use memsfcr::serial;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "memsfcr", version)]
#[command(about = "Rover MEMS 1.6 fault code reader and data logger")]
struct Args {
    /// Serial port name, or "emulator" to run without hardware
    #[arg(short, long)]
    port: Option<String>,

    /// Number of data frames to read, or "inf"
    #[arg(short, long = "loop")]
    loop_count: Option<LoopCount>,

    /// Where logged frames go: stdout or file
    #[arg(short, long)]
    output: Option<Output>,

    /// Log data frames
    #[arg(long)]
    logging: bool,

    /// Configuration file (TOML), defaults to ~/memsfcr/memsfcr.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket port for the web interface
    #[arg(long)]
    ws_port: Option<u16>,

    /// Connect to the ECU at startup
    #[arg(long)]
    connect: bool,

    /// Debug logging, also written to ~/memsfcr/logs
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    /// Command line flags win over the configuration file
    fn apply(&self, config: &mut Config) {
        if let Some(port) = &self.port {
            config.port = port.clone();
        }
        if let Some(loop_count) = self.loop_count {
            config.loop_count = loop_count;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(ws_port) = self.ws_port {
            config.ws_port = ws_port;
        }
        config.logging |= self.logging;
        config.connect_on_start |= self.connect;
    }
}

fn init_logging(debug: bool) -> Result<Option<PathBuf>> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact();

    if !debug {
        builder.init();
        return Ok(None);
    }

    let folder = config::default_log_folder();
    fs::create_dir_all(&folder)?;
    let path = folder.join(format!("debug-{}.log", Local::now().format("%Y-%m-%d-%H%M%S")));
    let file = File::create(&path)?;

    builder
        .with_ansi(false)
        .with_writer(io::stdout.and(Mutex::new(file)))
        .init();
    Ok(Some(path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let debug_log = init_logging(args.debug)?;

    info!("MemsFCR v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = debug_log {
        info!("Debug log: {}", path.display());
    }

    let config_path = args.config.clone().or_else(config::default_config_path);
    let mut config = Config::load_or_default(config_path.as_deref())?;
    args.apply(&mut config);

    info!("Scanning for serial ports...");
    config.ports = serial::list_ports().into_iter().map(|p| p.name).collect();
    config.ports.push(serial_constants::EMULATOR_PORT.to_string());

    info!(
        "Port '{}', loop {}, logging {} ({:?})",
        config.port, config.loop_count, config.logging, config.output
    );
    info!("Open the web interface and connect to ws://localhost:{}", config.ws_port);

    let outcome = memsfcr::run(config).await?;
    info!("Finished: {:?}", outcome);

    Ok(())
}
