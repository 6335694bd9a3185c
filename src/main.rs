//! canbus CLI entry point
//!
//! Dump traffic from a CAN interface, send single frames, or print an example
//! configuration.
//!
//! ```bash
//! canbus dump --interface vcan0 --filter 100:700 --count 10
//! canbus send --interface vcan0 123#DEADBEEF
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use canbus::core::logging::{BusLogConfig, LogContext, TracingLogHandler};
use canbus::prelude::*;
use canbus::protocols::can::EXAMPLE_CONFIG;

/// CAN bus client tool
#[derive(Parser, Debug)]
#[command(name = "canbus", version, about, long_about = None)]
struct Cli {
    /// Verbose logging (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print frames received on an interface
    Dump {
        /// CAN interface (overrides the configuration file)
        #[arg(short, long)]
        interface: Option<String>,

        /// Acceptance filter `<id>:<mask>` in hex (repeatable, up to 10)
        #[arg(short, long = "filter")]
        filters: Vec<FrameFilter>,

        /// Receive timeout in milliseconds
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,

        /// Stop after this many frames
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Do not print error frames
        #[arg(long)]
        no_error_frames: bool,
    },

    /// Send one frame in `<id>#<data>` notation
    Send {
        /// CAN interface (overrides the configuration file)
        #[arg(short, long)]
        interface: Option<String>,

        /// Frame, e.g. `123#DEADBEEF`, `18DAF110#02`, `123#R`
        frame: Frame,
    },

    /// Print an example configuration
    ExampleConfig,
}

/// Forwards captured frames to the main thread.
struct ChannelSink {
    tx: mpsc::Sender<CapturedFrame>,
}

impl FrameSink for ChannelSink {
    fn on_frame(&self, frame: &CapturedFrame) {
        let _ = self.tx.send(*frame);
    }

    fn on_error(&self, error: &str) {
        tracing::warn!("capture error: {}", error);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose { "info,canbus=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Dump {
            interface,
            filters,
            timeout_ms,
            count,
            no_error_frames,
        } => load_config(cli.config.as_ref(), interface).and_then(|config| {
            dump(
                config.with_read_timeout(Duration::from_millis(timeout_ms.max(1))),
                filters,
                count,
                no_error_frames,
            )
        }),
        Commands::Send { interface, frame } => {
            load_config(cli.config.as_ref(), interface).and_then(|config| send(config, &frame))
        }
        Commands::ExampleConfig => {
            print!("{}", EXAMPLE_CONFIG);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>, interface: Option<String>) -> Result<CanConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| CanbusError::config(format!("{}: {}", path.display(), e)))?;
            CanConfig::from_toml_str(&text)?
        }
        None => CanConfig::default(),
    };
    if let Some(interface) = interface {
        config.can_interface = interface;
    }
    config.validate()?;
    Ok(config)
}

fn open_client(config: CanConfig) -> Result<Arc<CanClient>> {
    let log = LogContext::new(config.can_interface.clone())
        .with_handler(Arc::new(TracingLogHandler))
        .with_config(BusLogConfig::all());
    let client = Arc::new(CanClient::new(config).with_logging(log));
    client.connect()?;
    Ok(client)
}

fn dump(
    config: CanConfig,
    filters: Vec<FrameFilter>,
    count: Option<u64>,
    no_error_frames: bool,
) -> Result<()> {
    let client = open_client(config)?;

    let (tx, rx) = mpsc::channel();
    let logger = CaptureLogger::new(
        Arc::clone(&client),
        Arc::new(ChannelSink { tx }),
    );
    for filter in filters {
        logger.add_filter(filter)?;
    }
    if no_error_frames {
        logger.set_flags(CaptureFlags::REMOTE_FRAMES);
    }
    logger.start()?;

    let mut printed = 0u64;
    while count.map_or(true, |n| printed < n) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(captured) => {
                println!("{}", captured);
                printed += 1;
            }
            Err(RecvTimeoutError::Timeout) if logger.is_running() => {}
            Err(_) => break,
        }
    }

    logger.stop();
    tracing::info!("capture finished: {:?}", logger.diagnostics());
    client.close()
}

fn send(config: CanConfig, frame: &Frame) -> Result<()> {
    let client = open_client(config)?;
    let written = client.write(frame);
    let closed = client.close();

    let nbytes = written?;
    tracing::info!("sent {} bytes: {}", nbytes, frame.render());
    closed
}
