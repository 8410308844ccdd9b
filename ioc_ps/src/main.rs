//! # Power-Supply Soft IOC Binary
//!
//! Serves the PVs of the configured power supplies over a BSMP serial
//! bus, with computed diagnostic PVs derived by the aggregation engine.
//!
//! # Usage
//!
//! ```bash
//! # Run against simulated devices
//! ioc_ps --config-dir config/ --simulate
//!
//! # Run against the configured serial adapter
//! ioc_ps --config-dir config/
//!
//! # Verbose logging
//! ioc_ps --config-dir config/ -s -v
//!
//! # Print the PV database as JSON and exit
//! ioc_ps --config-dir config/ --dump-db
//! ```

#![deny(warnings)]

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use ioc_bsmp::IoTransport;
use ioc_bsmp::transport::{SharedTransport, shared};
use ioc_common::config::load_config_dir;
use ioc_ps::app::App;
use ioc_ps::sim::SimBus;
use tracing::{error, info, trace};
use tracing_subscriber::EnvFilter;

/// Power-supply soft IOC over a BSMP serial bus
#[derive(Parser, Debug)]
#[command(name = "ioc_ps")]
#[command(author = "LNLS Controls")]
#[command(version)]
#[command(about = "Power-supply soft IOC: BSMP device controllers and computed diagnostics")]
#[command(long_about = None)]
struct Args {
    /// Path to the config directory (ioc.toml + devices.toml).
    #[arg(long, value_name = "DIR", default_value = "/etc/ioc-ps")]
    config_dir: PathBuf,

    /// Run against simulated devices instead of the serial adapter
    #[arg(short = 's', long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Print the PV database as JSON and exit
    #[arg(long)]
    dump_db: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("IOC startup failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    setup_tracing(&args);

    info!("Power-supply IOC v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = load_config_dir(&args.config_dir)?;

    let transport: SharedTransport = if args.simulate {
        info!("Simulation mode enabled");
        let addresses: Vec<u8> = config.devices.devices.iter().map(|d| d.address).collect();
        shared(SimBus::new(&addresses))
    } else {
        info!(device = %config.ioc.serial.device, "opening serial adapter");
        let stream = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.ioc.serial.device)?;
        shared(IoTransport::new(stream))
    };

    let mut app = App::new(&config, transport)?;

    if args.dump_db {
        println!("{}", serde_json::to_string_pretty(&app.dump_db())?);
        app.shutdown();
        return Ok(());
    }

    // Stand-in for the server-driver publish callback: every PV update
    // is visible at trace level.
    app.set_publisher(Arc::new(|name, value, severity| {
        trace!(pv = name, ?value, ?severity, "update published");
    }));

    // Setup signal handler.
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let interval = Duration::from_secs_f64(config.ioc.scan_interval_s);
    info!(
        interval_ms = interval.as_millis() as u64,
        "entering scan loop"
    );

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        app.process(interval);
        let elapsed = started.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }

    app.shutdown();
    info!("Power-supply IOC stopped");
    Ok(())
}

fn setup_tracing(args: &Args) {
    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
