/*!
# Scanner Application

Command-line front end for the turntable scanner: initializes the camera and
stage through the hardware worker, runs one full-rotation scan, and releases
the devices again.

## Usage

### Scan with the real worker
```bash
scanner --config scanner.toml scan
```

### Scan against the simulated worker
```bash
scanner scan --simulate --frames 8 --output-dir ./scans
```

### Generate a configuration file
```bash
scanner config --output scanner.toml
```

Logging goes to stderr and honors `RUST_LOG`.
*/

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scanner::config::{AppConfig, WorkerConfig};
use scanner::sim::{SimConfig, SimulatedWorker};
use scanner::worker::WorkerProcess;
use scanner::{Codec, JsonlScanRepository, Orchestrator};
use shared::protocol::WorkerEvent;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scanner")]
#[command(about = "Full-rotation turntable image capture")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "scanner.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the devices and capture one full rotation
    Scan {
        /// Frames per rotation
        #[arg(short, long)]
        frames: Option<u32>,

        /// Root directory for scan output
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Use the in-process simulated worker
        #[arg(long)]
        simulate: bool,

        /// Append scan records to this JSON-lines file
        #[arg(long)]
        records: Option<PathBuf>,
    },

    /// Print device status as JSON
    Status {
        /// Use the in-process simulated worker
        #[arg(long)]
        simulate: bool,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "scanner.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr to keep stdout for results
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Scan {
            frames,
            output_dir,
            simulate,
            records,
        } => {
            let mut config = load_config(&cli.config);
            if let Some(frames) = frames {
                config.scan.frame_count = frames;
            }
            if let Some(output_dir) = output_dir {
                config.scan.output_dir = output_dir;
            }
            if records.is_some() {
                config.persistence.records_path = records;
            }
            config.worker.simulate |= simulate;

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_scan(config))
        }

        Commands::Status { simulate } => {
            let mut config = load_config(&cli.config);
            config.worker.simulate |= simulate;

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(print_status(config))
        }

        Commands::Config { output } => generate_config_file(output),
    }
}

fn load_config(path: &Path) -> AppConfig {
    if !path.exists() {
        debug!("No config file at {}, using defaults", path.display());
        return AppConfig::new();
    }
    AppConfig::load_from_file(path).unwrap_or_else(|e| {
        eprintln!("⚠️ Failed to load config ({:#}), using defaults", e);
        AppConfig::new()
    })
}

/// Codec for the configured worker, plus the child process if one was started
fn connect_worker(config: &WorkerConfig) -> Result<(Codec, Option<WorkerProcess>)> {
    if config.simulate {
        println!("🧪 Using simulated camera and stage");
        return Ok((SimulatedWorker::new(SimConfig::default()).spawn(), None));
    }

    let worker = WorkerProcess::spawn(&config.executable, &config.args, config.request_timeout())
        .with_context(|| format!("Could not start worker {}", config.executable.display()))?;
    Ok((worker.codec(), Some(worker)))
}

async fn run_scan(config: AppConfig) -> Result<()> {
    let (codec, worker) = connect_worker(&config.worker)?;

    let orchestrator = match &config.persistence.records_path {
        Some(path) => {
            println!("💾 Recording scans to {}", path.display());
            Orchestrator::with_repository(codec, Arc::new(JsonlScanRepository::new(path)))
        }
        None => Orchestrator::new(codec),
    };

    let _progress = orchestrator.on_progress(|progress| {
        println!(
            "📸 Frame {}/{} at {:.1}°",
            progress.frame_number + 1,
            progress.total_frames,
            progress.position
        );
    });
    let _errors = orchestrator.on_error(|failure| {
        eprintln!(
            "❌ {:?} failed after {} frame(s): {}",
            failure.phase, failure.frames_captured, failure.message
        );
    });
    let _worker_events = orchestrator.on_worker_event(|event| match event {
        WorkerEvent::Progress(progress) => debug!("Worker: {}", progress.message),
        WorkerEvent::DeviceError(device_error) => warn!("Worker device error: {}", device_error.message),
        WorkerEvent::FrameReady(_) => {}
    });

    // Set up Ctrl+C handler; cleanup is the only way to stop a running scan
    let interrupted = Arc::new(Notify::new());
    let notify = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, releasing devices...");
        notify.notify_one();
    })?;
    let canceller = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            interrupted.notified().await;
            orchestrator.cleanup().await;
        })
    };

    let settings = config.scanner_settings();
    println!(
        "🚀 Starting scan: {} frames into {}",
        settings.frame_count,
        settings.output_dir.display()
    );

    let outcome = match orchestrator.initialize(settings).await {
        Ok(_) => Ok(orchestrator.scan().await),
        Err(e) => Err(e),
    };

    canceller.abort();
    let released = orchestrator.cleanup().await;
    if !released.success {
        eprintln!("⚠️ Not every device released cleanly");
    }
    if let Some(worker) = worker {
        worker.shutdown(Duration::from_secs(2)).await?;
    }

    let result = outcome.context("Scanner initialization failed")?;
    for warning in &result.warnings {
        eprintln!("⚠️ {}", warning);
    }
    if !result.success {
        bail!(
            "Scan failed after {} frame(s): {}",
            result.frames_captured,
            result.error.unwrap_or_default()
        );
    }

    println!(
        "✅ Captured {} frames into {}",
        result.frames_captured,
        result.output_path.display()
    );
    if let Some(scan_id) = &result.scan_id {
        println!("🆔 Scan id: {}", scan_id);
    }
    Ok(())
}

async fn print_status(config: AppConfig) -> Result<()> {
    let (codec, worker) = connect_worker(&config.worker)?;
    let orchestrator = Orchestrator::new(codec);

    let status = orchestrator.get_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if let Some(worker) = worker {
        worker.shutdown(Duration::from_secs(2)).await?;
    }
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   scanner --config {} scan", output_path.display());

    Ok(())
}
