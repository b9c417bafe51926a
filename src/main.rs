use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use drive_telemetry_rs::calibration::OrientationMode;
use drive_telemetry_rs::config::Config;
use drive_telemetry_rs::engine::Engine;
use drive_telemetry_rs::http::{HttpClient, HttpRegistry, HttpSink};
use drive_telemetry_rs::sensors;
use drive_telemetry_rs::session::SessionController;
use drive_telemetry_rs::sink::{LocalRegistry, MemorySink, SessionRegistry, TelemetrySink};
use log::{info, warn};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "drive_telemetry")]
#[command(about = "Replay a recorded drive through the telemetry engine", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Recorded drive (JSON lines, `{"readings": [...]}`, optionally .gz); `-` reads stdin
    #[arg(long, default_value = "-")]
    input: String,

    /// Logging server base URL; without it telemetry stays in memory (dry run)
    #[arg(long)]
    endpoint: Option<String>,

    /// Posted speed limit in km/h applied to the whole drive
    #[arg(long)]
    speed_limit: Option<f64>,

    /// Skip calibration and use this mounting orientation
    #[arg(long)]
    orientation: Option<OrientationMode>,

    /// Write live status JSON here on every flush tick
    #[arg(long)]
    status_path: Option<PathBuf>,

    /// Reproduce the recorded spacing between readings
    #[arg(long)]
    realtime: bool,

    /// Write the session summary JSON here
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if let Some(limit) = args.speed_limit {
        config.speed_limit_kmh = Some(limit);
    }
    if let Some(mode) = args.orientation {
        config.orientation_override = Some(mode);
    }
    if let Some(path) = &args.status_path {
        config.status_path = Some(path.clone());
    }

    config.validate()?;
    Ok(config)
}

fn read_input(input: &str) -> Result<Vec<sensors::SensorReading>> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(sensors::parse_readings(&text)?);
    }
    Ok(sensors::load_readings(PathBuf::from(input).as_path())?)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;

    info!("[{}] Drive Telemetry starting", ts_now());
    info!("  Input: {}", args.input);
    info!(
        "  Endpoint: {}",
        config.endpoint.as_deref().unwrap_or("none (dry run)")
    );

    let readings = read_input(&args.input)?;
    info!("  Readings: {}", readings.len());

    let (sink, registry): (Arc<dyn TelemetrySink>, Arc<dyn SessionRegistry>) =
        match &config.endpoint {
            Some(endpoint) => {
                let http = HttpClient::new(endpoint, config.request_timeout());
                (
                    Arc::new(HttpSink::new(http.clone())),
                    Arc::new(HttpRegistry::new(http)),
                )
            }
            None => (Arc::new(MemorySink::new()), Arc::new(LocalRegistry::new())),
        };

    let controller = SessionController::new(config.clone(), sink, registry);
    let (engine, handle) = Engine::new(controller, &config);
    let engine_task = tokio::spawn(engine.run());

    let session_id = handle.start().await?;
    info!("[{}] Session {} started", ts_now(), session_id);

    let stats = sensors::replay(&readings, &handle, args.realtime).await?;
    if stats.empty > 0 {
        warn!("{} readings carried no sensor data", stats.empty);
    }

    let summary = handle.end().await?;
    println!("{summary}");

    if let Some(path) = &args.summary_out {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }

    handle.shutdown().await?;
    engine_task.await??;

    if summary.undelivered_records > 0 {
        warn!(
            "{} records were not delivered before exit",
            summary.undelivered_records
        );
    }
    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
