mod commands;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use commands::Script;
use model::SessionId;
use pathcue_core::{channel, Collaborators, Engine, EngineConfig};
use pathcue_google::{GoogleConfig, GoogleMaps};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Drive the walking assistant from a request script, printing events as NDJSON.
#[derive(Parser, Debug)]
#[command(name = "pathcue", version, about)]
struct Args {
    /// Engine settings (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Request script, one JSON request per line. Reads stdin when omitted.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Recorded detector output (NDJSON) replayed against synthetic frames.
    #[arg(long)]
    detections: Option<PathBuf>,

    /// Position trace (CSV `t_ms,lat,lng`) fed as realtime fixes.
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Session that receives the trace. The first connected session otherwise.
    #[arg(long)]
    trace_session: Option<String>,

    #[arg(long, env = "GOOGLE_MAPS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pathcue_cli=info,pathcue_core=info,pathcue_google=info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    // detection loops and navigations notice cancellation within one of these
    let grace = cfg.navigation.poll_interval().max(cfg.capture.device_retry());

    if args.api_key.is_none() {
        warn!("GOOGLE_MAPS_API_KEY is not set, directions and geocoding will fail");
    }
    let maps = Arc::new(GoogleMaps::new(GoogleConfig { api_key: args.api_key.clone(), ..Default::default() })?);

    let detector = match &args.detections {
        Some(path) => {
            let script = iox::load_detection_script(path)?;
            info!(frames = script.len(), labels = ?iox::label_counts(&script), "detection script loaded");
            iox::ReplayDetector::new(script)
        }
        None => iox::ReplayDetector::empty(),
    };
    let trace = match &args.trace {
        Some(path) => Some(iox::import_position_trace(path)?),
        None => None,
    };

    let (tx, rx) = channel();
    let pump = session::pump_events(rx, std::io::stdout());
    let engine = Engine::new(
        cfg,
        Collaborators {
            directions: maps.clone(),
            geolocator: maps,
            detector: Arc::new(detector),
            cameras: Arc::new(iox::SyntheticCameraFactory),
        },
        tx,
    );

    let mut script = Script::new(engine.clone(), trace, args.trace_session.map(SessionId::from));
    match &args.script {
        Some(path) => script.run(BufReader::new(tokio::fs::File::open(path).await?)).await?,
        None => script.run(BufReader::new(tokio::io::stdin())).await?,
    }

    info!(sessions = engine.sessions().len(), "shutting down");
    engine.shutdown();
    script.abort_replays();
    tokio::time::sleep(grace).await;
    drop(script);
    drop(engine);

    // remaining senders live in tasks that are winding down
    let written = tokio::task::spawn_blocking(move || pump.join()).await?;
    match written {
        Ok(n) => info!(events = n, "done"),
        Err(_) => warn!("event pump panicked"),
    }
    Ok(())
}
