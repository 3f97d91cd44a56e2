//! Headless operator console: runs the uplink, downlink and video sessions
//! and prints the status lines once a second.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use rovlink::config::LinkConfig;
use rovlink::diag::NetworkProber;
use rovlink::downlink::{Dispatch, TelemetryDownlink};
use rovlink::recorder::EventLog;
use rovlink::status::{self, LinkMonitor};
use rovlink::stream::CoalesceExt;
use rovlink::transport::{Endpoint, ZmqConnector};
use rovlink::uplink::{CommandUplink, InputSource, NeutralInput};
use rovlink::video::{GstLauncher, StreamCatalog, StreamManager, VideoBackend};
use rovlink::{Button, CommandFrame, TelemetryRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rovlink", about = "Topside link for a remotely operated vehicle")]
struct Args {
    /// Vehicle address; overrides ROV_HOST
    #[arg(long)]
    host: Option<String>,

    /// Command (pilot) port on the vehicle
    #[arg(long)]
    pilot_port: Option<u16>,

    /// Telemetry port on the vehicle
    #[arg(long)]
    sensor_port: Option<u16>,

    /// Video control port on the vehicle
    #[arg(long)]
    video_port: Option<u16>,

    /// Command publish rate in Hz
    #[arg(long)]
    rate: Option<f64>,

    /// Stick deadzone in [0, 1)
    #[arg(long)]
    deadzone: Option<f64>,

    /// Stream definitions (.json, .yaml or .yml)
    #[arg(long, env = "ROVLINK_STREAMS")]
    streams: Option<PathBuf>,

    /// Record pilot and sensor messages under this directory
    #[arg(long)]
    record: Option<PathBuf>,

    /// Keep every stream connected, not just the displayed one
    #[arg(long, default_value_t = false)]
    warm: bool,

    /// Gamepad index to read (gamepad builds only)
    #[arg(long, default_value_t = 0)]
    gamepad: usize,

    /// Log filter when RUST_LOG is not set
    #[arg(long, default_value = "rovlink=info")]
    log_filter: String,
}

fn build_config(args: &Args) -> Result<LinkConfig> {
    let mut config = LinkConfig::from_env().context("reading environment")?;
    if let Some(host) = &args.host {
        config = config.with_host(host);
    }
    let host = config.rov_host.clone();
    if let Some(port) = args.pilot_port {
        config.control_endpoint = Endpoint::tcp(&host, port);
    }
    if let Some(port) = args.sensor_port {
        config.telemetry_endpoint = Endpoint::tcp(&host, port);
    }
    if let Some(port) = args.video_port {
        config.video_rpc_endpoint = Endpoint::tcp(&host, port);
    }
    if let Some(rate) = args.rate {
        config.uplink.rate_hz = rate;
    }
    if let Some(deadzone) = args.deadzone {
        config.uplink.deadzone = deadzone;
    }
    config.video.warm_keep |= args.warm;
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "gamepad")]
fn input_source(args: &Args) -> Arc<dyn InputSource> {
    match rovlink::uplink::gamepad::GamepadInput::new(args.gamepad) {
        Ok(pad) => Arc::new(pad),
        Err(e) => {
            warn!(error = %e, "Gamepad unavailable, sending neutral input");
            Arc::new(NeutralInput)
        }
    }
}

#[cfg(not(feature = "gamepad"))]
fn input_source(_args: &Args) -> Arc<dyn InputSource> {
    warn!("Built without gamepad support, sending neutral input");
    Arc::new(NeutralInput)
}

/// Forwards telemetry to the recorder when one is running.
struct SensorSink(Option<rovlink::recorder::Recorder>);

impl Dispatch for SensorSink {
    fn dispatch(&mut self, record: &TelemetryRecord) -> bool {
        self.0.as_mut().is_none_or(|recorder| recorder.dispatch(record))
    }
}

async fn start_video(
    config: &LinkConfig,
    path: &Path,
    connector: Arc<ZmqConnector>,
) -> Result<StreamManager<ZmqConnector>> {
    let catalog = StreamCatalog::load(path).with_context(|| format!("loading {}", path.display()))?;
    let mut config = config.clone();
    if let Some(endpoint) = catalog.video_endpoint()? {
        config.video_rpc_endpoint = endpoint;
    }
    let receive_host = match config.video.receive_host.clone().or_else(|| catalog.receive_host.clone()) {
        Some(host) => host,
        None => rovlink::diag::local_receive_host(config.video_rpc_endpoint.host())
            .await
            .context("choosing the local video address")?
            .to_string(),
    };
    info!(streams = catalog.streams.len(), %receive_host, "Video configured");

    let backend = VideoBackend {
        connector,
        launcher: Arc::new(GstLauncher::from_config(&config.video)?),
        receive_host,
    };
    let mut manager = StreamManager::new(&catalog, config, backend);
    manager.start();
    Ok(manager)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&args)?;
    info!(host = %config.rov_host, control = %config.control_endpoint, telemetry = %config.telemetry_endpoint, "Starting rovlink");
    let connector = Arc::new(ZmqConnector::new());

    let mut event_log = match &args.record {
        Some(base) => {
            let dir = EventLog::session_dir(base).await?;
            Some(EventLog::open(dir.join("streams.jsonl")).await?)
        }
        None => None,
    };
    let recorder = event_log.as_ref().map(EventLog::recorder);

    let mut uplink = CommandUplink::spawn(&config, Arc::clone(&connector), input_source(&args));
    let mut frames = uplink.take_frames();
    let mut controller = Box::pin(uplink.status_updates().coalesce(Duration::from_millis(500)));
    let mut downlink = TelemetryDownlink::spawn(&config, Arc::clone(&connector), SensorSink(recorder.clone()));
    let mut prober = NetworkProber::new(config.rov_host.clone()).spawn(downlink.watch(), Duration::from_secs(2));

    let mut video = match &args.streams {
        Some(path) => match start_video(&config, path, Arc::clone(&connector)).await {
            Ok(manager) => Some(manager),
            Err(e) => {
                warn!("Video disabled: {e:#}");
                None
            }
        },
        None => None,
    };

    let mut monitor = LinkMonitor::default();
    let mut last_frame: Option<CommandFrame> = None;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(state) = controller.next() => info!(%state, "Controller"),
            frame = async { match frames.as_mut() { Some(rx) => rx.recv().await, None => std::future::pending().await } } => {
                let Some(frame) = frame else {
                    frames = None;
                    continue;
                };
                if let Some(recorder) = &recorder {
                    recorder.record_frame(&frame);
                }
                if let Some(manager) = video.as_mut() {
                    if frame.edges.get(&Button::B) == Some(&rovlink::Edge::Down) {
                        manager.next().await;
                    } else if frame.edges.get(&Button::X) == Some(&rovlink::Edge::Down) {
                        manager.prev().await;
                    }
                }
                last_frame = Some(frame);
            }
            _ = ticker.tick() => {
                let snapshot = downlink.latest();
                let active = video.as_ref().and_then(|manager| manager.active());
                let lines = [
                    monitor.link_line(&snapshot, Instant::now()),
                    status::controller_line(&uplink.status()),
                    status::video_line(active.map(|session| session.name()), active.map(|session| session.status()).as_ref()),
                    status::mode_line(last_frame.as_ref()),
                    status::depth_line(&snapshot),
                    status::power_line(&snapshot),
                    prober.latest().to_string(),
                ];
                println!("{}", lines.join("  "));
            }
        }
    }

    info!("Shutting down");
    if let Some(manager) = video.as_mut() {
        manager.stop_all().await;
    }
    uplink.stop().await;
    downlink.stop().await;
    prober.stop().await;
    if let Some(log) = event_log.as_mut() {
        log.stop().await;
        info!(path = %log.path().display(), dropped = log.dropped(), "Event log closed");
    }
    Ok(())
}
