//! Local receiver pipeline: `gst-launch-1.0` turning RTP into raw BGR frames.
//!
//! The child process writes fixed-size frames to stdout; a reader task cuts
//! them out with `read_exact` and stores each in the session's frame slot.
//! The reader does no per-pixel work. Stderr is forwarded to `tracing`.

use super::frame::{FrameGeometry, FrameSink};
use super::port_guard::{self, PortGuard};
use super::rpc::VideoFormat;
use crate::config::VideoConfig;
use crate::driver::{StopOutcome, Worker};
use crate::{LinkError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const GST_LAUNCH: &str = "gst-launch-1.0";

/// Everything needed to start one receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverSpec {
    pub name: String,
    pub format: VideoFormat,
    pub bind_address: String,
    pub port: u16,
    pub latency_ms: u32,
    pub geometry: FrameGeometry,
}

impl ReceiverSpec {
    /// Arguments for `gst-launch-1.0`; `-q` keeps stdout free of anything but frames.
    pub fn gst_args(&self) -> Vec<String> {
        let (caps, depay, decode) = match self.format {
            VideoFormat::Mjpeg => (
                "application/x-rtp,media=video,encoding-name=JPEG,payload=26,clock-rate=90000",
                "rtpjpegdepay",
                "jpegdec",
            ),
            VideoFormat::H264 => (
                "application/x-rtp,media=video,encoding-name=H264,payload=96,clock-rate=90000",
                "rtph264depay",
                "avdec_h264",
            ),
        };
        let raw_caps = format!(
            "video/x-raw,format=BGR,width={},height={},colorimetry=1:4:0:0,range=full",
            self.geometry.width, self.geometry.height
        );

        [
            "-q".to_string(),
            "udpsrc".into(),
            format!("address={}", self.bind_address),
            format!("port={}", self.port),
            format!("caps={caps}"),
            "!".into(),
            "rtpjitterbuffer".into(),
            format!("latency={}", self.latency_ms),
            "!".into(),
            depay.into(),
            "!".into(),
            decode.into(),
            "!".into(),
            "videoconvert".into(),
            "!".into(),
            raw_caps,
            "!".into(),
            "fdsink".into(),
            "fd=1".into(),
        ]
        .into()
    }
}

/// Locate `gst-launch-1.0`: an explicit path if it exists, else `PATH`.
pub fn find_gst_launch(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        warn!(path = %path.display(), "Configured gst-launch not found, searching PATH");
    }

    let names = [GST_LAUNCH.to_string(), format!("{GST_LAUNCH}.exe")];
    std::env::var_os("PATH")
        .into_iter()
        .flat_map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| LinkError::process("gst-launch-1.0 not found on PATH and GST_LAUNCH not set", None))
}

/// Starts receivers. Swapped for a scripted double in tests.
#[async_trait]
pub trait ReceiverLauncher: Send + Sync {
    async fn launch(&self, spec: &ReceiverSpec, sink: FrameSink) -> Result<Box<dyn RunningReceiver>>;
}

/// A started receiver, owned by its session task.
#[async_trait]
pub trait RunningReceiver: Send {
    /// False once the pipeline has exited.
    fn is_alive(&mut self) -> bool;

    /// Ask the pipeline to exit, force it after `grace`.
    async fn stop(&mut self, grace: Duration);
}

/// Launches real GStreamer pipelines.
#[derive(Debug, Clone)]
pub struct GstLauncher {
    program: PathBuf,
    guard: PortGuard,
    /// How long a leftover receiver gets to release its port, per signal.
    evict_grace: Duration,
}

impl GstLauncher {
    pub fn new(program: PathBuf, allow_list: Vec<String>) -> Self {
        Self { program, guard: PortGuard::new(allow_list), evict_grace: Duration::from_secs(1) }
    }

    pub fn from_config(config: &VideoConfig) -> Result<Self> {
        let program = find_gst_launch(config.gst_launch.as_deref())?;
        info!(program = %program.display(), "Using GStreamer receiver");
        let mut launcher = Self::new(program, config.kill_allow_list.clone());
        launcher.evict_grace = config.terminate_grace;
        Ok(launcher)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl ReceiverLauncher for GstLauncher {
    async fn launch(&self, spec: &ReceiverSpec, sink: FrameSink) -> Result<Box<dyn RunningReceiver>> {
        let port = spec.port;
        let holding = self.guard.clear(port, self.evict_grace).await;
        if !holding.is_empty() {
            return Err(LinkError::process(format!("port {port} still held by leftover receiver {holding:?}"), None));
        }

        let args = spec.gst_args();
        info!(stream = %spec.name, port = spec.port, "Starting receiver: {} {}", self.program.display(), args.join(" "));
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LinkError::process(format!("failed to spawn {}", self.program.display()), Some(e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LinkError::process("receiver stdout not captured", None))?;
        let stderr = child.stderr.take();

        let reader = Worker::spawn("video-reader", move |cancel| read_frames(stdout, sink, cancel));
        let name = spec.name.clone();
        let logger = stderr.map(|pipe| Worker::spawn("video-stderr", move |cancel| forward_stderr(pipe, name, cancel)));

        Ok(Box::new(GstReceiver { name: spec.name.clone(), child, reader, logger }))
    }
}

struct GstReceiver {
    name: String,
    child: Child,
    reader: Worker,
    logger: Option<Worker>,
}

#[async_trait]
impl RunningReceiver for GstReceiver {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn stop(&mut self, grace: Duration) {
        if self.is_alive() {
            info!(stream = %self.name, "Stopping receiver");
            let asked = self.child.id().is_some_and(port_guard::terminate);
            let exited = asked && tokio::time::timeout(grace, self.child.wait()).await.is_ok();
            if !exited {
                if let Err(e) = self.child.kill().await {
                    debug!(stream = %self.name, error = %e, "Receiver kill failed");
                }
            }
        }
        let pipes = Duration::from_millis(200);
        if self.reader.stop(pipes).await == StopOutcome::Aborted {
            debug!(stream = %self.name, "Frame reader aborted");
        }
        if let Some(logger) = self.logger.as_mut() {
            logger.stop(pipes).await;
        }
    }
}

/// Cut the pipe into frames until it closes.
pub(crate) async fn read_frames<R>(mut pipe: R, mut sink: FrameSink, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let frame_len = sink.geometry().byte_len();
    loop {
        let mut buf = vec![0u8; frame_len];
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = pipe.read_exact(&mut buf) => read,
        };
        match read {
            Ok(_) => {
                sink.push(buf);
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(epoch = sink.epoch(), "Receiver pipe closed");
                break;
            }
            Err(e) => {
                warn!(epoch = sink.epoch(), error = %e, "Receiver pipe read failed");
                break;
            }
        }
    }
}

async fn forward_stderr<R>(pipe: R, name: String, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => info!(stream = %name, "[gst] {}", line.trim_end()),
            Ok(None) | Err(_) => break,
        }
    }
}
