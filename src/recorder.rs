//! Newline-delimited JSON event log.
//!
//! Each line is `{"t": <epoch seconds>, "stream": "pilot"|"sensors", "msg": <payload>}`.
//! Recording never blocks the caller: records go through a bounded queue to a
//! writer task and are dropped when the queue is full.

use crate::downlink::Dispatch;
use crate::driver::{StopOutcome, Worker};
use crate::types::{CommandFrame, TelemetryRecord};
use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queue depth between recorders and the writer task.
pub const QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Pilot,
    Sensors,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogStream::Pilot => "pilot",
            LogStream::Sensors => "sensors",
        })
    }
}

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub t: f64,
    pub stream: LogStream,
    pub msg: Value,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    dropped: AtomicU64,
}

/// Cheap cloneable handle for producers.
#[derive(Debug, Clone)]
pub struct Recorder {
    tx: mpsc::Sender<LogRecord>,
    counters: Arc<Counters>,
}

impl Recorder {
    /// Queue one message. Returns false if it was dropped.
    pub fn record(&self, stream: LogStream, msg: Value) -> bool {
        let record = LogRecord { t: crate::epoch_seconds(), stream, msg };
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Queue a sent command frame on the pilot stream.
    pub fn record_frame(&self, frame: &CommandFrame) -> bool {
        match serde_json::to_value(frame) {
            Ok(msg) => self.record(LogStream::Pilot, msg),
            Err(e) => {
                debug!(error = %e, "Command frame not recordable");
                false
            }
        }
    }
}

/// Telemetry goes to the log as received, on the sensors stream.
impl Dispatch for Recorder {
    fn dispatch(&mut self, record: &TelemetryRecord) -> bool {
        self.record(LogStream::Sensors, record.payload.clone())
    }
}

/// Open log file plus its writer task.
pub struct EventLog {
    path: PathBuf,
    recorder: Recorder,
    worker: Worker,
}

impl EventLog {
    /// Create `<base>/<YYYYmmdd-HHMMSS>` for one console session.
    pub async fn session_dir(base: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = base.as_ref().join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(|e| LinkError::io(&dir, e))?;
        Ok(dir)
    }

    /// Open `path` for appending and start the writer.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| LinkError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| LinkError::io(&path, e))?;
        info!(path = %path.display(), "Recording event log");

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer_path = path.clone();
        let worker = Worker::spawn("event-log", move |cancel| write_records(BufWriter::new(file), rx, writer_path, cancel));
        Ok(Self { path, recorder: Recorder { tx, counters: Arc::default() }, worker })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Producer handle; recording keeps working across clones until `stop`.
    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    pub fn record(&self, stream: LogStream, msg: Value) -> bool {
        self.recorder.record(stream, msg)
    }

    pub fn dropped(&self) -> u64 {
        self.recorder.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> u64 {
        self.recorder.counters.queued.load(Ordering::Relaxed)
    }

    /// Write out everything queued so far, flush and close the file.
    pub async fn stop(&mut self) -> StopOutcome {
        self.worker.stop(Duration::from_secs(2)).await
    }

    /// Read a log back. Blank lines are skipped; a damaged line is an error.
    pub async fn replay(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| LinkError::io(path, e))?;
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line)
                    .map_err(|e| LinkError::malformed(format!("{}:{}", path.display(), index + 1), e.to_string()))
            })
            .collect()
    }
}

async fn write_records<W>(
    mut out: BufWriter<W>,
    mut rx: mpsc::Receiver<LogRecord>,
    path: PathBuf,
    cancel: CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let mut written = 0u64;
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = rx.recv() => record,
        };
        let Some(record) = record else { break };
        write_line(&mut out, &record, &mut written).await;

        while let Ok(record) = rx.try_recv() {
            write_line(&mut out, &record, &mut written).await;
        }
        if let Err(e) = out.flush().await {
            warn!(path = %path.display(), error = %e, "Event log flush failed");
        }
    }

    rx.close();
    while let Ok(record) = rx.try_recv() {
        write_line(&mut out, &record, &mut written).await;
    }
    if let Err(e) = out.flush().await {
        warn!(path = %path.display(), error = %e, "Event log flush failed");
    }
    debug!(path = %path.display(), written, "Event log closed");
}

async fn write_line<W>(out: &mut BufWriter<W>, record: &LogRecord, written: &mut u64)
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let mut line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(e) => {
            debug!(error = %e, "Skipping unserializable record");
            return;
        }
    };
    line.push('\n');
    // A write error drops the record; the console keeps running.
    match out.write_all(line.as_bytes()).await {
        Ok(()) => *written += 1,
        Err(e) => warn!(error = %e, "Event log write failed"),
    }
}
