//! Video session control and the raw-frame receiver pipeline.
//!
//! The vehicle runs a request/reply control service that starts and stops
//! named camera streams sending RTP to the console. For each stream the
//! console runs a local `gst-launch-1.0` pipeline that decodes the RTP into
//! fixed-size BGR frames on its stdout.
//!
//! - [`VideoControl`]: RPC client; every failure resets its socket
//! - [`GstLauncher`]: starts receivers after evicting leftover ones from the port
//! - [`VideoSession`]: per-stream connect, stall detection and retry
//! - [`StreamManager`]: the displayed stream and optional warm-keeping
//! - [`FrameReader`]: latest frame with a per-caller freshness check
//!
//! ```rust,no_run
//! use rovlink::config::LinkConfig;
//! use rovlink::transport::ZmqConnector;
//! use rovlink::video::{GstLauncher, StreamCatalog, StreamManager, VideoBackend};
//! use std::sync::Arc;
//!
//! # async fn run() -> rovlink::Result<()> {
//! let config = LinkConfig::from_env()?;
//! let catalog = StreamCatalog::load("streams.yaml")?;
//! let backend = VideoBackend {
//!     connector: Arc::new(ZmqConnector::new()),
//!     launcher: Arc::new(GstLauncher::from_config(&config.video)?),
//!     receive_host: "192.168.1.10".to_string(),
//! };
//! let mut manager = StreamManager::new(&catalog, config, backend);
//! manager.start();
//! if let Some(session) = manager.active() {
//!     let mut frames = session.frame_reader();
//!     if let Some(frame) = frames.read_frame() {
//!         println!("{}x{} frame", frame.geometry.width, frame.geometry.height);
//!     }
//! }
//! manager.stop_all().await;
//! # Ok(())
//! # }
//! ```

mod catalog;
mod frame;
mod manager;
pub mod port_guard;
mod receiver;
mod rpc;
mod session;

pub use catalog::{StreamCatalog, StreamSpec};
pub use frame::{ChannelOrder, FrameGeometry, FrameId, FrameReader, FrameSink, VideoFrame};
pub use manager::StreamManager;
pub use port_guard::PortGuard;
pub use receiver::{GstLauncher, ReceiverLauncher, ReceiverSpec, RunningReceiver, find_gst_launch};
pub use rpc::{CapsFlags, DeviceInfo, DeviceMode, FrameSize, RpcReply, StartReply, StreamRequest, VideoControl, VideoFormat};
pub use session::{SessionState, SessionStatus, VideoBackend, VideoSession};
