//! Resilient topside link for a remotely operated underwater vehicle.
//!
//! rovlink keeps an operator console talking to a vehicle over a tether or
//! radio path that can drop, stall or power-cycle at any time. Every
//! subsystem detects staleness on its own, reconnects quickly and never
//! blocks the operator.
//!
//! # Features
//!
//! - **Command uplink**: fixed-rate command frames from operator input, with
//!   device hot-plug and drop-instead-of-block publishing
//! - **Telemetry downlink**: freshest vehicle state, stale-link recreation
//! - **Video sessions**: RPC stream control, a GStreamer receiver per stream,
//!   stall detection and warm-keeping
//! - **Link health**: period-relative status with hysteresis
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rovlink::config::LinkConfig;
//! use rovlink::downlink::TelemetryDownlink;
//! use rovlink::status::LinkMonitor;
//! use rovlink::transport::ZmqConnector;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> rovlink::Result<()> {
//!     let config = LinkConfig::from_env()?;
//!     let mut downlink = TelemetryDownlink::spawn(&config, Arc::new(ZmqConnector::new()), ());
//!     let mut monitor = LinkMonitor::default();
//!
//!     for _ in 0..10 {
//!         tokio::time::sleep(Duration::from_millis(500)).await;
//!         println!("{}", monitor.link_line(&downlink.latest(), tokio::time::Instant::now()));
//!     }
//!     downlink.stop().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Runtime plumbing
pub mod backoff;
pub mod config;
pub mod driver;
pub mod stream;
pub mod transport;

// Link subsystems
pub mod downlink;
pub mod health;
pub mod uplink;
pub mod video;

// Console support
pub mod diag;
pub mod recorder;
pub mod status;

// Core exports
pub use error::*;
pub use types::*;

/// Wall-clock time as fractional Unix seconds, the timestamp used on the wire.
pub(crate) fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}
