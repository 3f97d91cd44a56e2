//! Error types for the vehicle link.
//!
//! Every background loop in this crate is self-healing: the errors defined here
//! are mostly consumed internally and turned into status transitions. They only
//! reach callers from request-style operations (RPC calls, configuration
//! loading) and from contract violations such as using a component after it
//! was stopped.
//!
//! ## Error Categories
//!
//! - **DeviceUnavailable**: local input device missing, busy or detached
//! - **Timeout**: an RPC or transport operation exceeded its deadline
//! - **Transport**: socket-level failure; the socket is discarded and recreated
//! - **Remote**: the vehicle answered with a structured failure
//! - **StaleData**: internal reconnect trigger, never shown as an error
//! - **MalformedMessage**: a single message could not be decoded and was skipped
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use rovlink::LinkError;
//!
//! let error = LinkError::transport("connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for link operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Why a local input device could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    NotFound,
    PermissionDenied,
    DeviceBusy,
    /// The device was open but disappeared (unplugged, driver reset).
    Detached,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeviceErrorKind::NotFound => "not found",
            DeviceErrorKind::PermissionDenied => "permission denied",
            DeviceErrorKind::DeviceBusy => "device busy",
            DeviceErrorKind::Detached => "detached",
        };
        f.write_str(text)
    }
}

/// Main error type for link operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("Input device {kind}: {reason}")]
    DeviceUnavailable { kind: DeviceErrorKind, reason: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Vehicle reported an error: {message}")]
    Remote { message: String },

    #[error("No data received for {age:?}")]
    StaleData { age: Duration },

    #[error("Malformed message in {context}: {details}")]
    MalformedMessage { context: String, details: String },

    #[error("Receiver process error: {context}")]
    Process {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("I/O error: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{component} used after shutdown")]
    Shutdown { component: &'static str },
}

impl LinkError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::DeviceUnavailable { .. } => true,
            LinkError::Timeout { .. } => true,
            LinkError::Transport { .. } => true,
            LinkError::StaleData { .. } => true,
            LinkError::Process { .. } => true,
            LinkError::Remote { .. } => false,
            LinkError::MalformedMessage { .. } => false,
            LinkError::Config { .. } => false,
            LinkError::Io { .. } => false,
            LinkError::Shutdown { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            LinkError::DeviceUnavailable { .. } => vec![
                "Check that the controller is plugged in",
                "Verify the controller index in the configuration",
                "Close other applications holding the device",
            ],
            LinkError::Timeout { .. } => vec![
                "Check the tether connection",
                "Verify the vehicle services are running",
                "Increase the RPC timeout for slow links",
            ],
            LinkError::Transport { .. } => vec![
                "Check the vehicle host address and ports",
                "Verify the tether link is up",
                "Wait for the vehicle to finish booting",
            ],
            LinkError::Remote { .. } => vec![
                "Read the message reported by the vehicle",
                "Check the camera device path and format",
            ],
            LinkError::StaleData { .. } => vec![
                "Check that the vehicle is powered",
                "Inspect the tether for intermittent faults",
            ],
            LinkError::MalformedMessage { .. } => vec![
                "Check that vehicle and topside software versions match",
                "Inspect the raw payload with the event log",
            ],
            LinkError::Process { .. } => vec![
                "Install GStreamer and make gst-launch-1.0 available on PATH",
                "Set GST_LAUNCH to the full path of gst-launch-1.0",
                "Check that the video port is not in use",
            ],
            LinkError::Config { .. } => vec![
                "Check environment variable values",
                "Validate the stream definitions file",
            ],
            LinkError::Io { .. } => vec![
                "Check the file exists and is readable",
                "Check directory permissions",
                "Ensure sufficient disk space",
            ],
            LinkError::Shutdown { .. } => vec!["Create a new component instead of reusing a stopped one"],
        }
    }

    /// Helper constructor for device errors.
    pub fn device(kind: DeviceErrorKind, reason: impl Into<String>) -> Self {
        LinkError::DeviceUnavailable { kind, reason: reason.into() }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        LinkError::Timeout { operation: operation.into(), duration }
    }

    /// Helper constructor for transport errors.
    pub fn transport(reason: impl Into<String>) -> Self {
        LinkError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        LinkError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for errors reported by the vehicle.
    pub fn remote(message: impl Into<String>) -> Self {
        LinkError::Remote { message: message.into() }
    }

    /// Helper constructor for malformed payloads.
    pub fn malformed(context: impl Into<String>, details: impl Into<String>) -> Self {
        LinkError::MalformedMessage { context: context.into(), details: details.into() }
    }

    /// Helper constructor for receiver process failures.
    pub fn process(context: impl Into<String>, source: Option<std::io::Error>) -> Self {
        LinkError::Process { context: context.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        LinkError::Config { reason: reason.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LinkError::Io { path: path.into(), source }
    }

    /// True when the vehicle refused to start a stream because it is already running.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, LinkError::Remote { message } if message.to_lowercase().contains("already exists"))
    }

    /// True when the vehicle reports that a named stream does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            LinkError::Remote { message } => {
                let message = message.to_lowercase();
                message.contains("not found") || message.contains("no such")
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::MalformedMessage { context: "json".to_string(), details: err.to_string() }
    }
}

impl From<zeromq::ZmqError> for LinkError {
    fn from(err: zeromq::ZmqError) -> Self {
        LinkError::transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn messages_carry_their_context(
            reason in ".*",
            operation in "[a-z_]{1,16}",
            millis in 1u64..60_000u64,
        ) {
            let transport = LinkError::transport(reason.clone());
            prop_assert!(transport.to_string().contains(&reason));

            let remote = LinkError::remote(reason.clone());
            prop_assert!(remote.to_string().contains(&reason));

            let timeout = LinkError::timeout(operation.clone(), Duration::from_millis(millis));
            let text = timeout.to_string();
            prop_assert!(text.contains(&operation));
            prop_assert!(!text.is_empty());
        }

        #[test]
        fn already_exists_detection_ignores_case(prefix in "[a-z ]{0,10}", suffix in "[a-z ]{0,10}") {
            let err = LinkError::remote(format!("{prefix}Stream ALREADY Exists{suffix}"));
            prop_assert!(err.is_already_exists());
            prop_assert!(!LinkError::transport("already exists").is_already_exists());
        }
    }

    #[test]
    fn retry_classification_follows_taxonomy() {
        assert!(LinkError::device(DeviceErrorKind::NotFound, "no pad").is_retryable());
        assert!(LinkError::timeout("start_stream", Duration::from_secs(2)).is_retryable());
        assert!(LinkError::transport("refused").is_retryable());
        assert!(LinkError::StaleData { age: Duration::from_secs(4) }.is_retryable());
        assert!(!LinkError::remote("bad device").is_retryable());
        assert!(!LinkError::malformed("telemetry", "eof").is_retryable());
        assert!(!LinkError::Shutdown { component: "uplink" }.is_retryable());
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = [
            LinkError::device(DeviceErrorKind::Detached, "unplugged"),
            LinkError::timeout("ping", Duration::from_secs(1)),
            LinkError::transport("reset"),
            LinkError::remote("boom"),
            LinkError::StaleData { age: Duration::from_secs(5) },
            LinkError::malformed("rpc", "not json"),
            LinkError::process("spawn", None),
            LinkError::config("rate must be positive"),
            LinkError::io("/tmp/x", std::io::Error::other("disk")),
            LinkError::Shutdown { component: "downlink" },
        ];
        for error in &errors {
            assert!(!error.recovery_suggestions().is_empty(), "{error}");
        }
    }

    #[test]
    fn not_found_detection() {
        assert!(LinkError::remote("No such stream: cam2").is_not_found());
        assert!(LinkError::remote("stream not found").is_not_found());
        assert!(!LinkError::remote("device busy").is_not_found());
    }

    #[test]
    fn conversions_map_to_expected_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(LinkError::from(json_err), LinkError::MalformedMessage { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        match LinkError::from(io_err) {
            LinkError::Io { source, .. } => assert_eq!(source.to_string(), "missing"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<LinkError>();
    }
}
