//! Network diagnostics for the status bar.
//!
//! The local side is the route the OS picks toward the vehicle: on Linux
//! `ip route get` names the interface and `/sys/class/net/<iface>/wireless`
//! tells whether it is Wi-Fi; elsewhere a connected UDP socket reveals the
//! source address only. The remote side is the vehicle's own `net` telemetry,
//! used while it is fresh. Route probing spawns a process, so results are
//! cached for a couple of seconds.

use crate::downlink::TelemetrySnapshot;
use crate::driver::{StopOutcome, Worker};
use crate::types::NetStatus;
use crate::{LinkError, Result};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

const ROUTE_TIMEOUT: Duration = Duration::from_millis(750);

/// Console-side route toward the vehicle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalRoute {
    pub iface: Option<String>,
    pub src_ip: Option<String>,
    pub is_wifi: Option<bool>,
    pub error: Option<String>,
}

/// Pull `dev` and `src` out of `ip route get` output.
///
/// `192.168.1.4 dev eth0 src 192.168.1.2 uid 1000`
pub fn parse_ip_route(output: &str) -> LocalRoute {
    let words: Vec<&str> = output.split_whitespace().collect();
    let after = |key: &str| {
        words
            .iter()
            .position(|word| *word == key)
            .and_then(|i| words.get(i + 1))
            .map(|value| value.to_string())
    };
    LocalRoute { iface: after("dev"), src_ip: after("src"), ..LocalRoute::default() }
}

/// Bytes per second as a bit rate: `12.35Mb/s`.
pub fn format_bps(bytes_per_sec: Option<f64>) -> String {
    let Some(bits) = bytes_per_sec.map(|b| b * 8.0).filter(|b| b.is_finite() && *b >= 0.0) else {
        return "-".to_string();
    };
    if bits >= 1e9 {
        format!("{:.2}Gb/s", bits / 1e9)
    } else if bits >= 1e6 {
        format!("{:.2}Mb/s", bits / 1e6)
    } else if bits >= 1e3 {
        format!("{:.1}Kb/s", bits / 1e3)
    } else {
        format!("{bits:.0}b/s")
    }
}

/// Whether `iface` is a wireless interface according to sysfs.
pub fn is_wireless(sys_root: &Path, iface: &str) -> bool {
    let net = sys_root.join("class/net");
    if net.is_dir() {
        net.join(iface).join("wireless").is_dir()
    } else {
        iface.starts_with("wl")
    }
}

/// Source address the OS would use to reach `host`. Sends nothing.
pub async fn local_receive_host(host: &str) -> Result<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket
        .connect((host, 9))
        .await
        .map_err(|e| LinkError::transport_with_source(format!("no route to {host}"), Box::new(e)))?;
    Ok(socket.local_addr()?.ip())
}

async fn ip_route_get(host: &str) -> Result<String> {
    let output = Command::new("ip")
        .args(["route", "get", host])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(ROUTE_TIMEOUT, output)
        .await
        .map_err(|_| LinkError::timeout("ip route get", ROUTE_TIMEOUT))?
        .map_err(|e| LinkError::process("failed to run ip", Some(e)))?;
    if !output.status.success() {
        return Err(LinkError::process(format!("ip route get exited with {}", output.status), None));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Find the local route to `host`, falling back to the UDP connect trick.
pub async fn probe_route(host: &str, sys_root: &Path) -> LocalRoute {
    match ip_route_get(host).await {
        Ok(output) => {
            let mut route = parse_ip_route(&output);
            route.is_wifi = route.iface.as_deref().map(|iface| is_wireless(sys_root, iface));
            return route;
        }
        Err(e) => trace!(error = %e, "ip route unavailable, using socket route"),
    }
    match local_receive_host(host).await {
        Ok(ip) => LocalRoute { src_ip: Some(ip.to_string()), ..LocalRoute::default() },
        Err(e) => LocalRoute { error: Some(e.to_string()), ..LocalRoute::default() },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetWarning {
    /// The console reaches the vehicle over Wi-Fi.
    LocalWifi,
    /// The vehicle reports its active link is not the tether.
    RemoteNotTether,
}

impl fmt::Display for NetWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetWarning::LocalWifi => "LOCAL WIFI",
            NetWarning::RemoteNotTether => "ROV NOT TETHER",
        })
    }
}

/// Combined local and remote network picture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetReport {
    pub local: LocalRoute,
    pub remote: Option<NetStatus>,
    pub warnings: Vec<NetWarning>,
}

impl NetReport {
    pub fn new(local: LocalRoute, remote: Option<NetStatus>) -> Self {
        let mut warnings = Vec::new();
        if local.is_wifi == Some(true) {
            warnings.push(NetWarning::LocalWifi);
        }
        if remote.as_ref().is_some_and(|net| !net.is_tether) {
            warnings.push(NetWarning::RemoteNotTether);
        }
        Self { local, remote, warnings }
    }
}

impl fmt::Display for NetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = match (&self.local.iface, &self.local.src_ip) {
            (Some(iface), _) if self.local.is_wifi == Some(true) => format!("{iface}(wifi)"),
            (Some(iface), _) => iface.clone(),
            (None, Some(ip)) => ip.clone(),
            (None, None) => "-".to_string(),
        };
        write!(f, "Net: local={local} |")?;

        match &self.remote {
            Some(net) => {
                let dash = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
                let speed = match net.link.speed_mbps {
                    Some(mbps) if mbps > 0.0 => format!("{}Mbps", mbps as u64),
                    _ => "-".to_string(),
                };
                write!(f, " rov={} {} {} {speed}", dash(&net.iface), dash(&net.link.kind), dash(&net.link.state))?;
                if let Some(ip) = &net.ip {
                    write!(f, " ip={ip}")?;
                }
                write!(f, " | rx={} tx={}", format_bps(net.rx_bps), format_bps(net.tx_bps))?;
            }
            None => f.write_str(" rov=- - - -")?,
        }

        if !self.warnings.is_empty() {
            let warnings: Vec<String> = self.warnings.iter().map(ToString::to_string).collect();
            write!(f, " | ⚠ {}", warnings.join(", "))?;
        }
        Ok(())
    }
}

/// Caches the local route and merges it with fresh remote telemetry.
#[derive(Debug, Clone)]
pub struct NetworkProber {
    host: String,
    sys_root: PathBuf,
    route_refresh: Duration,
    remote_fresh: Duration,
    cached: Option<(Instant, LocalRoute)>,
}

impl NetworkProber {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            sys_root: PathBuf::from("/sys"),
            route_refresh: Duration::from_secs(2),
            remote_fresh: Duration::from_secs(3),
            cached: None,
        }
    }

    /// Read interface information from another sysfs root.
    pub fn with_sys_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sys_root = root.into();
        self
    }

    async fn route(&mut self, now: Instant) -> LocalRoute {
        if let Some((at, route)) = &self.cached {
            if now.saturating_duration_since(*at) <= self.route_refresh {
                return route.clone();
            }
        }
        let route = probe_route(&self.host, &self.sys_root).await;
        debug!(host = %self.host, iface = ?route.iface, src = ?route.src_ip, wifi = ?route.is_wifi, "Local route refreshed");
        self.cached = Some((now, route.clone()));
        route
    }

    /// Remote `net` telemetry if it arrived recently enough to trust.
    pub fn fresh_remote(&self, snapshot: &TelemetrySnapshot, now: Instant) -> Option<NetStatus> {
        let at = snapshot.last_network()?;
        if now.saturating_duration_since(at) >= self.remote_fresh {
            return None;
        }
        snapshot.network().cloned()
    }

    pub async fn report(&mut self, snapshot: &TelemetrySnapshot, now: Instant) -> NetReport {
        let remote = self.fresh_remote(snapshot, now);
        NetReport::new(self.route(now).await, remote)
    }

    /// Publish a report every `period` until stopped.
    pub fn spawn(mut self, snapshots: watch::Receiver<TelemetrySnapshot>, period: Duration) -> ProberHandle {
        let (tx, reports) = watch::channel(NetReport::default());
        let worker = Worker::spawn("net-prober", move |cancel| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let snapshot = snapshots.borrow().clone();
                let report = tokio::select! {
                    _ = cancel.cancelled() => break,
                    report = self.report(&snapshot, Instant::now()) => report,
                };
                tx.send_if_modified(|current| {
                    let changed = *current != report;
                    *current = report;
                    changed
                });
            }
        });
        ProberHandle { worker, reports }
    }
}

/// Running prober.
pub struct ProberHandle {
    worker: Worker,
    reports: watch::Receiver<NetReport>,
}

impl ProberHandle {
    pub fn latest(&self) -> NetReport {
        self.reports.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<NetReport> {
        self.reports.clone()
    }

    pub async fn stop(&mut self) -> StopOutcome {
        self.worker.stop(ROUTE_TIMEOUT * 2).await
    }
}
