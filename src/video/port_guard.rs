//! Finds and evicts leftover receivers squatting on a UDP port.
//!
//! A receiver that outlived a crashed console keeps its port bound and the
//! new receiver then sees no packets. On Linux the owner is found through
//! `/proc/net/udp{,6}` and `/proc/<pid>/fd`; only processes whose name is on
//! the allow list are ever signalled. Other platforms find nothing.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CLEAR_POLL: Duration = Duration::from_millis(50);

/// A process holding the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Squatter {
    pub pid: u32,
    pub name: String,
}

/// Socket inodes bound to local `port` in one `/proc/net/udp` style table.
pub fn parse_udp_table(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let bound = u16::from_str_radix(port_hex, 16).ok()?;
            if bound != port {
                return None;
            }
            fields.get(9)?.parse::<u64>().ok().filter(|inode| *inode != 0)
        })
        .collect()
}

fn socket_inode(link: &Path) -> Option<u64> {
    let target = fs::read_link(link).ok()?;
    let text = target.to_str()?;
    text.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct PortGuard {
    proc_root: PathBuf,
    allow_list: Vec<String>,
}

impl PortGuard {
    pub fn new(allow_list: Vec<String>) -> Self {
        Self::with_proc_root("/proc", allow_list)
    }

    /// Read process information from another root, such as a fixture tree.
    pub fn with_proc_root(root: impl Into<PathBuf>, allow_list: Vec<String>) -> Self {
        Self { proc_root: root.into(), allow_list }
    }

    /// Every process with a socket bound to `port`.
    pub fn squatters(&self, port: u16) -> Vec<Squatter> {
        let mut inodes = HashSet::new();
        for table in ["net/udp", "net/udp6"] {
            if let Ok(text) = fs::read_to_string(self.proc_root.join(table)) {
                inodes.extend(parse_udp_table(&text, port));
            }
        }
        if inodes.is_empty() {
            return Vec::new();
        }

        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes can exit or deny access mid-scan.
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let holds_port = fds.flatten().any(|fd| socket_inode(&fd.path()).is_some_and(|i| inodes.contains(&i)));
            if holds_port {
                let name = fs::read_to_string(entry.path().join("comm"))
                    .map(|comm| comm.trim().to_string())
                    .unwrap_or_default();
                found.push(Squatter { pid, name });
            }
        }
        found.sort_by_key(|s| s.pid);
        found
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allow_list.iter().any(|allowed| allowed == name)
    }

    /// Terminate allow-listed squatters on `port`. Returns the signalled pids.
    pub fn evict(&self, port: u16) -> Vec<u32> {
        let own_pid = std::process::id();
        let mut signalled = Vec::new();
        for squatter in self.squatters(port) {
            if squatter.pid == own_pid {
                continue;
            }
            if !self.is_allowed(&squatter.name) {
                warn!(port, pid = squatter.pid, name = %squatter.name, "Port held by unrelated process, leaving it");
                continue;
            }
            if terminate(squatter.pid) {
                info!(port, pid = squatter.pid, name = %squatter.name, "Terminated leftover receiver");
                signalled.push(squatter.pid);
            } else {
                debug!(port, pid = squatter.pid, "Could not signal leftover receiver");
            }
        }
        signalled
    }

    /// Evict squatters on `port` and wait until the signalled ones are gone.
    ///
    /// Processes still holding the port after `grace` are killed, and given
    /// another `grace` to disappear. Returns the pids that never let go.
    pub async fn clear(&self, port: u16, grace: Duration) -> Vec<u32> {
        let signalled = self.blocking(move |guard| guard.evict(port)).await;
        if signalled.is_empty() {
            return signalled;
        }

        let mut deadline = Instant::now() + grace;
        let mut killed = false;
        loop {
            let holding: Vec<u32> = self
                .blocking(move |guard| guard.squatters(port))
                .await
                .into_iter()
                .map(|squatter| squatter.pid)
                .filter(|pid| signalled.contains(pid) && process_exists(*pid))
                .collect();
            if holding.is_empty() {
                debug!(port, "Port released");
                return holding;
            }
            if Instant::now() >= deadline {
                if killed {
                    warn!(port, pids = ?holding, "Leftover receiver survived SIGKILL");
                    return holding;
                }
                for pid in &holding {
                    warn!(port, pid, "Leftover receiver ignored SIGTERM, killing");
                    force_kill(*pid);
                }
                killed = true;
                deadline = Instant::now() + grace;
            }
            tokio::time::sleep(CLEAR_POLL).await;
        }
    }

    async fn blocking<T>(&self, scan: impl FnOnce(&PortGuard) -> Vec<T> + Send + 'static) -> Vec<T>
    where
        T: Send + 'static,
    {
        let guard = self.clone();
        tokio::task::spawn_blocking(move || scan(&guard)).await.unwrap_or_default()
    }
}

#[cfg(unix)]
fn signal(pid: u32, signo: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid, signo) == 0 }
}

#[cfg(unix)]
pub(crate) fn terminate(pid: u32) -> bool {
    signal(pid, libc::SIGTERM)
}

#[cfg(unix)]
fn force_kill(pid: u32) -> bool {
    signal(pid, libc::SIGKILL)
}

/// A pid can exit between a `/proc` scan and the next check.
#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    signal(pid, 0)
}

#[cfg(not(unix))]
pub(crate) fn terminate(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn force_kill(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}
