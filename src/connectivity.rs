//! ==============================================================================
//! connectivity.rs - wifi association lifecycle
//! ==============================================================================
//!
//! purpose:
//!     owns the radio association. exposes a bounded-time connect, a debounced
//!     reconnect (maintain) and a live connectivity predicate.
//!
//! design:
//!     - the radio itself sits behind the `Radio` capability trait: a
//!       simulated radio for development/tests, and an nmcli radio for a
//!       real linux host.
//!     - connect() suspends (tokio sleep) instead of blocking the thread, so
//!       the stream listener and status server keep running on the same
//!       current-thread runtime while an attempt is in flight.
//!     - a failed connect is never an error. it leaves the link down and the
//!       orchestrator skips network work for that tick.
//!
//! relationships:
//!     - used by: agent.rs (maintain + is_connected every tick)
//!     - uses: nmcli / /sys/class/net (NmcliRadio only)
//!
//! ==============================================================================

use crate::config::NetworkConfig;
use crate::domain::ConnectivityState;
use crate::error::{AgentError, Result};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub trait Radio: Send {
    /// start associating with the given network; must not wait for the link
    fn begin(&mut self, ssid: &str, password: &str) -> Result<()>;
    /// live link state, queried every time (the link can drop on its own)
    fn is_associated(&self) -> bool;
}

// ==============================================================================================
// SIMULATED RADIO (development machine / tests)
// ==============================================================================================

/// scriptable radio; clones share state so a test can keep a handle
#[derive(Clone)]
pub struct SimulatedRadio {
    inner: Arc<Mutex<SimState>>,
}

struct SimState {
    reachable: bool,
    join_delay: Duration,
    joining_since: Option<Instant>,
    associated: bool,
    begin_calls: u32,
}

impl SimulatedRadio {
    /// `join_delay` is how long after begin() the link comes up, if reachable
    pub fn new(reachable: bool, join_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                reachable,
                join_delay,
                joining_since: None,
                associated: false,
                begin_calls: 0,
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_reachable(&self, reachable: bool) {
        let mut s = self.state();
        s.reachable = reachable;
        if !reachable {
            s.associated = false;
        }
    }

    /// link drops underneath us, like an access point going away
    pub fn drop_link(&self) {
        let mut s = self.state();
        s.associated = false;
        s.joining_since = None;
    }

    pub fn begin_calls(&self) -> u32 {
        self.state().begin_calls
    }
}

impl Radio for SimulatedRadio {
    fn begin(&mut self, ssid: &str, _password: &str) -> Result<()> {
        let mut s = self.state();
        debug!(ssid, "[SIM RADIO] begin");
        s.begin_calls += 1;
        s.associated = false;
        s.joining_since = Some(Instant::now());
        Ok(())
    }

    fn is_associated(&self) -> bool {
        let mut s = self.state();
        if s.associated {
            return true;
        }
        let joined = s.reachable
            && s.joining_since
                .map(|t| t.elapsed() >= s.join_delay)
                .unwrap_or(false);
        if joined {
            s.associated = true;
        }
        joined
    }
}

// ==============================================================================================
// NMCLI RADIO (linux host with NetworkManager)
// ==============================================================================================

/// asks NetworkManager to join, reads the link from sysfs
///
/// the agent keeps its own connection profile per ssid with the psk marked
/// not-saved. the key is handed to `nmcli connection up` through a 0600
/// passwd-file, so it never shows up in argv or in the stored profile. an
/// empty password means an open network and no security settings at all.
pub struct NmcliRadio {
    interface: String,
    sysfs_root: PathBuf,
    secrets_dir: PathBuf,
    pending: Option<Child>,
    secret_file: Option<PathBuf>,
}

impl NmcliRadio {
    pub fn new(interface: impl Into<String>) -> Self {
        Self::with_sysfs_root(interface, "/sys/class/net")
    }

    pub fn with_sysfs_root(interface: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            interface: interface.into(),
            sysfs_root: root.into(),
            secrets_dir: std::env::temp_dir(),
            pending: None,
            secret_file: None,
        }
    }

    /// where the short-lived passwd-file is written
    pub fn with_secrets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secrets_dir = dir.into();
        self
    }

    pub fn profile_name(ssid: &str) -> String {
        format!("energy-agent-{}", ssid)
    }

    /// `nmcli connection add` arguments for a fresh profile
    pub fn add_profile_args(&self, ssid: &str, secured: bool) -> Vec<String> {
        let mut args = vec![
            "connection".to_string(),
            "add".to_string(),
            "type".to_string(),
            "wifi".to_string(),
            "con-name".to_string(),
            Self::profile_name(ssid),
            "ifname".to_string(),
            self.interface.clone(),
            "ssid".to_string(),
            ssid.to_string(),
        ];
        if secured {
            // psk-flags 2: never store the key in the profile
            for arg in ["wifi-sec.key-mgmt", "wpa-psk", "wifi-sec.psk-flags", "2"] {
                args.push(arg.to_string());
            }
        }
        args
    }

    /// `nmcli connection up` arguments; the key only travels via `secret_file`
    pub fn up_args(&self, ssid: &str, secret_file: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "connection".to_string(),
            "up".to_string(),
            "id".to_string(),
            Self::profile_name(ssid),
            "ifname".to_string(),
            self.interface.clone(),
        ];
        if let Some(file) = secret_file {
            args.push("passwd-file".to_string());
            args.push(file.display().to_string());
        }
        args
    }

    /// write the psk for `connection up`, readable by the owner only
    pub fn write_secret_file(&self, ssid: &str, password: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.secrets_dir)?;
        let path = self.secrets_dir.join(format!("{}.psk", Self::profile_name(ssid)));
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&path)?;
        writeln!(file, "802-11-wireless-security.psk:{}", password)?;
        Ok(path)
    }

    fn ensure_profile(&self, ssid: &str, secured: bool) -> Result<()> {
        let name = Self::profile_name(ssid);
        let listing = Command::new("nmcli")
            .args(["-t", "-f", "NAME", "connection", "show"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| AgentError::Transport(format!("failed to run nmcli: {}", e)))?;
        let exists = String::from_utf8_lossy(&listing.stdout)
            .lines()
            .any(|line| line == name);
        if exists {
            return Ok(());
        }

        let status = Command::new("nmcli")
            .args(self.add_profile_args(ssid, secured))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| AgentError::Transport(format!("failed to run nmcli: {}", e)))?;
        if !status.success() {
            return Err(AgentError::Transport(format!("nmcli could not add profile {}: {}", name, status)));
        }
        info!(profile = %name, "[WiFi] connection profile created");
        Ok(())
    }

    fn remove_secret_file(&mut self) {
        if let Some(path) = self.secret_file.take() {
            if let Err(e) = fs::remove_file(&path) {
                debug!(error = %e, "could not remove passwd-file");
            }
        }
    }

    fn reap_pending(&mut self) {
        if let Some(child) = self.pending.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "nmcli finished");
                }
                Ok(None) => {
                    // still running from the previous attempt; let it go
                    let _ = child.kill();
                    let _ = child.wait();
                }
                Err(e) => {
                    warn!(error = %e, "could not poll nmcli");
                }
            }
            self.pending = None;
        }
        self.remove_secret_file();
    }
}

impl Radio for NmcliRadio {
    fn begin(&mut self, ssid: &str, password: &str) -> Result<()> {
        self.reap_pending();
        let secured = !password.is_empty();
        self.ensure_profile(ssid, secured)?;

        let secret_file = if secured {
            Some(self.write_secret_file(ssid, password)?)
        } else {
            None
        };
        let spawned = Command::new("nmcli")
            .args(self.up_args(ssid, secret_file.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        self.secret_file = secret_file;
        let child = spawned.map_err(|e| {
            self.remove_secret_file();
            AgentError::Transport(format!("failed to run nmcli: {}", e))
        })?;
        self.pending = Some(child);
        Ok(())
    }

    fn is_associated(&self) -> bool {
        let path = self.sysfs_root.join(&self.interface).join("operstate");
        fs::read_to_string(path)
            .map(|s| s.trim() == "up")
            .unwrap_or(false)
    }
}

impl Drop for NmcliRadio {
    fn drop(&mut self) {
        self.reap_pending();
    }
}

// ==============================================================================
// connectivity manager
// ==============================================================================

pub struct ConnectivityManager<R> {
    radio: R,
    ssid: String,
    password: String,
    connect_timeout: Duration,
    poll_interval: Duration,
    retry_interval: Duration,
    last_attempt: Option<Instant>,
    connecting: bool,
    attempts: u64,
}

impl<R: Radio> ConnectivityManager<R> {
    pub fn new(radio: R, cfg: &NetworkConfig) -> Self {
        Self {
            radio,
            ssid: cfg.ssid.clone(),
            password: cfg.password.clone(),
            connect_timeout: cfg.connect_timeout(),
            poll_interval: cfg.poll_interval(),
            retry_interval: cfg.retry_interval(),
            last_attempt: None,
            connecting: false,
            attempts: 0,
        }
    }

    /// one association attempt, bounded by the connect timeout
    ///
    /// returns within `connect_timeout + poll_interval`. the result is also
    /// visible through `is_connected()`.
    pub async fn connect(&mut self) -> bool {
        info!(ssid = %self.ssid, "[WiFi] connecting");
        self.connecting = true;
        self.attempts += 1;
        let started = Instant::now();
        self.last_attempt = Some(started);

        if let Err(e) = self.radio.begin(&self.ssid, &self.password) {
            warn!(error = %e, "[WiFi] could not start association");
        }

        while !self.radio.is_associated() && started.elapsed() < self.connect_timeout {
            tokio::time::sleep(self.poll_interval).await;
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "[WiFi] waiting");
        }
        self.connecting = false;

        let connected = self.radio.is_associated();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if connected {
            info!(ssid = %self.ssid, elapsed_ms, "[WiFi] connected");
        } else {
            warn!(ssid = %self.ssid, elapsed_ms, "[WiFi] connection failed");
        }
        connected
    }

    /// true when the link is down and the retry interval has passed
    pub fn reconnect_due(&self) -> bool {
        if self.radio.is_associated() {
            return false;
        }
        self.last_attempt
            .map(|t| t.elapsed() >= self.retry_interval)
            .unwrap_or(true)
    }

    /// debounced reconnect; call every tick
    ///
    /// returns whether an attempt was made. an attempt can suspend for up
    /// to the connect timeout.
    pub async fn maintain(&mut self) -> bool {
        if !self.reconnect_due() {
            return false;
        }
        info!("[WiFi] reconnecting");
        self.connect().await;
        true
    }

    pub fn is_connected(&self) -> bool {
        self.radio.is_associated()
    }

    pub fn state(&self) -> ConnectivityState {
        if self.connecting {
            ConnectivityState::Connecting
        } else if self.radio.is_associated() {
            ConnectivityState::Connected
        } else {
            ConnectivityState::Disconnected
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }
}
