//! Display stack supervision.
//!
//! Each session's display is realized by three OS processes started in
//! dependency order: Xvfb (virtual framebuffer) -> window manager -> x11vnc
//! (remote framebuffer server). Readiness is awaited between steps with
//! bounded polling, never fixed sleeps. Teardown runs in reverse order and
//! escalates from SIGTERM to SIGKILL after a grace period.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::{Child, Command};

use crate::config::DisplayStackConfig;
use crate::error::{SessionError, SessionResult};

/// Poll interval for readiness and exit checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of a process-group healthcheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Alive,
    Dead,
}

/// Probes that decide when a display stack component is ready.
///
/// Split out as a trait so tests can substitute a no-op probe while the
/// production probe shells out to xdpyinfo and polls the VNC port.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn wait_for_display(&self, display: u32, timeout: Duration) -> SessionResult<()>;
    async fn wait_for_port(&self, host: &str, port: u16, timeout: Duration) -> SessionResult<()>;
}

/// Production probe: `xdpyinfo -display :N` for the X server, a TCP
/// connect for the VNC port.
pub struct XdpyinfoProbe {
    xdpyinfo_binary: String,
}

impl XdpyinfoProbe {
    pub fn new(xdpyinfo_binary: impl Into<String>) -> Self {
        Self {
            xdpyinfo_binary: xdpyinfo_binary.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for XdpyinfoProbe {
    async fn wait_for_display(&self, display: u32, timeout: Duration) -> SessionResult<()> {
        let start = tokio::time::Instant::now();
        loop {
            let ready = Command::new(&self.xdpyinfo_binary)
                .args(["-display", &format!(":{}", display)])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|status| status.success())
                .unwrap_or(false);
            if ready {
                debug!("display :{} is ready", display);
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SessionError::Spawn(format!(
                    "display :{} not ready after {:?}",
                    display, timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_port(&self, host: &str, port: u16, timeout: Duration) -> SessionResult<()> {
        let start = tokio::time::Instant::now();
        loop {
            if tokio::net::TcpStream::connect((host, port)).await.is_ok() {
                debug!("port {} is accepting connections", port);
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SessionError::Spawn(format!(
                    "port {} not listening after {:?}",
                    port, timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Handle to one supervised process.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub service: &'static str,
    child: Child,
}

impl ProcessHandle {
    fn new(child: Child, service: &'static str) -> SessionResult<Self> {
        let pid = child
            .id()
            .ok_or_else(|| SessionError::Spawn(format!("no PID for {}", service)))?;
        Ok(Self {
            pid,
            service,
            child,
        })
    }

    /// Whether the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate gracefully, escalating to SIGKILL after `grace`.
    ///
    /// Tolerates processes that have already exited.
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
        debug!("sent SIGTERM to {} (pid {})", self.service, self.pid);

        let start = tokio::time::Instant::now();
        while start.elapsed() < grace {
            if !self.is_running() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        warn!(
            "{} (pid {}) survived grace period, force killing",
            self.service, self.pid
        );
        if let Err(err) = self.child.kill().await {
            warn!("failed to kill {} (pid {}): {}", self.service, self.pid, err);
        }
        // Reap to avoid zombies; bounded so a stuck wait cannot hang teardown.
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!("error waiting for {} (pid {}): {}", self.service, self.pid, err),
            Err(_) => warn!("timeout reaping {} (pid {})", self.service, self.pid),
        }
    }
}

/// The live processes realizing one session's display.
#[derive(Debug)]
pub struct ProcessGroup {
    pub session_id: String,
    pub display: u32,
    pub vnc_port: u16,
    /// Handles in startup order: framebuffer, window manager, VNC server.
    handles: Vec<ProcessHandle>,
}

impl ProcessGroup {
    pub fn pids(&self) -> Vec<u32> {
        self.handles.iter().map(|h| h.pid).collect()
    }
}

/// Starts, stops, and monitors display process groups.
pub struct DisplaySupervisor {
    config: DisplayStackConfig,
    probe: Arc<dyn ReadinessProbe>,
}

impl DisplaySupervisor {
    pub fn new(config: DisplayStackConfig) -> Self {
        let probe = Arc::new(XdpyinfoProbe::new(config.xdpyinfo_binary.clone()));
        Self { config, probe }
    }

    /// Replace the readiness probe (tests).
    pub fn with_probe(config: DisplayStackConfig, probe: Arc<dyn ReadinessProbe>) -> Self {
        Self { config, probe }
    }

    fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.config.ready_timeout_ms)
    }

    fn grace_period(&self) -> Duration {
        Duration::from_millis(self.config.grace_period_ms)
    }

    fn xvfb_args(&self, display: u32) -> Vec<String> {
        vec![
            format!(":{}", display),
            "-screen".to_string(),
            "0".to_string(),
            format!(
                "{}x{}x24",
                self.config.screen_width, self.config.screen_height
            ),
            "-ac".to_string(),
            // The display must not be reachable over the network; only the
            // local VNC server may attach.
            "-nolisten".to_string(),
            "tcp".to_string(),
        ]
    }

    fn vnc_args(&self, display: u32, vnc_port: u16) -> Vec<String> {
        vec![
            "-display".to_string(),
            format!(":{}", display),
            "-rfbport".to_string(),
            vnc_port.to_string(),
            "-localhost".to_string(),
            "-forever".to_string(),
            "-shared".to_string(),
            "-nopw".to_string(),
            "-xkb".to_string(),
            "-noxrecord".to_string(),
            "-noxdamage".to_string(),
        ]
    }

    fn spawn(
        &self,
        binary: &str,
        args: &[String],
        env: &[(String, String)],
        service: &'static str,
    ) -> SessionResult<ProcessHandle> {
        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|err| SessionError::Spawn(format!("spawning {} ({}): {}", service, binary, err)))?;
        let handle = ProcessHandle::new(child, service)?;
        debug!("{} spawned with pid {}", service, handle.pid);
        Ok(handle)
    }

    /// Start the full display stack for a session.
    ///
    /// If any step fails, processes already started are torn down before
    /// the error is returned; a partial group is never left running.
    pub async fn start(
        &self,
        session_id: &str,
        display: u32,
        vnc_port: u16,
        fs_env: &[(String, String)],
    ) -> SessionResult<ProcessGroup> {
        info!(
            "starting display stack for session {} on :{} (vnc port {})",
            session_id, display, vnc_port
        );

        let mut group = ProcessGroup {
            session_id: session_id.to_string(),
            display,
            vnc_port,
            handles: Vec::with_capacity(3),
        };

        let result = self.start_inner(&mut group, display, vnc_port, fs_env).await;
        if let Err(err) = result {
            warn!(
                "display stack for session {} failed ({}), tearing down partial group",
                session_id, err
            );
            self.stop(&mut group).await;
            return Err(err);
        }

        info!(
            "display stack for session {} running (pids {:?})",
            session_id,
            group.pids()
        );
        Ok(group)
    }

    async fn start_inner(
        &self,
        group: &mut ProcessGroup,
        display: u32,
        vnc_port: u16,
        fs_env: &[(String, String)],
    ) -> SessionResult<()> {
        let xvfb = self.spawn(
            &self.config.xvfb_binary,
            &self.xvfb_args(display),
            &[],
            "xvfb",
        )?;
        group.handles.push(xvfb);
        self.probe
            .wait_for_display(display, self.ready_timeout())
            .await?;

        let mut wm_env = fs_env.to_vec();
        wm_env.push(("DISPLAY".to_string(), format!(":{}", display)));
        let wm = self.spawn(&self.config.wm_binary, &[], &wm_env, "wm")?;
        group.handles.push(wm);

        let vnc = self.spawn(
            &self.config.vnc_binary,
            &self.vnc_args(display, vnc_port),
            &[],
            "vnc",
        )?;
        group.handles.push(vnc);
        self.probe
            .wait_for_port("127.0.0.1", vnc_port, self.ready_timeout())
            .await?;

        Ok(())
    }

    /// Stop every process in the group, VNC server first, framebuffer last.
    ///
    /// Idempotent: already-exited processes and repeated calls are fine.
    pub async fn stop(&self, group: &mut ProcessGroup) {
        for handle in group.handles.iter_mut().rev() {
            handle.terminate(self.grace_period()).await;
        }
        group.handles.clear();
        cleanup_display_locks(group.display);
        debug!("display stack for session {} stopped", group.session_id);
    }

    /// Check whether every process in the group is still alive.
    ///
    /// A single dead member (a crashed window manager leaves a black
    /// screen) marks the whole group Dead.
    pub fn healthcheck(&self, group: &mut ProcessGroup) -> Health {
        if group.handles.is_empty() {
            return Health::Dead;
        }
        for handle in group.handles.iter_mut() {
            if !handle.is_running() {
                warn!(
                    "session {} process {} (pid {}) has exited",
                    group.session_id, handle.service, handle.pid
                );
                return Health::Dead;
            }
        }
        Health::Alive
    }
}

impl std::fmt::Debug for DisplaySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplaySupervisor")
            .field("config", &self.config)
            .finish()
    }
}

/// Remove stale X11 lock files so a display id can be reused.
pub fn cleanup_display_locks(display: u32) {
    for lock in [
        format!("/tmp/.X{}-lock", display),
        format!("/tmp/.X11-unix/X{}", display),
    ] {
        let path = Path::new(&lock);
        if path.exists() {
            if let Err(err) = std::fs::remove_file(path) {
                warn!("could not remove lock file {}: {}", lock, err);
            } else {
                debug!("removed lock file {}", lock);
            }
        }
    }
}

/// Find the process listening on a port (Linux, via ss).
#[cfg(target_os = "linux")]
pub fn find_process_on_port(port: u16) -> Option<(u32, String)> {
    let output = std::process::Command::new("ss")
        .args(["-tlnp", &format!("sport = :{}", port)])
        .output()
        .ok()?;

    parse_ss_process(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(target_os = "linux"))]
pub fn find_process_on_port(_port: u16) -> Option<(u32, String)> {
    None
}

/// Extract the first (pid, name) from `ss -tlnp` output. Lines without a
/// process section (other sockets, truncated output) are skipped, not
/// treated as the end of the scan.
fn parse_ss_process(stdout: &str) -> Option<(u32, String)> {
    // LISTEN 0 5 127.0.0.1:5901 0.0.0.0:* users:(("x11vnc",pid=123,fd=4))
    for line in stdout.lines().skip(1) {
        let Some(users) = line.split("users:((").nth(1) else {
            continue;
        };
        let Some(pid) = users
            .split("pid=")
            .nth(1)
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let name = users.split('"').nth(1).unwrap_or("unknown").to_string();
        return Some((pid, name));
    }
    None
}

/// Kill orphan processes squatting on the given ports. Used by the startup
/// reconciliation sweep to reclaim VNC ports from a crashed predecessor.
///
/// Returns the number of processes cleared.
pub fn clear_ports(ports: &[u16]) -> usize {
    let mut cleared = 0;
    for &port in ports {
        let Some((pid, name)) = find_process_on_port(port) else {
            continue;
        };
        info!(
            "orphan process '{}' (pid {}) on port {}, killing",
            name, pid, port
        );

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        std::thread::sleep(Duration::from_millis(500));

        if find_process_on_port(port).is_some() {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            std::thread::sleep(Duration::from_millis(200));
        }

        if find_process_on_port(port).is_none() {
            cleared += 1;
        } else {
            warn!("failed to clear port {}", port);
        }
    }
    cleared
}
