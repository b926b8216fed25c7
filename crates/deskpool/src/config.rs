//! Configuration for the session pool manager.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `DESKPOOL__`-prefixed environment variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Shared reverse-proxy endpoint that all sessions are reached through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Externally-reachable host of the shared proxy.
    pub host: String,
    /// Externally-reachable port of the shared proxy.
    pub port: u16,
    /// Token file consumed by the proxy (websockify `token: host:port`
    /// format). Empty string disables the file.
    pub token_file: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6080,
            token_file: "/tmp/deskpool_tokens".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Viewer URL for a routing token. Built from the fixed proxy address,
    /// never from a session's internal VNC port.
    pub fn viewer_url(&self, token: &str) -> String {
        format!(
            "http://{}:{}/vnc.html?path=websockify/?token={}",
            self.host, self.port, token
        )
    }

    pub fn token_file_path(&self) -> Option<PathBuf> {
        if self.token_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.token_file))
        }
    }
}

/// Copy-on-write filesystem isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Whether to give each session a private OverlayFS root. When false
    /// (or when OverlayFS is unavailable) every session shares `base_dir`.
    pub enabled: bool,
    /// Shared read-only base layer. Never mutated after startup.
    pub base_dir: String,
    /// Parent directory for per-session private layers.
    pub active_dir: String,
    /// Directory for archived upper-layer snapshots.
    pub snapshot_dir: String,
    /// Archive a session's upper layer on release instead of discarding
    /// it. A later session with the same id restores the snapshot when its
    /// layers are provisioned.
    pub snapshot_on_release: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: "/sessions/base".to_string(),
            active_dir: "/sessions/active".to_string(),
            snapshot_dir: "/sessions/snapshots".to_string(),
            snapshot_on_release: false,
        }
    }
}

/// Display stack binaries and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayStackConfig {
    /// Virtual framebuffer X server.
    pub xvfb_binary: String,
    /// Desktop/window-manager process started on each display.
    pub wm_binary: String,
    /// VNC server exposing the display.
    pub vnc_binary: String,
    /// Probe used to poll display readiness.
    pub xdpyinfo_binary: String,
    pub screen_width: u32,
    pub screen_height: u32,
    /// Bound on readiness polling for each process in the stack.
    pub ready_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub grace_period_ms: u64,
}

impl Default for DisplayStackConfig {
    fn default() -> Self {
        Self {
            xvfb_binary: "Xvfb".to_string(),
            wm_binary: "tint2".to_string(),
            vnc_binary: "x11vnc".to_string(),
            xdpyinfo_binary: "xdpyinfo".to_string(),
            screen_width: 1024,
            screen_height: 768,
            ready_timeout_ms: 5_000,
            grace_period_ms: 3_000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskpoolConfig {
    /// Maximum concurrently provisioned sessions (pool bound).
    pub max_sessions: usize,
    /// First display id; the pool hands out `first_display..first_display + max_sessions`.
    pub first_display: u32,
    /// Session VNC port = `vnc_base_port + display id`.
    pub vnc_base_port: u16,
    /// Internal host VNC servers bind to and the proxy forwards to.
    pub backend_host: String,
    /// Idle sessions older than this are destroyed by the maintenance loop.
    pub idle_timeout_minutes: i64,
    /// Interval for the healthcheck + idle-cleanup maintenance pass.
    pub maintenance_interval_seconds: u64,
    pub proxy: ProxyConfig,
    pub overlay: OverlayConfig,
    pub display: DisplayStackConfig,
}

impl Default for DeskpoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            first_display: 1,
            vnc_base_port: 5900,
            backend_host: "localhost".to_string(),
            idle_timeout_minutes: 60,
            maintenance_interval_seconds: 300,
            proxy: ProxyConfig::default(),
            overlay: OverlayConfig::default(),
            display: DisplayStackConfig::default(),
        }
    }
}

impl DeskpoolConfig {
    /// Load configuration: defaults, then the optional file, then
    /// environment overrides (`DESKPOOL__OVERLAY__ENABLED=false` etc).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        } else if let Some(default_path) = Self::default_path() {
            builder = builder.add_source(
                File::from(default_path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("DESKPOOL")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut cfg: DeskpoolConfig = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Default config file location: `$XDG_CONFIG_HOME/deskpool/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("deskpool").join("config.toml"))
    }

    /// Expand `~` and environment variables in filesystem paths.
    pub fn expand_paths(&mut self) {
        self.overlay.base_dir = shellexpand::full(&self.overlay.base_dir)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| shellexpand::tilde(&self.overlay.base_dir).into_owned());
        self.overlay.active_dir = shellexpand::full(&self.overlay.active_dir)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| shellexpand::tilde(&self.overlay.active_dir).into_owned());
        self.overlay.snapshot_dir = shellexpand::full(&self.overlay.snapshot_dir)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| shellexpand::tilde(&self.overlay.snapshot_dir).into_owned());
        self.proxy.token_file = shellexpand::tilde(&self.proxy.token_file).into_owned();
    }

    /// Sanity-check pool bounds and port arithmetic.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }
        let last_display = self.first_display as u64 + self.max_sessions as u64 - 1;
        let last_port = self.vnc_base_port as u64 + last_display;
        if last_port > u16::MAX as u64 {
            anyhow::bail!(
                "vnc_base_port {} + display range up to {} exceeds the valid port range",
                self.vnc_base_port,
                last_display
            );
        }
        if self.display.ready_timeout_ms == 0 {
            anyhow::bail!("display.ready_timeout_ms must be non-zero");
        }
        Ok(())
    }

    /// VNC port for a display id.
    pub fn vnc_port(&self, display: u32) -> u16 {
        self.vnc_base_port + display as u16
    }

    /// All VNC ports the pool can hand out, for startup orphan sweeps.
    pub fn pool_ports(&self) -> Vec<u16> {
        (0..self.max_sessions)
            .map(|i| self.vnc_base_port + self.first_display as u16 + i as u16)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = DeskpoolConfig::default();
        assert_eq!(cfg.max_sessions, 16);
        assert_eq!(cfg.first_display, 1);
        assert_eq!(cfg.vnc_base_port, 5900);
        assert_eq!(cfg.proxy.port, 6080);
        assert!(cfg.overlay.enabled);
        assert!(!cfg.overlay.snapshot_on_release);
        assert_eq!(cfg.display.xvfb_binary, "Xvfb");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_vnc_port_derivation() {
        let cfg = DeskpoolConfig::default();
        assert_eq!(cfg.vnc_port(1), 5901);
        assert_eq!(cfg.vnc_port(16), 5916);

        let ports = cfg.pool_ports();
        assert_eq!(ports.len(), 16);
        assert_eq!(ports[0], 5901);
        assert_eq!(ports[15], 5916);
    }

    #[test]
    fn test_viewer_url_uses_proxy_not_backend_port() {
        let cfg = DeskpoolConfig::default();
        let url = cfg.proxy.viewer_url("tok123");
        assert_eq!(
            url,
            "http://localhost:6080/vnc.html?path=websockify/?token=tok123"
        );
        assert!(!url.contains("5901"));
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let cfg = DeskpoolConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_port_overflow() {
        let cfg = DeskpoolConfig {
            vnc_base_port: 65_500,
            max_sessions: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
max_sessions = 4
vnc_base_port = 6900

[overlay]
enabled = false
base_dir = "/srv/base"

[proxy]
port = 7080
"#
        )
        .unwrap();

        let cfg = DeskpoolConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.max_sessions, 4);
        assert_eq!(cfg.vnc_base_port, 6900);
        assert!(!cfg.overlay.enabled);
        assert_eq!(cfg.overlay.base_dir, "/srv/base");
        assert_eq!(cfg.proxy.port, 7080);
        // Untouched sections keep defaults.
        assert_eq!(cfg.display.screen_width, 1024);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = DeskpoolConfig::load(Some(Path::new("/nonexistent/deskpool.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_paths() {
        let mut cfg = DeskpoolConfig::default();
        cfg.overlay.base_dir = "~/sessions/base".to_string();
        cfg.expand_paths();
        assert!(!cfg.overlay.base_dir.starts_with('~'));
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = DeskpoolConfig::default();
        let toml = toml::to_string(&cfg).unwrap();
        let parsed: DeskpoolConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_sessions, cfg.max_sessions);
        assert_eq!(parsed.proxy.host, cfg.proxy.host);
        assert_eq!(parsed.display.grace_period_ms, cfg.display.grace_period_ms);
    }
}
