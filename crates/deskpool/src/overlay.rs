//! OverlayFS-based filesystem isolation.
//!
//! Each session gets a copy-on-write view of a shared read-only base layer:
//!
//! ```text
//! {base_dir}                      read-only lower layer, shared
//! {active_dir}/{session_id}/
//!   upper/                        per-session writes
//!   work/                         overlayfs workdir
//!   merged/                       mount point, what the session sees
//! ```
//!
//! Private layers are named by session id so a later manager process can
//! discover and reclaim them after a crash. When isolation is disabled or
//! OverlayFS cannot be mounted (kernel support plus mount privileges are
//! required), every session is handed the shared base root instead; callers
//! must not assume isolation is present.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::OverlayConfig;
use crate::error::{SessionError, SessionResult};

/// A session's visible filesystem root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayHandle {
    pub session_id: String,
    /// Root the session's processes run against: the merged mount when
    /// isolated, the shared base otherwise.
    pub root: PathBuf,
    /// Whether a merged overlay is currently mounted for this handle.
    pub mounted: bool,
    /// Private layer directory (`{active_dir}/{session_id}`), present only
    /// when isolation was applied.
    session_dir: Option<PathBuf>,
}

impl OverlayHandle {
    pub fn is_isolated(&self) -> bool {
        self.session_dir.is_some()
    }

    /// Environment for processes rooted at this filesystem.
    pub fn env(&self) -> Vec<(String, String)> {
        let home = self.root.join("home").join("user");
        let tmp = self.root.join("tmp");
        vec![
            ("HOME".to_string(), home.display().to_string()),
            ("TMPDIR".to_string(), tmp.display().to_string()),
            (
                "XDG_CONFIG_HOME".to_string(),
                home.join(".config").display().to_string(),
            ),
            (
                "XDG_DATA_HOME".to_string(),
                home.join(".local/share").display().to_string(),
            ),
            (
                "XDG_CACHE_HOME".to_string(),
                home.join(".cache").display().to_string(),
            ),
            ("XDG_RUNTIME_DIR".to_string(), tmp.display().to_string()),
        ]
    }
}

/// Provisions and tears down per-session overlay roots.
pub struct OverlayManager {
    config: OverlayConfig,
    /// Cached result of the OverlayFS availability probe.
    available: Mutex<Option<bool>>,
}

impl OverlayManager {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            available: Mutex::new(None),
        }
    }

    pub fn base_dir(&self) -> &Path {
        Path::new(&self.config.base_dir)
    }

    pub fn active_dir(&self) -> &Path {
        Path::new(&self.config.active_dir)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.active_dir().join(session_id)
    }

    pub fn snapshot_dir(&self) -> &Path {
        Path::new(&self.config.snapshot_dir)
    }

    fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.snapshot_dir().join(format!("{}.tar.gz", session_id))
    }

    /// Create the shared base skeleton. The base is treated as read-only
    /// for the rest of the process lifetime once this returns.
    pub fn ensure_base(&self) -> SessionResult<()> {
        let base = self.base_dir();
        let home = base.join("home").join("user");
        for subdir in [".config", ".local/share", ".cache", "Desktop", "Downloads"] {
            std::fs::create_dir_all(home.join(subdir))?;
        }

        let tmp = base.join("tmp");
        std::fs::create_dir_all(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o1777))?;
        }

        std::fs::create_dir_all(self.active_dir())?;
        info!("base filesystem ready at {}", base.display());
        Ok(())
    }

    /// Create a private copy-on-write root for a session.
    ///
    /// Falls back to the shared base when isolation is disabled or
    /// OverlayFS is unavailable.
    pub async fn provision(&self, session_id: &str) -> SessionResult<OverlayHandle> {
        if !self.config.enabled {
            debug!(
                "isolation disabled, session {} gets shared root",
                session_id
            );
            return Ok(self.shared_handle(session_id));
        }

        if !self.overlay_available().await {
            warn!(
                "OverlayFS unavailable, session {} gets shared root (no isolation)",
                session_id
            );
            return Ok(self.shared_handle(session_id));
        }

        let session_dir = self.session_dir(session_id);
        let upper = session_dir.join("upper");
        let work = session_dir.join("work");
        let merged = session_dir.join("merged");

        for dir in [&upper, &work, &merged] {
            std::fs::create_dir_all(dir)?;
        }

        if self.restore(session_id).await? {
            debug!("session {} resumed from archived upper layer", session_id);
        }

        if let Err(err) = self.mount_overlay(&upper, &work, &merged).await {
            // Never leave half-provisioned layers behind.
            if let Err(rm_err) = std::fs::remove_dir_all(&session_dir) {
                warn!(
                    "failed to remove layers for {} after mount failure: {}",
                    session_id, rm_err
                );
            }
            return Err(err);
        }

        info!("overlay mounted for session {}", session_id);
        Ok(OverlayHandle {
            session_id: session_id.to_string(),
            root: merged,
            mounted: true,
            session_dir: Some(session_dir),
        })
    }

    /// Unmount and delete a session's private layers.
    ///
    /// Deletion happens only after a successful unmount; a failed unmount
    /// aborts with [`SessionError::Mount`] rather than deleting storage
    /// that is still part of a live mount. Idempotent for shared-root and
    /// already-released handles.
    pub async fn release(&self, handle: &mut OverlayHandle) -> SessionResult<()> {
        let Some(session_dir) = handle.session_dir.clone() else {
            return Ok(());
        };

        if handle.mounted {
            let merged = session_dir.join("merged");
            if is_mount_point(&merged) {
                self.unmount(&merged, false).await?;
            }
            handle.mounted = false;
        }

        // Archiving before deletion; an archive failure keeps the layers.
        if self.config.snapshot_on_release {
            self.archive(&handle.session_id).await?;
        }

        if session_dir.exists() {
            std::fs::remove_dir_all(&session_dir)?;
            debug!("removed layers for session {}", handle.session_id);
        }
        Ok(())
    }

    /// Archive a session's private upper layer to a compressed snapshot.
    ///
    /// Returns the snapshot path, or `None` when the session has no
    /// private layers (shared-root fallback, or already released). The
    /// archive is written to a temp file and renamed so a partial write
    /// never shadows an earlier snapshot.
    pub async fn archive(&self, session_id: &str) -> SessionResult<Option<PathBuf>> {
        let session_dir = self.session_dir(session_id);
        if !session_dir.join("upper").is_dir() {
            return Ok(None);
        }

        std::fs::create_dir_all(self.snapshot_dir())?;
        let snapshot = self.snapshot_path(session_id);
        let tmp = snapshot.with_extension("tmp");

        let output = Command::new("tar")
            .arg("-czf")
            .arg(&tmp)
            .arg("-C")
            .arg(&session_dir)
            .arg("upper")
            .output()
            .await
            .map_err(|err| SessionError::Archive(format!("spawning tar: {}", err)))?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&tmp);
            return Err(SessionError::Archive(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        std::fs::rename(&tmp, &snapshot)?;
        info!(
            "archived upper layer for session {} to {}",
            session_id,
            snapshot.display()
        );
        Ok(Some(snapshot))
    }

    /// Restore an archived upper layer into the session's private layer
    /// directory. Returns whether a snapshot was found; the snapshot is
    /// consumed on success.
    pub async fn restore(&self, session_id: &str) -> SessionResult<bool> {
        let snapshot = self.snapshot_path(session_id);
        if !snapshot.is_file() {
            return Ok(false);
        }

        let session_dir = self.session_dir(session_id);
        std::fs::create_dir_all(&session_dir)?;

        let output = Command::new("tar")
            .arg("-xzf")
            .arg(&snapshot)
            .arg("-C")
            .arg(&session_dir)
            .output()
            .await
            .map_err(|err| SessionError::Archive(format!("spawning tar: {}", err)))?;

        if !output.status.success() {
            return Err(SessionError::Archive(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        std::fs::remove_file(&snapshot)?;
        info!("restored upper layer for session {}", session_id);
        Ok(true)
    }

    /// Startup sweep: reclaim private layers left behind by a crashed
    /// manager process. Any session directory not in `live` is unmounted
    /// (best effort, escalating to a lazy unmount) and deleted.
    pub async fn reconcile(&self, live: &HashSet<String>) -> usize {
        let active = self.active_dir();
        let entries = match std::fs::read_dir(active) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!("cannot scan {}: {}", active.display(), err);
                return 0;
            }
        };

        let mut reclaimed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) || !entry.path().is_dir() {
                continue;
            }

            let merged = entry.path().join("merged");
            if is_mount_point(&merged) {
                if let Err(err) = self.unmount(&merged, false).await {
                    warn!("orphan {} unmount failed ({}), trying lazy", name, err);
                    if let Err(err) = self.unmount(&merged, true).await {
                        warn!("orphan {} lazy unmount failed, skipping: {}", name, err);
                        continue;
                    }
                }
            }

            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    info!("reclaimed orphan session layers: {}", name);
                    reclaimed += 1;
                }
                Err(err) => warn!("failed to remove orphan layers {}: {}", name, err),
            }
        }
        reclaimed
    }

    fn shared_handle(&self, session_id: &str) -> OverlayHandle {
        OverlayHandle {
            session_id: session_id.to_string(),
            root: self.base_dir().to_path_buf(),
            mounted: false,
            session_dir: None,
        }
    }

    async fn mount_overlay(&self, upper: &Path, work: &Path, merged: &Path) -> SessionResult<()> {
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            self.base_dir().display(),
            upper.display(),
            work.display()
        );
        let output = Command::new("mount")
            .args(["-t", "overlay", "overlay", "-o", &options])
            .arg(merged)
            .output()
            .await
            .map_err(|err| SessionError::Mount(format!("spawning mount: {}", err)))?;

        if !output.status.success() {
            return Err(SessionError::Mount(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn unmount(&self, merged: &Path, lazy: bool) -> SessionResult<()> {
        let mut cmd = Command::new("umount");
        if lazy {
            cmd.arg("-l");
        }
        let output = cmd
            .arg(merged)
            .output()
            .await
            .map_err(|err| SessionError::Mount(format!("spawning umount: {}", err)))?;

        if !output.status.success() && is_mount_point(merged) {
            return Err(SessionError::Mount(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// Probe whether OverlayFS mounts can actually be performed: kernel
    /// support plus mount privileges. The result is cached.
    async fn overlay_available(&self) -> bool {
        let mut cached = self.available.lock().await;
        if let Some(available) = *cached {
            return available;
        }

        let available = self.probe_overlay().await;
        *cached = Some(available);
        if !available {
            info!("OverlayFS not available, sessions will share the base root");
        }
        available
    }

    async fn probe_overlay(&self) -> bool {
        let kernel_support = std::fs::read_to_string("/proc/filesystems")
            .map(|s| s.lines().any(|l| l.trim_end().ends_with("overlay")))
            .unwrap_or(false);
        if !kernel_support {
            return false;
        }

        // Mounting needs CAP_SYS_ADMIN; a test mount is the only reliable
        // check.
        let probe = self.active_dir().join(".overlay_probe");
        let lower = probe.join("lower");
        let upper = probe.join("upper");
        let work = probe.join("work");
        let merged = probe.join("merged");
        for dir in [&lower, &upper, &work, &merged] {
            if std::fs::create_dir_all(dir).is_err() {
                return false;
            }
        }

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        let mounted = Command::new("mount")
            .args(["-t", "overlay", "overlay", "-o", &options])
            .arg(&merged)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false);

        if mounted {
            let _ = Command::new("umount").arg(&merged).output().await;
        }
        let _ = std::fs::remove_dir_all(&probe);
        mounted
    }
}

impl std::fmt::Debug for OverlayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayManager")
            .field("config", &self.config)
            .finish()
    }
}

/// Whether `path` is currently a mount point, per /proc/self/mounts.
#[cfg(target_os = "linux")]
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    // Mount paths escape spaces as \040 in /proc.
    let needle = path.display().to_string().replace(' ', "\\040");
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount| mount == needle)
}

#[cfg(not(target_os = "linux"))]
pub fn is_mount_point(_path: &Path) -> bool {
    false
}
