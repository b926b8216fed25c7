//! Session lifecycle controller.
//!
//! Orchestrates the resource pool, overlay engine, display supervisor, and
//! routing table per session, in dependency order on create and reverse
//! order on destroy:
//!
//! ```text
//! create:  acquire ids -> provision overlay -> start processes -> publish routing
//! destroy: retract routing -> stop processes -> release overlay -> release ids
//! ```
//!
//! Per-session operations are serialized through a per-session lock;
//! different sessions proceed fully in parallel. A destroy issued while a
//! create is still provisioning cancels the create, which then falls
//! through the same rollback path as a failed step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::DeskpoolConfig;
use crate::display::{self, DisplaySupervisor, Health, ProcessGroup};
use crate::error::{SessionError, SessionResult};
use crate::overlay::{OverlayHandle, OverlayManager};
use crate::pool::{DisplayLease, DisplayPool};
use crate::routing::RoutingTable;

use super::models::{ConnectionInfo, Session, SessionState};

/// Resources held by one session, owned under its operation lock.
#[derive(Default)]
struct Resources {
    lease: Option<DisplayLease>,
    overlay: Option<OverlayHandle>,
    group: Option<ProcessGroup>,
}

struct SessionSlot {
    /// Cancelled by destroy to interrupt an in-flight create.
    cancel: CancellationToken,
    /// Cheap-to-read session metadata; never held across an await.
    state: std::sync::Mutex<Session>,
    /// Serializes lifecycle operations for this session and owns its
    /// resource handles.
    op: Mutex<Resources>,
}

impl SessionSlot {
    fn new(id: &str) -> Self {
        Self {
            cancel: CancellationToken::new(),
            state: std::sync::Mutex::new(Session::new(id)),
            op: Mutex::new(Resources::default()),
        }
    }

    fn snapshot(&self) -> Session {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut Session)) {
        let mut session = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut session);
    }
}

/// The session resource and routing manager.
///
/// All shared state (pool, routing table, session map) is owned by this
/// struct; it can be instantiated multiple times, e.g. one per test.
pub struct SessionManager {
    config: DeskpoolConfig,
    pool: DisplayPool,
    routing: RoutingTable,
    overlay: OverlayManager,
    supervisor: DisplaySupervisor,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionManager {
    pub fn new(config: DeskpoolConfig) -> Self {
        let supervisor = DisplaySupervisor::new(config.display.clone());
        Self::with_supervisor(config, supervisor)
    }

    /// Build with a custom supervisor (tests inject stub binaries and a
    /// no-op readiness probe).
    pub fn with_supervisor(config: DeskpoolConfig, supervisor: DisplaySupervisor) -> Self {
        let pool = DisplayPool::new(
            config.first_display,
            config.max_sessions,
            config.vnc_base_port,
        );
        let routing = RoutingTable::new(config.proxy.token_file_path());
        let overlay = OverlayManager::new(config.overlay.clone());
        Self {
            config,
            pool,
            routing,
            overlay,
            supervisor,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DeskpoolConfig {
        &self.config
    }

    pub fn pool(&self) -> &DisplayPool {
        &self.pool
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn overlay(&self) -> &OverlayManager {
        &self.overlay
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a session: allocate identifiers, provision the overlay root,
    /// start the display stack, publish routing. Any failure rolls back
    /// everything acquired so far and reports a single typed error; partial
    /// provisioning never leaks a resource.
    pub async fn create_session(&self, id: &str) -> SessionResult<ConnectionInfo> {
        let slot = {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(id) {
                return Err(SessionError::AlreadyExists(id.to_string()));
            }
            let slot = Arc::new(SessionSlot::new(id));
            sessions.insert(id.to_string(), Arc::clone(&slot));
            slot
        };

        let mut res = slot.op.lock().await;
        slot.update(|s| s.state = SessionState::Provisioning);
        info!("provisioning session {}", id);

        match self.provision(&slot, &mut res, id).await {
            Ok(conn) => {
                slot.update(|s| s.state = SessionState::Active);
                info!("session {} active", id);
                Ok(conn)
            }
            Err(err) => {
                warn!("session {} provisioning failed: {}", id, err);
                self.teardown_resources(&slot, &mut res).await;

                if slot.cancel.is_cancelled() {
                    // Destroy arrived mid-create; rollback doubled as the
                    // teardown, so the session ends Destroyed, not Failed.
                    slot.update(|s| s.state = SessionState::Destroyed);
                    drop(res);
                    self.sessions.lock().await.remove(id);
                } else {
                    slot.update(|s| s.state = SessionState::Failed);
                }
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        slot: &SessionSlot,
        res: &mut Resources,
        id: &str,
    ) -> SessionResult<ConnectionInfo> {
        let lease = self.pool.acquire()?;
        res.lease = Some(lease);
        slot.update(|s| {
            s.display = Some(lease.display);
            s.vnc_port = Some(lease.vnc_port);
        });
        self.check_cancelled(slot)?;

        let overlay = self.overlay.provision(id).await?;
        let fs_env = overlay.env();
        res.overlay = Some(overlay);
        self.check_cancelled(slot)?;

        let group = self
            .supervisor
            .start(id, lease.display, lease.vnc_port, &fs_env)
            .await?;
        res.group = Some(group);
        self.check_cancelled(slot)?;

        // Published only after the VNC server is confirmed listening; the
        // URL becomes valid exactly here.
        let token = self
            .routing
            .publish(&self.config.backend_host, lease.vnc_port)?;
        slot.update(|s| s.token = Some(token.clone()));

        Ok(ConnectionInfo {
            url: self.config.proxy.viewer_url(&token),
            token,
        })
    }

    fn check_cancelled(&self, slot: &SessionSlot) -> SessionResult<()> {
        if slot.cancel.is_cancelled() {
            Err(SessionError::Failed(
                "destroy requested during provisioning".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Destroy a session: retract routing, stop processes, release the
    /// overlay, return identifiers to the pool — in that order, so no
    /// routing entry ever points at a port that could be reallocated.
    ///
    /// Idempotent: destroying an unknown or already-destroyed session is a
    /// no-op. Interrupts an in-flight create for the same id.
    pub async fn destroy_session(&self, id: &str) -> SessionResult<()> {
        let slot = {
            let sessions = self.sessions.lock().await;
            match sessions.get(id) {
                Some(slot) => Arc::clone(slot),
                None => {
                    debug!("destroy for unknown session {} (no-op)", id);
                    return Ok(());
                }
            }
        };

        slot.cancel.cancel();
        let mut res = slot.op.lock().await;

        if slot.snapshot().state == SessionState::Destroyed {
            return Ok(());
        }

        slot.update(|s| s.state = SessionState::Terminating);
        info!("terminating session {}", id);

        self.teardown_resources(&slot, &mut res).await;

        slot.update(|s| s.state = SessionState::Destroyed);
        drop(res);
        self.sessions.lock().await.remove(id);
        info!("session {} destroyed", id);
        Ok(())
    }

    /// Release everything a session holds, in reverse dependency order.
    /// Best-effort throughout: teardown must always complete so resources
    /// are never left leaked behind a stuck cleanup step.
    async fn teardown_resources(&self, slot: &SessionSlot, res: &mut Resources) {
        let token = slot.snapshot().token;
        if let Some(token) = token {
            self.routing.retract(&token);
            slot.update(|s| s.token = None);
        }

        if let Some(mut group) = res.group.take() {
            self.supervisor.stop(&mut group).await;
        }

        if let Some(mut overlay) = res.overlay.take() {
            if let Err(err) = self.overlay.release(&mut overlay).await {
                warn!(
                    "overlay release for session {} failed ({}), continuing teardown",
                    overlay.session_id, err
                );
            }
        }

        if let Some(lease) = res.lease.take() {
            self.pool.release(lease.display);
        }
        slot.update(|s| {
            s.display = None;
            s.vnc_port = None;
        });
    }

    // =========================================================================
    // Health monitoring
    // =========================================================================

    /// Check one session's process group. A dead group moves the session
    /// through teardown into the terminal `Failed` state; its resources
    /// are released but the entry is kept so the API layer can observe the
    /// failure.
    pub async fn healthcheck_session(&self, id: &str) -> SessionResult<Health> {
        let slot = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(id)
                .cloned()
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?
        };

        let mut res = slot.op.lock().await;
        if slot.snapshot().state != SessionState::Active {
            return Ok(Health::Dead);
        }

        let health = match res.group.as_mut() {
            Some(group) => self.supervisor.healthcheck(group),
            None => Health::Dead,
        };

        if health == Health::Dead {
            warn!("session {} display stack died, failing session", id);
            slot.update(|s| s.state = SessionState::Terminating);
            self.teardown_resources(&slot, &mut res).await;
            slot.update(|s| s.state = SessionState::Failed);
        }
        Ok(health)
    }

    /// Healthcheck every active session.
    pub async fn healthcheck_all(&self) -> usize {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, slot)| slot.snapshot().state == SessionState::Active)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut failed = 0;
        for id in ids {
            if let Ok(Health::Dead) = self.healthcheck_session(&id).await {
                failed += 1;
            }
        }
        failed
    }

    /// Destroy sessions idle for longer than the configured timeout.
    pub async fn cleanup_idle(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.config.idle_timeout_minutes);
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .map(|slot| slot.snapshot())
                .filter(|s| s.state == SessionState::Active && s.last_active < cutoff)
                .map(|s| s.id)
                .collect()
        };

        let mut destroyed = 0;
        for id in expired {
            info!("destroying idle session {}", id);
            if self.destroy_session(&id).await.is_ok() {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Periodic maintenance: healthchecks plus idle cleanup, until
    /// cancelled.
    pub async fn run_maintenance(&self, cancel: CancellationToken) {
        let interval = std::time::Duration::from_secs(self.config.maintenance_interval_seconds);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let failed = self.healthcheck_all().await;
            let idle = self.cleanup_idle().await;
            if failed > 0 || idle > 0 {
                info!(
                    "maintenance pass: {} failed healthcheck, {} idle destroyed",
                    failed, idle
                );
            }
        }
    }

    // =========================================================================
    // Crash recovery
    // =========================================================================

    /// Startup reconciliation: reset the routing table, clear orphan
    /// display processes off the pool's port range, and reclaim overlay
    /// layers left by a crashed predecessor. Idempotent; run once before
    /// accepting create requests.
    pub async fn reconcile(&self) -> SessionResult<usize> {
        self.routing.clear()?;

        let ports = self.config.pool_ports();
        let cleared = tokio::task::spawn_blocking(move || display::clear_ports(&ports))
            .await
            .unwrap_or(0);
        if cleared > 0 {
            info!("cleared {} orphan display processes", cleared);
        }

        let live: HashSet<String> = self.session_ids().await.into_iter().collect();
        let reclaimed = self.overlay.reconcile(&live).await;
        Ok(reclaimed)
    }

    /// Destroy every session (process shutdown).
    pub async fn shutdown(&self) {
        info!("shutting down all sessions");
        for id in self.session_ids().await {
            if let Err(err) = self.destroy_session(&id).await {
                warn!("failed to destroy session {} on shutdown: {}", id, err);
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn session(&self, id: &str) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions.get(id).map(|slot| slot.snapshot())
    }

    pub async fn session_state(&self, id: &str) -> Option<SessionState> {
        self.session(id).await.map(|s| s.state)
    }

    /// Connection descriptor for an active session. The URL goes through
    /// the shared proxy; the session's internal port is never exposed.
    pub async fn connection_info(&self, id: &str) -> SessionResult<ConnectionInfo> {
        let session = self
            .session(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if !session.state.is_reachable() {
            return Err(SessionError::Failed(format!(
                "session {} is {}",
                id, session.state
            )));
        }
        let token = session
            .token
            .ok_or_else(|| SessionError::Failed(format!("session {} has no token", id)))?;
        Ok(ConnectionInfo {
            url: self.config.proxy.viewer_url(&token),
            token,
        })
    }

    /// Record client activity, for idle-timeout tracking.
    pub async fn touch(&self, id: &str) -> SessionResult<()> {
        let sessions = self.sessions.lock().await;
        let slot = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        slot.update(|s| s.last_active = Utc::now());
        Ok(())
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<Session> = sessions.values().map(|slot| slot.snapshot()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub async fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|slot| slot.snapshot().state == SessionState::Active)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    async fn session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions.keys().cloned().collect()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("pool", &self.pool)
            .field("routing", &self.routing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplayStackConfig, OverlayConfig, ProxyConfig};
    use crate::display::ReadinessProbe;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoopProbe;

    #[async_trait]
    impl ReadinessProbe for NoopProbe {
        async fn wait_for_display(&self, _display: u32, _timeout: Duration) -> SessionResult<()> {
            Ok(())
        }
        async fn wait_for_port(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> SessionResult<()> {
            Ok(())
        }
    }

    fn stub_binary(dir: &TempDir, name: &str, script: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.display().to_string()
    }

    fn test_config(dir: &TempDir, max_sessions: usize) -> DeskpoolConfig {
        let long_lived = "#!/bin/sh\nexec sleep 30\n";
        DeskpoolConfig {
            max_sessions,
            first_display: 1,
            vnc_base_port: 5900,
            proxy: ProxyConfig {
                token_file: String::new(),
                ..Default::default()
            },
            overlay: OverlayConfig {
                enabled: false,
                base_dir: dir.path().join("base").display().to_string(),
                active_dir: dir.path().join("active").display().to_string(),
                snapshot_dir: dir.path().join("snapshots").display().to_string(),
                ..Default::default()
            },
            display: DisplayStackConfig {
                xvfb_binary: stub_binary(dir, "fake-xvfb", long_lived),
                wm_binary: stub_binary(dir, "fake-wm", long_lived),
                vnc_binary: stub_binary(dir, "fake-vnc", long_lived),
                grace_period_ms: 200,
                ready_timeout_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn test_manager(dir: &TempDir, max_sessions: usize) -> SessionManager {
        let config = test_config(dir, max_sessions);
        let supervisor =
            DisplaySupervisor::with_probe(config.display.clone(), Arc::new(NoopProbe));
        SessionManager::with_supervisor(config, supervisor)
    }

    #[tokio::test]
    async fn test_create_and_destroy() {
        let dir = TempDir::new().unwrap();
        let mgr = test_manager(&dir, 4);

        let conn = mgr.create_session("sess_a").await.unwrap();
        assert!(conn.url.contains(&conn.token));
        assert_eq!(
            mgr.session_state("sess_a").await,
            Some(SessionState::Active)
        );
        assert!(mgr.routing().resolve(&conn.token).is_some());

        mgr.destroy_session("sess_a").await.unwrap();
        assert!(mgr.session("sess_a").await.is_none());
        assert!(mgr.routing().resolve(&conn.token).is_none());
        assert_eq!(mgr.pool().free_count(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let dir = TempDir::new().unwrap();
        let mgr = test_manager(&dir, 4);

        mgr.create_session("sess_a").await.unwrap();
        let err = mgr.create_session("sess_a").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_destroy_unknown_session_is_noop() {
        let dir = TempDir::new().unwrap();
        let mgr = test_manager(&dir, 4);
        mgr.destroy_session("never-created").await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = test_manager(&dir, 4);

        mgr.create_session("sess_a").await.unwrap();
        mgr.destroy_session("sess_a").await.unwrap();
        mgr.destroy_session("sess_a").await.unwrap();
        assert_eq!(mgr.pool().free_count(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_pool_surfaces_capacity_error() {
        let dir = TempDir::new().unwrap();
        let mgr = test_manager(&dir, 2);

        mgr.create_session("sess_a").await.unwrap();
        mgr.create_session("sess_b").await.unwrap();

        let err = mgr.create_session("sess_c").await.unwrap_err();
        assert!(err.is_capacity());

        // The existing sessions are untouched.
        assert_eq!(
            mgr.session_state("sess_a").await,
            Some(SessionState::Active)
        );
        assert_eq!(
            mgr.session_state("sess_b").await,
            Some(SessionState::Active)
        );
        assert_eq!(mgr.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_rolls_back_completely() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 4);
        config.display.vnc_binary = "/nonexistent/deskpool-vnc".to_string();
        let supervisor =
            DisplaySupervisor::with_probe(config.display.clone(), Arc::new(NoopProbe));
        let mgr = SessionManager::with_supervisor(config, supervisor);

        let pool_before = mgr.pool().snapshot();
        let routing_before = mgr.routing().snapshot();

        let err = mgr.create_session("sess_a").await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));

        // Exactly the state from before the failed create.
        assert_eq!(mgr.pool().snapshot(), pool_before);
        assert_eq!(mgr.routing().snapshot(), routing_before);
        assert_eq!(
            mgr.session_state("sess_a").await,
            Some(SessionState::Failed)
        );

        // A failed entry can still be destroyed, which clears it.
        mgr.destroy_session("sess_a").await.unwrap();
        assert!(mgr.session("sess_a").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_session_id_is_reusable_after_destroy() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 4);
        let good_vnc = config.display.vnc_binary.clone();
        config.display.vnc_binary = "/nonexistent/deskpool-vnc".to_string();
        let supervisor =
            DisplaySupervisor::with_probe(config.display.clone(), Arc::new(NoopProbe));
        let mgr = SessionManager::with_supervisor(config, supervisor);

        mgr.create_session("sess_a").await.unwrap_err();
        mgr.destroy_session("sess_a").await.unwrap();

        // Same id works once the spawn problem is gone.
        let mut config = test_config(&dir, 4);
        config.display.vnc_binary = good_vnc;
        let supervisor =
            DisplaySupervisor::with_probe(config.display.clone(), Arc::new(NoopProbe));
        let mgr = SessionManager::with_supervisor(config, supervisor);
        mgr.create_session("sess_a").await.unwrap();
    }

    #[tokio::test]
    async fn test_healthcheck_fails_crashed_session() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 4);
        config.display.wm_binary = stub_binary(&dir, "crashing-wm", "#!/bin/sh\nexit 0\n");
        let supervisor =
            DisplaySupervisor::with_probe(config.display.clone(), Arc::new(NoopProbe));
        let mgr = SessionManager::with_supervisor(config, supervisor);

        let conn = mgr.create_session("sess_a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let health = mgr.healthcheck_session("sess_a").await.unwrap();
        assert_eq!(health, Health::Dead);
        assert_eq!(
            mgr.session_state("sess_a").await,
            Some(SessionState::Failed)
        );

        // Resources were released and routing retracted.
        assert!(mgr.routing().resolve(&conn.token).is_none());
        assert_eq!(mgr.pool().free_count(), 4);
    }

    #[tokio::test]
    async fn test_touch_and_idle_cleanup() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 4);
        config.idle_timeout_minutes = 0;
        let supervisor =
            DisplaySupervisor::with_probe(config.display.clone(), Arc::new(NoopProbe));
        let mgr = SessionManager::with_supervisor(config, supervisor);

        mgr.create_session("sess_a").await.unwrap();
        mgr.touch("sess_a").await.unwrap();

        // With a zero timeout everything active counts as idle.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let destroyed = mgr.cleanup_idle().await;
        assert_eq!(destroyed, 1);
        assert!(mgr.session("sess_a").await.is_none());
    }

    #[tokio::test]
    async fn test_connection_info_only_when_active() {
        let dir = TempDir::new().unwrap();
        let mgr = test_manager(&dir, 4);

        assert!(matches!(
            mgr.connection_info("sess_a").await.unwrap_err(),
            SessionError::NotFound(_)
        ));

        let conn = mgr.create_session("sess_a").await.unwrap();
        let looked_up = mgr.connection_info("sess_a").await.unwrap();
        assert_eq!(looked_up, conn);

        mgr.destroy_session("sess_a").await.unwrap();
        assert!(mgr.connection_info("sess_a").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_resources() {
        let dir = TempDir::new().unwrap();
        let mgr = Arc::new(test_manager(&dir, 8));

        let mut handles = Vec::new();
        for i in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.create_session(&format!("sess_{}", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let sessions = mgr.list_sessions().await;
        assert_eq!(sessions.len(), 8);

        let displays: std::collections::HashSet<u32> =
            sessions.iter().filter_map(|s| s.display).collect();
        let tokens: std::collections::HashSet<String> =
            sessions.iter().filter_map(|s| s.token.clone()).collect();
        assert_eq!(displays.len(), 8);
        assert_eq!(tokens.len(), 8);

        mgr.shutdown().await;
        assert_eq!(mgr.pool().free_count(), 8);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let dir = TempDir::new().unwrap();
        let mgr = test_manager(&dir, 4);

        mgr.create_session("sess_a").await.unwrap();
        mgr.create_session("sess_b").await.unwrap();

        mgr.shutdown().await;
        assert!(mgr.list_sessions().await.is_empty());
        assert!(mgr.routing().is_empty());
        assert_eq!(mgr.pool().free_count(), 4);
    }

    #[tokio::test]
    async fn test_reconcile_reclaims_orphans() {
        let dir = TempDir::new().unwrap();
        let mgr = test_manager(&dir, 4);

        // Layers from a crashed previous manager.
        for sub in ["upper", "work", "merged"] {
            std::fs::create_dir_all(dir.path().join("active/sess_ghost").join(sub)).unwrap();
        }

        let reclaimed = mgr.reconcile().await.unwrap();
        assert_eq!(reclaimed, 1);
        assert!(!dir.path().join("active/sess_ghost").exists());

        // The implied display id is allocatable again.
        mgr.create_session("sess_new").await.unwrap();
        assert_eq!(
            mgr.session_state("sess_new").await,
            Some(SessionState::Active)
        );
    }
}
