//! End-to-end session lifecycle tests against the public API.
//!
//! The display stack runs stub executables instead of Xvfb/x11vnc so the
//! suite needs no X server, and readiness probing is replaced with a no-op
//! probe. Overlay isolation runs in shared-root fallback mode so no mount
//! privileges are required.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use deskpool::config::{DeskpoolConfig, DisplayStackConfig, OverlayConfig, ProxyConfig};
use deskpool::display::{DisplaySupervisor, ReadinessProbe};
use deskpool::error::SessionResult;
use deskpool::session::{SessionManager, SessionState};

struct NoopProbe;

#[async_trait]
impl ReadinessProbe for NoopProbe {
    async fn wait_for_display(&self, _display: u32, _timeout: Duration) -> SessionResult<()> {
        Ok(())
    }
    async fn wait_for_port(&self, _host: &str, _port: u16, _timeout: Duration) -> SessionResult<()> {
        Ok(())
    }
}

fn stub_binary(dir: &TempDir, name: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.display().to_string()
}

fn test_config(dir: &TempDir, max_sessions: usize) -> DeskpoolConfig {
    DeskpoolConfig {
        max_sessions,
        first_display: 1,
        vnc_base_port: 5900,
        proxy: ProxyConfig {
            host: "desktop.example.com".to_string(),
            port: 6080,
            token_file: dir.path().join("tokens").display().to_string(),
        },
        overlay: OverlayConfig {
            enabled: false,
            base_dir: dir.path().join("base").display().to_string(),
            active_dir: dir.path().join("active").display().to_string(),
            snapshot_dir: dir.path().join("snapshots").display().to_string(),
            ..Default::default()
        },
        display: DisplayStackConfig {
            xvfb_binary: stub_binary(dir, "fake-xvfb"),
            wm_binary: stub_binary(dir, "fake-wm"),
            vnc_binary: stub_binary(dir, "fake-vnc"),
            grace_period_ms: 200,
            ready_timeout_ms: 1_000,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn manager(dir: &TempDir, max_sessions: usize) -> SessionManager {
    let config = test_config(dir, max_sessions);
    let supervisor = DisplaySupervisor::with_probe(config.display.clone(), Arc::new(NoopProbe));
    SessionManager::with_supervisor(config, supervisor)
}

#[tokio::test]
async fn full_lifecycle_of_two_sessions() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 4);
    mgr.overlay().ensure_base().unwrap();
    let initial = mgr.pool().snapshot();

    // First session comes up reachable through the proxy URL.
    let conn_a = mgr.create_session("sess_a").await.unwrap();
    assert_eq!(mgr.session_state("sess_a").await, Some(SessionState::Active));
    assert!(conn_a.url.starts_with("http://desktop.example.com:6080/"));
    assert!(conn_a.url.contains(&conn_a.token));

    let backend_a = mgr.routing().resolve(&conn_a.token).unwrap();
    assert_eq!(backend_a.port, 5901);

    // The URL never leaks the backend VNC port.
    assert!(!conn_a.url.contains("5901"));

    // Second session gets distinct resources.
    let conn_b = mgr.create_session("sess_b").await.unwrap();
    let backend_b = mgr.routing().resolve(&conn_b.token).unwrap();
    assert_ne!(conn_a.token, conn_b.token);
    assert_ne!(backend_a.port, backend_b.port);

    let a = mgr.session("sess_a").await.unwrap();
    let b = mgr.session("sess_b").await.unwrap();
    assert_ne!(a.display, b.display);

    // The proxy token file lists both sessions.
    let tokens = std::fs::read_to_string(dir.path().join("tokens")).unwrap();
    assert!(tokens.contains(&conn_a.token));
    assert!(tokens.contains(&conn_b.token));

    // Destroying A leaves B untouched.
    mgr.destroy_session("sess_a").await.unwrap();
    assert!(mgr.routing().resolve(&conn_a.token).is_none());
    assert_eq!(mgr.routing().resolve(&conn_b.token).unwrap().port, backend_b.port);
    assert_eq!(mgr.session_state("sess_b").await, Some(SessionState::Active));

    // Destroying B restores the pool to its initial state.
    mgr.destroy_session("sess_b").await.unwrap();
    assert_eq!(mgr.pool().snapshot(), initial);
    assert!(mgr.routing().is_empty());
    assert!(mgr.list_sessions().await.is_empty());
}

#[tokio::test]
async fn capacity_is_enforced_and_recovers() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 2);

    mgr.create_session("sess_1").await.unwrap();
    mgr.create_session("sess_2").await.unwrap();

    let err = mgr.create_session("sess_3").await.unwrap_err();
    assert!(err.is_capacity());

    // The rejected create left no trace beyond the failed entry.
    mgr.destroy_session("sess_3").await.unwrap();

    // Destroying one session frees capacity for a new one.
    mgr.destroy_session("sess_1").await.unwrap();
    mgr.create_session("sess_4").await.unwrap();
    assert_eq!(mgr.active_count().await, 2);

    mgr.shutdown().await;
}

#[tokio::test]
async fn display_ids_are_reused_lowest_first() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 4);

    mgr.create_session("sess_a").await.unwrap();
    mgr.create_session("sess_b").await.unwrap();
    let a_display = mgr.session("sess_a").await.unwrap().display.unwrap();
    assert_eq!(a_display, 1);

    mgr.destroy_session("sess_a").await.unwrap();

    // The freed display id goes to the next session.
    mgr.create_session("sess_c").await.unwrap();
    let c_display = mgr.session("sess_c").await.unwrap().display.unwrap();
    assert_eq!(c_display, a_display);

    mgr.shutdown().await;
}

#[tokio::test]
async fn a_fresh_token_is_issued_per_session_incarnation() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 4);

    let first = mgr.create_session("sess_a").await.unwrap();
    mgr.destroy_session("sess_a").await.unwrap();
    let second = mgr.create_session("sess_a").await.unwrap();

    // The old token must not grant access to the new incarnation.
    assert_ne!(first.token, second.token);
    assert!(mgr.routing().resolve(&first.token).is_none());
    assert!(mgr.routing().resolve(&second.token).is_some());

    mgr.shutdown().await;
}

#[tokio::test]
async fn sweep_reclaims_crashed_predecessor_state() {
    let dir = TempDir::new().unwrap();

    // A "crashed" manager leaves orphan layers and stale routing entries.
    {
        let mgr = manager(&dir, 4);
        mgr.overlay().ensure_base().unwrap();
        mgr.routing().publish("localhost", 5901).unwrap();
        for sub in ["upper", "work", "merged"] {
            std::fs::create_dir_all(dir.path().join("active/sess_ghost").join(sub)).unwrap();
        }
    }

    // A fresh manager reconciles everything at startup.
    let mgr = manager(&dir, 4);
    let reclaimed = mgr.reconcile().await.unwrap();
    assert_eq!(reclaimed, 1);
    assert!(!dir.path().join("active/sess_ghost").exists());
    assert!(mgr.routing().is_empty());

    let tokens = std::fs::read_to_string(dir.path().join("tokens")).unwrap();
    assert!(!tokens.contains("5901"));

    // Normal operation resumes with the full pool.
    mgr.create_session("sess_new").await.unwrap();
    assert_eq!(mgr.session_state("sess_new").await, Some(SessionState::Active));
    mgr.shutdown().await;
}

#[tokio::test]
async fn destroy_interrupts_nothing_for_other_sessions() {
    let dir = TempDir::new().unwrap();
    let mgr = Arc::new(manager(&dir, 8));

    let mut handles = Vec::new();
    for i in 0..6 {
        let mgr = Arc::clone(&mgr);
        handles.push(tokio::spawn(async move {
            mgr.create_session(&format!("sess_{}", i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Destroy half of them concurrently.
    let mut handles = Vec::new();
    for i in 0..3 {
        let mgr = Arc::clone(&mgr);
        handles.push(tokio::spawn(async move {
            mgr.destroy_session(&format!("sess_{}", i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(mgr.active_count().await, 3);
    for i in 3..6 {
        let id = format!("sess_{}", i);
        assert_eq!(mgr.session_state(&id).await, Some(SessionState::Active));
        mgr.connection_info(&id).await.unwrap();
    }

    mgr.shutdown().await;
    assert_eq!(mgr.pool().free_count(), 8);
}
