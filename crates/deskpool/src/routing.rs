//! Token-based routing table for the shared VNC proxy.
//!
//! One websockify-style proxy is the single external entry point for every
//! session's display. It selects the backend by an opaque token carried on
//! the inbound connection. This module owns the token -> backend mapping and
//! mirrors it into the token file the proxy reads (`token: host:port` per
//! line), rewritten atomically so the proxy never sees a torn entry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use log::{debug, info, warn};
use nanoid::nanoid;

use crate::error::{SessionError, SessionResult};

/// Length of generated routing tokens. 24 URL-safe nanoid characters is
/// far beyond guessable.
const TOKEN_LEN: usize = 24;

/// Backend address of a session's VNC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

/// Shared token -> backend mapping.
pub struct RoutingTable {
    entries: RwLock<HashMap<String, Backend>>,
    token_file: Option<PathBuf>,
}

impl RoutingTable {
    pub fn new(token_file: Option<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            token_file,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Backend>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Backend>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Publish a backend under a fresh token and return the token.
    ///
    /// On the astronomically rare token collision a second token is
    /// generated; if that also collides, [`SessionError::RoutingConflict`]
    /// is returned.
    pub fn publish(&self, host: &str, port: u16) -> SessionResult<String> {
        let mut entries = self.write();
        let mut token = nanoid!(TOKEN_LEN);
        if entries.contains_key(&token) {
            warn!("routing token collision, regenerating");
            token = nanoid!(TOKEN_LEN);
            if entries.contains_key(&token) {
                return Err(SessionError::RoutingConflict);
            }
        }

        entries.insert(
            token.clone(),
            Backend {
                host: host.to_string(),
                port,
            },
        );
        if let Err(err) = self.persist(&entries) {
            // The caller never sees this token, so it could never be
            // retracted; it must not linger in the table or reach the
            // proxy on a later rewrite.
            entries.remove(&token);
            return Err(err);
        }
        drop(entries);

        debug!("published routing entry -> {}:{}", host, port);
        Ok(token)
    }

    /// Remove a token. Idempotent; retracting an unknown token is a no-op.
    ///
    /// Must be called before the backend port is returned to the pool so no
    /// entry ever points at a port that could belong to a different session.
    pub fn retract(&self, token: &str) {
        let mut entries = self.write();
        if entries.remove(token).is_some() {
            if let Err(err) = self.persist(&entries) {
                warn!("failed to rewrite token file after retract: {}", err);
            }
            debug!("retracted routing entry");
        }
    }

    /// Resolve a token to its backend. Unknown and retracted tokens resolve
    /// to `None`; the proxy must close such connections rather than forward
    /// them, since ports are reused across the pool.
    pub fn resolve(&self, token: &str) -> Option<Backend> {
        self.read().get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, Backend> {
        self.read().clone()
    }

    /// Drop every entry and truncate the token file. Startup crash recovery:
    /// entries from a previous manager process point at ports that will be
    /// reallocated.
    pub fn clear(&self) -> SessionResult<()> {
        let mut entries = self.write();
        let had = entries.len();
        entries.clear();
        self.persist(&entries)?;
        if had > 0 {
            info!("cleared {} stale routing entries", had);
        }
        Ok(())
    }

    /// Rewrite the proxy token file to match `entries`. Written to a temp
    /// file then renamed, so proxy reads are all-or-nothing.
    fn persist(&self, entries: &HashMap<String, Backend>) -> SessionResult<()> {
        let Some(path) = &self.token_file else {
            return Ok(());
        };

        let mut body = String::from("# deskpool routing table\n");
        for (token, backend) in entries {
            body.push_str(&format!("{}: {}:{}\n", token, backend.host, backend.port));
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("entries", &self.len())
            .field("token_file", &self.token_file)
            .finish()
    }
}
