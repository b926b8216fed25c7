//! Deskpool: resource and routing management for pools of isolated
//! virtual desktop sessions.
//!
//! Each session is realized as an X display plus VNC server behind a
//! shared token-routing proxy, optionally rooted in a private OverlayFS
//! copy-on-write filesystem. [`session::SessionManager`] is the entry
//! point; the other modules are its building blocks.

pub mod config;
pub mod display;
pub mod error;
pub mod overlay;
pub mod pool;
pub mod routing;
pub mod session;
