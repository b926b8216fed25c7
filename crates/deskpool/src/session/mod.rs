//! Session lifecycle: state machine, models, and the orchestrating service.

pub mod models;
pub mod service;

pub use models::{ConnectionInfo, Session, SessionState};
pub use service::SessionManager;
