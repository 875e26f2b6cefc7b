//! Browser session management
//!
//! A session is a logical browser automation context identified by a
//! controller-supplied id. [`SessionManager`] owns the session table,
//! enforces creation limits and evicts idle or aged sessions.

mod manager;
mod session;

pub use manager::{SessionError, SessionManager, SessionResult};
pub use session::{PendingResult, Session, SessionState};
