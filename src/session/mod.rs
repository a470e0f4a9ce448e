// ABOUTME: Session lifecycle, cancellation primitives and per-process state files

pub mod manager;
pub mod persistence;
pub mod signal;

pub use manager::{SessionError, SessionManager, SessionRequest};
pub use persistence::{PersistenceError, StateStore};
pub use signal::{StopSignal, StopTrigger, TaskGroup};
