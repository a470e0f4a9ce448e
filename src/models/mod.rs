// ABOUTME: Data models shared by the session runtime, router and log aggregator

pub mod command;
pub mod container;
pub mod endpoint;
pub mod session;

pub use command::{Command, CommandCatalog, CommandKind};
pub use container::{ComponentRef, Container, ContainerHandle, Mode, ModeFilter, ModeFilterError, Platform};
pub use endpoint::{Endpoint, ForwardedPort};
pub use session::{OwnedResource, Session, SessionEvent, SessionId, SessionState, InvalidTransition};
