// ABOUTME: Session data model representing a live Dev or Deploy session on one platform
// State changes go through a single transition function owned by the session manager

use super::{ComponentRef, ForwardedPort, Mode, Platform};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    StartFailed(String),
    StopRequested,
    Stopped,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid session transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

impl SessionState {
    pub fn transition(&self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        let next = match (self, &event) {
            (SessionState::Starting, SessionEvent::Started) => SessionState::Running,
            (SessionState::Starting, SessionEvent::StartFailed(reason)) => {
                SessionState::Failed(reason.clone())
            }
            (SessionState::Running, SessionEvent::StopRequested) => SessionState::Stopping,
            (SessionState::Stopping, SessionEvent::Stopped) => SessionState::Stopped,
            _ => {
                return Err(InvalidTransition {
                    from: self.clone(),
                    event,
                })
            }
        };
        Ok(next)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// No further transitions are possible from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => f.write_str("Starting"),
            SessionState::Running => f.write_str("Running"),
            SessionState::Stopping => f.write_str("Stopping"),
            SessionState::Stopped => f.write_str("Stopped"),
            SessionState::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// Something the session provisioned itself and must release on stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnedResource {
    StateFile(PathBuf),
    Task(String),
    PortForward(ForwardedPort),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub component: ComponentRef,
    pub platform: Platform,
    pub mode: Mode,
    pub state: SessionState,
    pub owned_resources: Vec<OwnedResource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(component: ComponentRef, platform: Platform, mode: Mode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            component,
            platform,
            mode,
            state: SessionState::Starting,
            owned_resources: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<&SessionState, InvalidTransition> {
        self.state = self.state.transition(event)?;
        self.updated_at = Utc::now();
        Ok(&self.state)
    }

    pub fn add_resource(&mut self, resource: OwnedResource) {
        self.owned_resources.push(resource);
        self.updated_at = Utc::now();
    }

    pub fn forwarded_ports(&self) -> Vec<&ForwardedPort> {
        self.owned_resources
            .iter()
            .filter_map(|resource| match resource {
                OwnedResource::PortForward(forwarded) => Some(forwarded),
                _ => None,
            })
            .collect()
    }
}
