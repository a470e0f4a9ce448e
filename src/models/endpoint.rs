// ABOUTME: Container endpoints a Dev session makes reachable from the developer's machine
// An Endpoint is declared by the project; a ForwardedPort is what a running session opened

use serde::{Deserialize, Serialize};
use std::fmt;

/// A port a component container listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    /// Logical name of the container exposing the port.
    pub container: String,
    pub target_port: u16,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, container: impl Into<String>, target_port: u16) -> Self {
        Self {
            name: name.into(),
            container: container.into(),
            target_port,
        }
    }
}

/// A local address forwarding to an endpoint of a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPort {
    pub endpoint: String,
    pub container: String,
    pub local_address: String,
    pub local_port: u16,
    pub container_port: u16,
}

impl fmt::Display for ForwardedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.local_address, self.local_port, self.container, self.container_port
        )
    }
}
