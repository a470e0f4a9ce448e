// ABOUTME: Assigns stable human-readable prefixes to containers for log output
// Repeated logical names get bracketed indexes in discovery order

use crate::models::Container;
use std::collections::{HashMap, HashSet};

/// Labels containers by logical name: the first instance keeps the bare name,
/// later instances become `name[1]`, `name[2]`, ...
///
/// A single `Labeler` keeps its counters across calls, so containers discovered
/// later in a follow session continue the numbering instead of restarting it.
#[derive(Debug, Default)]
pub struct Labeler {
    counters: HashMap<String, usize>,
    used: HashSet<String>,
}

impl Labeler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label `containers` in input order with a fresh labeler.
    pub fn label(containers: &[Container]) -> Vec<(Container, String)> {
        let mut labeler = Self::new();
        containers
            .iter()
            .map(|container| (container.clone(), labeler.assign(container)))
            .collect()
    }

    pub fn assign(&mut self, container: &Container) -> String {
        let name = &container.logical_name;
        let label = if self.counters.contains_key(name) || self.used.contains(name) {
            self.next_indexed(name)
        } else {
            self.counters.insert(name.clone(), 0);
            name.clone()
        };
        self.used.insert(label.clone());
        label
    }

    fn next_indexed(&mut self, name: &str) -> String {
        let counter = self.counters.entry(name.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{}[{}]", name, counter);
            if !self.used.contains(&candidate) {
                return candidate;
            }
        }
    }
}
