use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::registry::Server;

/// Strategy picking the first candidate of a load-balanced call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostSelector {
    Random,
    RoundRobin,
    #[default]
    LowerWeight,
}

#[derive(Debug, Default)]
pub struct LoadBalancer {
    selector: HostSelector,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(selector: HostSelector) -> Self {
        LoadBalancer { selector, cursor: AtomicUsize::new(0) }
    }

    pub fn selector(&self) -> HostSelector {
        self.selector
    }

    /// Index of the chosen candidate, `None` when there is nothing to choose from.
    pub fn select(&self, candidates: &[Server]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = match self.selector {
            HostSelector::Random => rand::rng().random_range(0..candidates.len()),
            HostSelector::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len(),
            // Ties go to the earliest registered server.
            HostSelector::LowerWeight => {
                candidates.iter().enumerate().min_by_key(|(i, server)| (server.weight, *i)).map(|(i, _)| i).unwrap_or(0)
            }
        };

        Some(index)
    }
}
