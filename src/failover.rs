pub mod failover_coordinator;

pub use failover_coordinator::{FailoverCoordinator, FailoverSummary};
