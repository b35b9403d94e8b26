pub mod config;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod event;
pub mod failover;
pub mod ha;
pub mod loader;
pub mod logger;
pub mod master;
pub mod metrics;
pub mod registry;
pub mod remote;
pub mod store;

pub use error::{Error, ErrorKind, Result};
