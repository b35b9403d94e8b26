pub mod ha_server;

pub use ha_server::{HaServer, HaServerListener, ServerStatus};
