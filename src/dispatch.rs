pub mod dispatcher;
pub mod host_selector;
pub mod transport;

pub use dispatcher::{DispatchOutcome, DispatchTarget, Dispatcher};
pub use host_selector::{HostSelector, LoadBalancer};
pub use transport::Transport;
