pub mod dag;
pub mod host;
pub mod instance;
pub mod utils;
pub mod workflow;
