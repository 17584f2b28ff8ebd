pub mod config;
pub mod error;
pub mod protocol;
pub mod sched;
pub mod server;
pub mod shutdown;
pub mod store;
