//! Database initialization and shared helpers

pub mod init;
pub mod retry;

pub use init::{connect_in_memory, init_database};
pub use retry::retry_on_lock;
