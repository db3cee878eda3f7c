// Public API for the binary and integration tests

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod persist;
pub mod presenter;
pub mod protocol;
pub mod session;
pub mod state;
pub mod stimulus;
pub mod transport;
pub mod types;
pub mod ws;
