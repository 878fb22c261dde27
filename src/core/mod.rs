pub mod clock;
pub mod config;
pub mod config_store;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod state;
