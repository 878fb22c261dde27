// Library entrypoint for the binary and integration tests.
mod api;
pub mod channels;
mod core;
pub mod services;
pub mod storage;

pub use api::build_router;
pub use channels::{IngestOutcome, RelayCollaborators, RelayHub};
pub use core::{clock, config, config_store, error, scheduler, shutdown, state};
