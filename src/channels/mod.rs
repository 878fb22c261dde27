pub mod directory;
pub mod messenger;
pub mod resolver;
pub mod sender;
pub mod service;
pub mod types;

pub use service::{IngestOutcome, RelayCollaborators, RelayHub};
