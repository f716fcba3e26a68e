//! Print queue relay: pulls documents from a remote print queue, spools them
//! on a local printer and follows each job through the OS spooler until it is
//! printed or deleted, reporting completions back to the queue.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod remote;
pub mod sentry_init;
pub mod spooler;
pub mod status;
pub mod watcher;

pub use errors::{DaemonError, Result};
pub use events::{EventBus, QueueEvent, QueueState};
pub use orchestrator::{ControlResponse, QueueOrchestrator};
