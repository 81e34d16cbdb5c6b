pub mod backlog;
pub mod cascade;
pub mod clock;
pub mod config;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod progress;
pub mod prompt;
pub mod queue;

pub use error::{NightwatchError, Result};
