// Clippy allows for reasonable defaults
#![allow(clippy::too_many_arguments)] // Session and monitor constructors carry injected deps
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types

// Module declarations
pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod git;
pub mod lifecycle;
pub mod models;
pub mod monitor;
pub mod queue;
pub mod run;
pub mod session;
pub mod storage;
pub mod utils;

// Re-export the surface most callers need
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use lifecycle::TeamManager;
pub use models::*;
