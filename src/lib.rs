//! Ephemeral Terraform workspaces: upload a project, fill in its variables,
//! and run provisioning commands with live output.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux.");

pub mod config;
pub mod deleter;
pub mod error;
pub mod http_server;
pub mod orchestrator;
pub mod reaper;
pub mod sanitize;
pub mod state;
pub mod variables;
pub mod workspace;

pub use error::{Result, WorkspaceError};
pub use state::{AppState, SessionToken};
pub use workspace::Workspaces;
