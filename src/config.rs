//! Server configuration, read from flags or the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::deleter::RetryPolicy;
use crate::orchestrator::Toolchain;

/// Options for `serve`. Every flag can also be set through its env var.
#[derive(Debug, Clone, Args)]
pub struct ServeConfig {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: SocketAddr,

    /// Directory holding one subdirectory per session
    #[arg(long, env = "UPLOAD_FOLDER", default_value = "sessions")]
    pub upload_folder: PathBuf,

    /// Seconds between inactivity scans
    #[arg(long, env = "CLEANUP_INTERVAL", default_value_t = 30)]
    pub cleanup_interval: u64,

    /// Seconds of inactivity after which a workspace is deleted
    #[arg(long, env = "INACTIVITY_TIMEOUT", default_value_t = 600)]
    pub inactivity_timeout: u64,

    /// Maximum request body size in bytes
    #[arg(long, env = "MAX_CONTENT_LENGTH", default_value_t = 16 * 1024 * 1024)]
    pub max_content_length: usize,

    /// Provisioning binary to invoke
    #[arg(long, env = "TERRAFORM_BIN", default_value = "terraform")]
    pub terraform_bin: String,

    /// Delete attempts before falling back to `rm -rf`
    #[arg(long, env = "DELETE_RETRIES", default_value_t = 5)]
    pub delete_retries: u32,

    /// Base backoff between delete attempts in milliseconds
    #[arg(long, env = "DELETE_BACKOFF_MS", default_value_t = 1000)]
    pub delete_backoff_ms: u64,
}

impl ServeConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.delete_retries,
            Duration::from_millis(self.delete_backoff_ms),
        )
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain::new(self.terraform_bin.clone())
    }
}
