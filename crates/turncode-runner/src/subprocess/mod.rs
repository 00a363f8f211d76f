//! Claude CLI process execution.
//!
//! One child process per attempt: resolve the command, spawn it in its own
//! process group, capture both streams in full and reap it on every path.

mod command;
mod env_file;
mod executor;
mod resolver;

pub use command::{CliFlags, build_args};
pub use env_file::{load_env_file, parse_env};
pub use executor::{ProcessExecutor, ProcessOutput, ProcessRequest, Termination};
pub use resolver::{
    CommandResolver, DirectResolver, ExplicitPathResolver, InteractiveShellResolver, Invocation,
    resolver_from_config,
};

use std::path::PathBuf;

/// Errors from subprocess operations.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to resolve command: {reason}")]
    Resolve { reason: String },

    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Working directory {} does not exist", .path.display())]
    WorkingDirectory { path: PathBuf },

    #[error("Failed waiting for process {pid:?}: {reason}")]
    Wait { pid: Option<u32>, reason: String },

    #[error("Failed to read environment file {}: {reason}", .path.display())]
    EnvFile { path: PathBuf, reason: String },
}
