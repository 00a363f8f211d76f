//! Turning a program name into a spawnable invocation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use turncode_core::config::ResolverConfig;

use super::SubprocessError;

/// Shell used when neither the configuration nor `$SHELL` names one.
const FALLBACK_SHELL: &str = "/bin/bash";

/// Concrete program and arguments handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Strategy for locating and invoking the CLI.
pub trait CommandResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, program: &str, args: &[String]) -> Result<Invocation, SubprocessError>;
}

/// Exec `program` directly; the OS searches `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectResolver;

impl CommandResolver for DirectResolver {
    fn resolve(&self, program: &str, args: &[String]) -> Result<Invocation, SubprocessError> {
        Ok(Invocation {
            program: PathBuf::from(program),
            args: args.to_vec(),
        })
    }
}

/// Exec a fixed binary, ignoring the configured program name.
#[derive(Debug, Clone)]
pub struct ExplicitPathResolver {
    path: PathBuf,
}

impl ExplicitPathResolver {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SubprocessError> {
        let path = path.into();
        if !path.is_file() {
            return Err(SubprocessError::Resolve {
                reason: format!("executable {} does not exist", path.display()),
            });
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommandResolver for ExplicitPathResolver {
    fn resolve(&self, _program: &str, args: &[String]) -> Result<Invocation, SubprocessError> {
        Ok(Invocation {
            program: self.path.clone(),
            args: args.to_vec(),
        })
    }
}

/// Run the command line through `<shell> -ic` so aliases, functions and
/// `PATH` edits from interactive shell init apply, as when typed by hand.
#[derive(Debug, Clone)]
pub struct InteractiveShellResolver {
    shell: PathBuf,
}

impl InteractiveShellResolver {
    pub fn new(shell: impl Into<PathBuf>) -> Result<Self, SubprocessError> {
        let shell = shell.into();
        if !shell.is_file() {
            return Err(SubprocessError::Resolve {
                reason: format!("shell {} does not exist", shell.display()),
            });
        }
        Ok(Self { shell })
    }

    /// Use `$SHELL`, falling back to `/bin/bash`.
    pub fn from_env() -> Result<Self, SubprocessError> {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_SHELL.to_string());
        Self::new(shell)
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }
}

impl CommandResolver for InteractiveShellResolver {
    fn resolve(&self, program: &str, args: &[String]) -> Result<Invocation, SubprocessError> {
        let words = std::iter::once(program).chain(args.iter().map(String::as_str));
        let line = shlex::try_join(words).map_err(|e| SubprocessError::Resolve {
            reason: format!("cannot quote command line: {e}"),
        })?;
        debug!(shell = %self.shell.display(), "Wrapping command in interactive shell");
        Ok(Invocation {
            program: self.shell.clone(),
            args: vec!["-ic".to_string(), line],
        })
    }
}

/// Build the resolver selected by configuration.
pub fn resolver_from_config(
    config: &ResolverConfig,
) -> Result<Arc<dyn CommandResolver>, SubprocessError> {
    Ok(match config {
        ResolverConfig::Direct => Arc::new(DirectResolver),
        ResolverConfig::ExplicitPath { path } => Arc::new(ExplicitPathResolver::new(path)?),
        ResolverConfig::InteractiveShell { shell: Some(shell) } => {
            Arc::new(InteractiveShellResolver::new(shell)?)
        }
        ResolverConfig::InteractiveShell { shell: None } => {
            Arc::new(InteractiveShellResolver::from_env()?)
        }
    })
}
