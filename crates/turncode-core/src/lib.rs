//! `turncode` Core Library
//!
//! Shared, I/O-free functionality for `turncode` components:
//! - Output parsing for Claude Code `json` / `stream-json` output
//! - Response model extracted from parsed output
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod output;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use output::{AgentResponse, ParseError, ParsedOutput, parse};
