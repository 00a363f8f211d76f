//! Output parser for Claude Code `json` and `stream-json` output.
//!
//! Raw process output is first reduced to JSON ([`parse`]), tolerating banner
//! and log text emitted by shell initialization, and then read into a
//! canonical [`AgentResponse`] using a tolerant reader: unknown fields are
//! ignored and a handful of alternative field names are accepted.

mod parser;
mod response;
mod types;

pub use parser::parse;
pub use types::*;
