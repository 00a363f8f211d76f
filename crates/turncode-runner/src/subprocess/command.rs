//! Claude CLI argument construction.

use std::path::PathBuf;

use turncode_core::config::{ExecutorConfig, OutputFormat};

use crate::types::ExecutionRequest;

/// Process-wide CLI flags, taken from the executor configuration.
#[derive(Debug, Clone, Default)]
pub struct CliFlags {
    pub output_format: OutputFormat,
    pub skip_permissions: bool,
    pub debug: bool,
    /// Used unless the request names its own MCP configuration.
    pub mcp_config: Option<PathBuf>,
}

impl From<&ExecutorConfig> for CliFlags {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            output_format: config.output_format,
            skip_permissions: config.skip_permissions,
            debug: config.debug,
            mcp_config: config.mcp_config.clone(),
        }
    }
}

/// Arguments for one non-interactive turn.
///
/// The resume and MCP flags must come before `-p`; the CLI ignores them
/// otherwise.
pub fn build_args(request: &ExecutionRequest, resume: Option<&str>, flags: &CliFlags) -> Vec<String> {
    let mut args = Vec::with_capacity(14);

    if let Some(token) = resume {
        args.push("--resume".to_string());
        args.push(token.to_string());
    }
    if let Some(path) = request.options.mcp_config.as_ref().or(flags.mcp_config.as_ref()) {
        args.push("--mcp-config".to_string());
        args.push(path.display().to_string());
    }

    args.push("-p".to_string());
    args.push(request.prompt.clone());
    args.push("--output-format".to_string());
    args.push(flags.output_format.as_arg().to_string());
    // stream-json is rejected in print mode without it
    if flags.output_format == OutputFormat::StreamJson {
        args.push("--verbose".to_string());
    }

    let opts = &request.options;
    if let Some(ref text) = opts.system_prompt
        && !text.trim().is_empty()
    {
        args.push("--append-system-prompt".to_string());
        args.push(text.clone());
    }
    if !opts.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(opts.allowed_tools.join(","));
    }
    if !opts.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(opts.disallowed_tools.join(","));
    }
    if let Some(ref model) = opts.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(turns) = opts.max_turns {
        args.push("--max-turns".to_string());
        args.push(turns.to_string());
    }
    if flags.skip_permissions {
        args.push("--dangerously-skip-permissions".to_string());
    }
    if flags.debug {
        args.push("--debug".to_string());
    }

    args
}
