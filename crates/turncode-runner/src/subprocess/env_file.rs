//! `KEY=VALUE` environment files.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use super::SubprocessError;

/// Read an environment file.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is
/// accepted and one pair of surrounding quotes is removed from the value.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, SubprocessError> {
    let text = std::fs::read_to_string(path).map_err(|e| SubprocessError::EnvFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let vars = parse_env(&text);
    info!(path = %path.display(), count = vars.len(), "Loaded environment file");
    Ok(vars)
}

pub fn parse_env(text: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            debug!(line = idx + 1, "Ignoring environment line without '='");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    vars
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2
            && let Some(inner) = value
                .strip_prefix(quote)
                .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
