//! Recovery of JSON from noisy process output.
//!
//! Interactive shells print banners, job-control warnings and profile noise
//! around the CLI's own output, so the parser never assumes the text starts
//! with JSON. It does not repair malformed JSON either: a candidate either
//! parses as written or is rejected.

use serde_json::Value;
use tracing::debug;

use super::types::{NdjsonSequence, ParseError, ParsedOutput, SkippedLine};

/// Minimum number of independently parseable lines for output to be read as
/// newline-delimited records.
const MIN_STREAM_RECORDS: usize = 2;

/// Parse raw process output.
///
/// Streaming output (several JSON lines) is read record by record; anything
/// else is reduced to the first balanced JSON object or array in the text.
pub fn parse(raw: &str) -> Result<ParsedOutput, ParseError> {
    if let Some(seq) = parse_ndjson(raw) {
        return Ok(ParsedOutput::Stream(seq));
    }
    extract_first_json(raw).map(ParsedOutput::Single)
}

/// Read `raw` as newline-delimited JSON.
///
/// Returns `None` unless at least [`MIN_STREAM_RECORDS`] lines parse on their
/// own, so a pretty-printed single object is never mistaken for a stream.
fn parse_ndjson(raw: &str) -> Option<NdjsonSequence> {
    let mut seq = NdjsonSequence::default();

    for (idx, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str::<Value>(trimmed).map_err(|e| e.to_string())
        } else {
            Err("not a JSON record".to_string())
        };
        match parsed {
            Ok(value) => seq.records.push(value),
            Err(error) => seq.skipped.push(SkippedLine {
                line_number: idx + 1,
                text: line.to_string(),
                error,
            }),
        }
    }

    if seq.records.len() < MIN_STREAM_RECORDS {
        return None;
    }
    for skipped in &seq.skipped {
        debug!(line = skipped.line_number, error = %skipped.error, "Skipped non-JSON output line");
    }
    Some(seq)
}

/// Find and parse the first balanced JSON object or array.
///
/// Candidates are tried left to right. A candidate that balances but does not
/// parse is skipped as a whole, so nothing nested inside malformed JSON is
/// ever returned in its place. A bracket that never closes (a progress bar,
/// a truncated banner) only skips that one bracket.
fn extract_first_json(raw: &str) -> Result<Value, ParseError> {
    let bytes = raw.as_bytes();
    let mut cursor = 0;
    let mut last_error: Option<String> = None;

    while let Some(offset) = bytes[cursor..]
        .iter()
        .position(|&b| b == b'{' || b == b'[')
    {
        let start = cursor + offset;
        let Some(end) = balanced_end(bytes, start) else {
            debug!(start, "Unbalanced bracket, scanning past it");
            last_error = Some(format!("unbalanced JSON starting at byte {start}"));
            cursor = start + 1;
            continue;
        };

        match serde_json::from_str::<Value>(&raw[start..end]) {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(start, end, error = %e, "Balanced candidate is not valid JSON");
                last_error = Some(format!("invalid JSON at byte {start}: {e}"));
                cursor = end;
            }
        }
    }

    Err(ParseError::new(
        raw,
        last_error.unwrap_or_else(|| "no JSON object or array found".to_string()),
    ))
}

/// Byte index one past the bracket closing the one opened at `start`.
///
/// Brackets inside string literals are ignored; a closer of the wrong kind
/// means the opener never balances. All structural characters are ASCII, so
/// the returned index is always a valid `str` boundary.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut open: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => open.push(b'}'),
            b'[' => open.push(b']'),
            b'}' | b']' => {
                if open.pop()? != b {
                    return None;
                }
                if open.is_empty() {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}
