//! Mapping a finished process to a response or a typed failure.

use std::sync::LazyLock;

use regex::Regex;
use turncode_core::{AgentResponse, Error as CoreError, ParsedOutput, parse};

use crate::error::ExecutionError;
use crate::subprocess::{ProcessOutput, Termination};

#[allow(clippy::expect_used)]
static SESSION_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no conversation found with session id|not a valid uuid|session .{0,80} not found")
        .expect("static regex is valid")
});

#[allow(clippy::expect_used)]
static AUTH_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)invalid api key|authentication_error|authentication failed|please run /login|not logged in|oauth token has expired",
    )
    .expect("static regex is valid")
});

#[allow(clippy::expect_used)]
static RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|too many requests|overloaded|usage limit reached|\b429\b")
        .expect("static regex is valid")
});

#[allow(clippy::expect_used)]
static INVALID_USAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)unknown option|unexpected argument|invalid value for|missing required argument|error: option .{0,40} argument missing",
    )
    .expect("static regex is valid")
});

/// Failure recognized from the CLI's own wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    SessionNotFound,
    Auth,
    RateLimit,
    InvalidUsage,
}

/// Most specific signal found in `text`, if any.
pub fn detect(text: &str) -> Option<Signal> {
    if SESSION_NOT_FOUND.is_match(text) {
        Some(Signal::SessionNotFound)
    } else if AUTH_FAILURE.is_match(text) {
        Some(Signal::Auth)
    } else if RATE_LIMIT.is_match(text) {
        Some(Signal::RateLimit)
    } else if INVALID_USAGE.is_match(text) {
        Some(Signal::InvalidUsage)
    } else {
        None
    }
}

fn signal_error(
    signal: Signal,
    resume: Option<&str>,
    session_id: Option<String>,
    raw: String,
) -> ExecutionError {
    match signal {
        Signal::SessionNotFound => ExecutionError::SessionNotFound {
            token: resume.unwrap_or_default().to_string(),
            raw,
        },
        Signal::Auth => ExecutionError::Auth { raw },
        Signal::RateLimit => ExecutionError::RateLimited { session_id, raw },
        Signal::InvalidUsage => ExecutionError::InvalidUsage { raw },
    }
}

/// Decide what one attempt produced.
///
/// A structured result record on stdout is trusted over the exit status.
/// Without one, recognized wording on either stream decides, then the exit
/// code. `transient_exit_codes` lists non-zero codes worth retrying.
///
/// Every failure derived from output keeps the session id the CLI announced
/// before things went wrong, so the attempt counts as committed.
pub fn interpret(
    output: &ProcessOutput,
    resume: Option<&str>,
    transient_exit_codes: &[i32],
) -> Result<AgentResponse, ExecutionError> {
    let raw = output.combined();
    let parsed = parse(&output.stdout);
    let announced = parsed.as_ref().ok().and_then(ParsedOutput::session_id);

    match output.termination {
        Termination::Exited => {}
        Termination::TimedOut => {
            return Err(ExecutionError::Timeout {
                elapsed_ms: u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX),
                session_id: announced,
                raw,
            });
        }
        Termination::Cancelled => return Err(ExecutionError::Cancelled { raw }),
    }

    let response = parsed
        .map_err(CoreError::from)
        .and_then(|p| AgentResponse::from_parsed(&p));

    match response {
        Ok(resp) if resp.is_error => Err(reported(resp, resume, announced, raw)),
        Ok(resp) if resp.session_id.is_none() => Err(ExecutionError::Protocol {
            reason: "result record carries no session id".to_string(),
            raw,
        }),
        Ok(resp) => Ok(resp),
        Err(err) => {
            if let Some(signal) = detect(&raw) {
                return Err(signal_error(signal, resume, announced, raw));
            }
            match output.exit_code {
                Some(0) => Err(match err {
                    CoreError::Protocol(reason) => ExecutionError::Protocol { reason, raw },
                    other => ExecutionError::Parse {
                        reason: other.to_string(),
                        session_id: announced,
                        raw,
                    },
                }),
                Some(code) if transient_exit_codes.contains(&code) => {
                    Err(ExecutionError::TransientExit {
                        code,
                        session_id: announced,
                        raw,
                    })
                }
                code => Err(ExecutionError::UnknownExit { code, raw }),
            }
        }
    }
}

/// An `is_error` result. Keeps its token so the turn counts as committed;
/// without one, recognized wording may still make it retryable.
fn reported(
    resp: AgentResponse,
    resume: Option<&str>,
    announced: Option<String>,
    raw: String,
) -> ExecutionError {
    if resp.session_id.is_none()
        && let Some(signal) = detect(&resp.result)
    {
        return signal_error(signal, resume, announced, raw);
    }
    ExecutionError::Reported {
        subtype: resp.subtype.as_str().to_string(),
        message: resp.result,
        session_id: resp.session_id,
        raw,
    }
}
