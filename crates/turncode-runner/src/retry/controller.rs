//! One logical execution: attempts, classification and backoff.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use turncode_core::Config;
use turncode_core::config::{ExecutorConfig, RetryConfig};
use uuid::Uuid;

use super::classify::interpret;
use super::policy::RetryPolicy;
use crate::error::ExecutionError;
use crate::subprocess::{
    CliFlags, ProcessExecutor, ProcessRequest, SubprocessError, build_args, load_env_file,
    resolver_from_config,
};
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionState};

/// Runs a request until it succeeds, fails permanently or is cancelled.
#[derive(Debug, Clone)]
pub struct RetryController {
    executor: ProcessExecutor,
    program: String,
    flags: CliFlags,
    default_timeout: Duration,
    policy: RetryPolicy,
    transient_exit_codes: Vec<i32>,
    /// Environment shared by every child; request variables win.
    base_env: BTreeMap<String, String>,
}

struct AttemptOutcome {
    /// Whether a process was actually started.
    spawned: bool,
    state: ExecutionState,
    result: ExecutionResult,
}

impl RetryController {
    pub fn new(executor: ProcessExecutor, executor_config: &ExecutorConfig, retry: &RetryConfig) -> Self {
        Self {
            executor,
            program: executor_config.program.clone(),
            flags: CliFlags::from(executor_config),
            default_timeout: Duration::from_secs(executor_config.default_timeout_secs),
            policy: RetryPolicy::from(retry),
            transient_exit_codes: retry.transient_exit_codes.clone(),
            base_env: BTreeMap::new(),
        }
    }

    /// Build the resolver and executor described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, SubprocessError> {
        let resolver = resolver_from_config(&config.executor.resolver)?;
        let executor = ProcessExecutor::new(
            resolver,
            Duration::from_secs(config.executor.terminate_grace_secs),
        );
        let base_env = match &config.executor.mcp_env_file {
            Some(path) => load_env_file(path)?,
            None => BTreeMap::new(),
        };
        Ok(Self::new(executor, &config.executor, &config.retry).with_env(base_env))
    }

    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `request`, resuming from `resume` when given.
    ///
    /// Retries only failures that are retryable and produced no session
    /// token. The returned result is the last attempt's, with a parse
    /// failure promoted to [`ExecutionError::PermanentParse`] once attempts
    /// run out.
    pub async fn attempt(
        &self,
        request: &ExecutionRequest,
        resume: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();
        let agent_id = &request.agent_id;
        let mut state = ExecutionState::Idle;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            state = advance(state, ExecutionState::Spawning, &execution_id);
            debug!(
                agent_id = %agent_id,
                execution_id = %execution_id,
                attempt,
                resume = ?resume,
                "Starting attempt"
            );

            let outcome = self
                .run_once(&execution_id, request, resume, attempt, cancel)
                .await;
            if outcome.spawned {
                state = advance(state, ExecutionState::Running, &execution_id);
            }
            state = advance(state, outcome.state, &execution_id);
            let result = outcome.result;

            let Some(err) = result.error.as_ref() else {
                info!(
                    agent_id = %agent_id,
                    execution_id = %execution_id,
                    attempt,
                    session_id = ?result.session_id,
                    "Execution succeeded"
                );
                return result;
            };

            let stop = if let Some(token) = err.committed_session() {
                Some(format!("attempt committed session {token}"))
            } else if !err.is_retryable() {
                Some("failure is not retryable".to_string())
            } else if attempt >= self.policy.max_attempts {
                Some("attempts exhausted".to_string())
            } else if cancel.is_cancelled() {
                Some("cancelled".to_string())
            } else {
                None
            };

            if let Some(reason) = stop {
                advance(state, ExecutionState::PermanentFailure, &execution_id);
                return self.finish_failed(&result, err, attempt, cancel, &reason);
            }

            state = advance(state, ExecutionState::Retrying, &execution_id);
            let delay = self.policy.delay_for(attempt);
            warn!(
                agent_id = %agent_id,
                execution_id = %execution_id,
                attempt,
                max_attempts = self.policy.max_attempts,
                error_kind = err.kind(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Attempt failed, retrying"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    advance(state, ExecutionState::PermanentFailure, &execution_id);
                    info!(agent_id = %agent_id, execution_id = %execution_id, "Cancelled during backoff");
                    return result.with_error(ExecutionError::Cancelled {
                        raw: err.raw().unwrap_or_default().to_string(),
                    });
                }
            }
        }
    }

    fn finish_failed(
        &self,
        result: &ExecutionResult,
        err: &ExecutionError,
        attempt: u32,
        cancel: &CancellationToken,
        stop_reason: &str,
    ) -> ExecutionResult {
        let final_result = match err {
            ExecutionError::Parse { reason, raw, .. } if attempt >= self.policy.max_attempts => {
                result.with_error(ExecutionError::PermanentParse {
                    attempts: attempt,
                    reason: reason.clone(),
                    raw: raw.clone(),
                })
            }
            _ if cancel.is_cancelled() && err.is_retryable() && err.committed_session().is_none() => {
                result.with_error(ExecutionError::Cancelled {
                    raw: err.raw().unwrap_or_default().to_string(),
                })
            }
            _ => result.clone(),
        };

        if let Some(final_err) = &final_result.error {
            if matches!(final_err, ExecutionError::Cancelled { .. }) {
                info!(
                    agent_id = %result.agent_id,
                    execution_id = %result.execution_id,
                    attempt,
                    "Execution cancelled"
                );
            } else {
                error!(
                    agent_id = %result.agent_id,
                    execution_id = %result.execution_id,
                    attempt,
                    error_kind = final_err.kind(),
                    error = %final_err,
                    stop_reason,
                    "Execution failed permanently"
                );
            }
        }
        final_result
    }

    async fn run_once(
        &self,
        execution_id: &str,
        request: &ExecutionRequest,
        resume: Option<&str>,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let mut env = self.base_env.clone();
        env.extend(request.options.env.clone());
        let process = ProcessRequest {
            program: self.program.clone(),
            args: build_args(request, resume, &self.flags),
            working_directory: request.working_directory.clone(),
            env,
            timeout: request.timeout_or(self.default_timeout),
        };

        let output = match self.executor.run(&process, cancel).await {
            Ok(output) => output,
            Err(e) => {
                let error = match e {
                    SubprocessError::WorkingDirectory { path } => ExecutionError::Validation {
                        message: format!("working directory {} does not exist", path.display()),
                    },
                    other => ExecutionError::Spawn {
                        program: self.program.clone(),
                        reason: other.to_string(),
                    },
                };
                return AttemptOutcome {
                    spawned: false,
                    state: ExecutionState::Failed,
                    result: ExecutionResult::failed(
                        execution_id,
                        request.agent_id.clone(),
                        attempt,
                        error,
                        Duration::ZERO,
                    ),
                };
            }
        };

        match interpret(&output, resume, &self.transient_exit_codes) {
            Ok(response) => AttemptOutcome {
                spawned: true,
                state: ExecutionState::Succeeded,
                result: ExecutionResult::succeeded(
                    execution_id,
                    request.agent_id.clone(),
                    attempt,
                    response,
                    output.duration,
                ),
            },
            Err(error) => AttemptOutcome {
                spawned: true,
                state: if matches!(error, ExecutionError::Timeout { .. }) {
                    ExecutionState::TimedOut
                } else {
                    ExecutionState::Failed
                },
                result: ExecutionResult::failed(
                    execution_id,
                    request.agent_id.clone(),
                    attempt,
                    error,
                    output.duration,
                ),
            },
        }
    }
}

fn advance(state: ExecutionState, next: ExecutionState, execution_id: &str) -> ExecutionState {
    match state.advance(next) {
        Ok(next) => {
            debug!(execution_id, from = ?state, to = ?next, "Execution state changed");
            next
        }
        Err(e) => {
            error!(execution_id, error = %e, "Execution state machine violated");
            next
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::subprocess::ExplicitPathResolver;

    /// A fake CLI whose behaviour is driven by a counter file in its cwd.
    fn fake_cli(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn controller(bin: &Path, max_attempts: u32) -> RetryController {
        let executor = ProcessExecutor::new(
            Arc::new(ExplicitPathResolver::new(bin).unwrap()),
            Duration::from_millis(500),
        );
        let exec_config = ExecutorConfig {
            skip_permissions: false,
            ..ExecutorConfig::default()
        };
        let retry = RetryConfig {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 20,
            jitter: false,
            ..RetryConfig::default()
        };
        RetryController::new(executor, &exec_config, &retry)
    }

    fn setup(body: &str) -> (TempDir, TempDir, std::path::PathBuf) {
        let bin_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let bin = fake_cli(bin_dir.path(), body);
        (bin_dir, work, bin)
    }

    const FLAKY: &str = r#"n=$(cat count 2>/dev/null || echo 0); n=$((n+1)); echo $n > count
if [ "$n" -eq 1 ]; then echo "garbled {output"; exit 0; fi
echo '{"type":"result","subtype":"success","is_error":false,"result":"ok","session_id":"s-'$n'"}'"#;

    #[tokio::test]
    async fn parse_failure_is_retried_with_same_execution_id() {
        let (_b, work, bin) = setup(FLAKY);
        let req = ExecutionRequest::new("a", "hi", work.path());
        let res = controller(&bin, 2)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert!(res.success, "{res:?}");
        assert_eq!(res.attempt, 2);
        assert_eq!(res.session_id.as_deref(), Some("s-2"));
    }

    #[tokio::test]
    async fn exhausted_parse_failure_becomes_permanent() {
        let (_b, work, bin) = setup("echo 'still not json'");
        let req = ExecutionRequest::new("a", "hi", work.path());
        let res = controller(&bin, 3)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert!(!res.success);
        assert_eq!(res.attempt, 3);
        match res.error {
            Some(ExecutionError::PermanentParse { attempts, ref raw, .. }) => {
                assert_eq!(attempts, 3);
                assert!(raw.contains("still not json"));
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn committed_failure_is_not_retried() {
        let body = r#"n=$(cat count 2>/dev/null || echo 0); echo $((n+1)) > count
echo '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"tool crashed","session_id":"s-x"}'
exit 1"#;
        let (_b, work, bin) = setup(body);
        let req = ExecutionRequest::new("a", "hi", work.path());
        let res = controller(&bin, 3)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert_eq!(res.attempt, 1);
        assert!(res.session_id.is_none());
        assert!(matches!(res.error, Some(ExecutionError::Reported { .. })));
        let runs = std::fs::read_to_string(work.path().join("count")).unwrap();
        assert_eq!(runs.trim(), "1");
    }

    fn runs(work: &Path) -> String {
        std::fs::read_to_string(work.join("count"))
            .unwrap()
            .trim()
            .to_string()
    }

    const INIT_THEN: &str = r#"n=$(cat count 2>/dev/null || echo 0); echo $((n+1)) > count
echo '{"type":"system","subtype":"init","session_id":"sess-'$((n+1))'"}'
echo '{"type":"assistant","message":{}}'"#;

    #[tokio::test]
    async fn truncated_stream_after_init_is_not_retried() {
        let (_b, work, bin) = setup(INIT_THEN);
        let req = ExecutionRequest::new("a", "hi", work.path());
        let res = controller(&bin, 3)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert_eq!(res.attempt, 1);
        assert_eq!(runs(work.path()), "1");
        match res.error {
            Some(ref err @ ExecutionError::Parse { .. }) => {
                assert_eq!(err.committed_session(), Some("sess-1"));
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_after_init_is_not_retried() {
        let body = format!("{INIT_THEN}\necho 'API Error: 429 rate limit' >&2\nexit 1");
        let (_b, work, bin) = setup(&body);
        let req = ExecutionRequest::new("a", "hi", work.path());
        let res = controller(&bin, 3)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert_eq!(res.attempt, 1);
        assert_eq!(runs(work.path()), "1");
        assert!(matches!(res.error, Some(ExecutionError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn rate_limit_without_token_is_retried() {
        let body = r#"n=$(cat count 2>/dev/null || echo 0); n=$((n+1)); echo $n > count
if [ "$n" -eq 1 ]; then echo 'API Error: 429 Too Many Requests' >&2; exit 1; fi
echo '{"type":"result","result":"ok","session_id":"s-'$n'"}'"#;
        let (_b, work, bin) = setup(body);
        let req = ExecutionRequest::new("a", "hi", work.path());
        let res = controller(&bin, 3)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert!(res.success, "{res:?}");
        assert_eq!(res.attempt, 2);
        assert_eq!(runs(work.path()), "2");
        assert_eq!(res.session_id.as_deref(), Some("s-2"));
    }

    #[tokio::test]
    async fn timeout_without_token_is_retried() {
        let body = r#"n=$(cat count 2>/dev/null || echo 0); n=$((n+1)); echo $n > count
if [ "$n" -eq 1 ]; then sleep 30; fi
echo '{"type":"result","result":"ok","session_id":"s-'$n'"}'"#;
        let (_b, work, bin) = setup(body);
        let req =
            ExecutionRequest::new("a", "hi", work.path()).with_timeout(Duration::from_millis(500));
        let res = controller(&bin, 2)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert!(res.success, "{res:?}");
        assert_eq!(res.attempt, 2);
        assert_eq!(runs(work.path()), "2");
        assert_eq!(res.session_id.as_deref(), Some("s-2"));
    }

    #[tokio::test]
    async fn env_file_and_mcp_config_reach_the_cli() {
        let body = r#"echo "$@" > args
echo "$MCP_TOKEN $SHARED" > env
echo '{"type":"result","result":"ok","session_id":"s"}'"#;
        let (bin_dir, work, bin) = setup(body);
        let env_file = bin_dir.path().join(".env.mcp");
        std::fs::write(&env_file, "MCP_TOKEN=\"secret\"\nSHARED=file\n").unwrap();
        let mcp = bin_dir.path().join("mcp.json");

        let mut config = Config::default();
        config.executor.resolver = turncode_core::config::ResolverConfig::ExplicitPath {
            path: bin.clone(),
        };
        config.executor.skip_permissions = false;
        config.executor.mcp_config = Some(mcp.clone());
        config.executor.mcp_env_file = Some(env_file);

        let mut req = ExecutionRequest::new("a", "hi", work.path());
        req.options.env.insert("SHARED".into(), "request".into());
        let res = RetryController::from_config(&config)
            .unwrap()
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert!(res.success, "{res:?}");

        let args = std::fs::read_to_string(work.path().join("args")).unwrap();
        assert!(
            args.starts_with(&format!("--mcp-config {} -p hi", mcp.display())),
            "{args}"
        );
        let env = std::fs::read_to_string(work.path().join("env")).unwrap();
        assert_eq!(env.trim(), "secret request");
    }

    #[test]
    fn missing_env_file_fails_construction() {
        let mut config = Config::default();
        config.executor.resolver = turncode_core::config::ResolverConfig::Direct;
        config.executor.mcp_env_file = Some("/no/such/.env.mcp".into());
        assert!(matches!(
            RetryController::from_config(&config),
            Err(SubprocessError::EnvFile { .. })
        ));
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let (_b, work, bin) = setup("echo 'Invalid API key' >&2; exit 1");
        let req = ExecutionRequest::new("a", "hi", work.path());
        let res = controller(&bin, 3)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert_eq!(res.attempt, 1);
        assert!(matches!(res.error, Some(ExecutionError::Auth { .. })));
    }

    #[tokio::test]
    async fn resume_token_reaches_the_cli() {
        let body = r#"echo "$@" > args
echo '{"type":"result","result":"ok","session_id":"next"}'"#;
        let (_b, work, bin) = setup(body);
        let req = ExecutionRequest::new("a", "second turn", work.path());
        let res = controller(&bin, 1)
            .attempt(&req, Some("prev"), &CancellationToken::new())
            .await;
        assert!(res.success);
        let args = std::fs::read_to_string(work.path().join("args")).unwrap();
        assert!(args.starts_with("--resume prev -p second turn"), "{args}");
    }

    #[tokio::test]
    async fn missing_working_directory_fails_without_retry() {
        let (_b, _work, bin) = setup("true");
        let req = ExecutionRequest::new("a", "hi", "/no/such/dir");
        let res = controller(&bin, 3)
            .attempt(&req, None, &CancellationToken::new())
            .await;
        assert_eq!(res.attempt, 1);
        assert!(matches!(res.error, Some(ExecutionError::Validation { .. })));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let (_b, work, bin) = setup("sleep 30");
        let req = ExecutionRequest::new("a", "hi", work.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let res = controller(&bin, 3).attempt(&req, None, &cancel).await;
        assert_eq!(res.attempt, 1);
        assert!(matches!(res.error, Some(ExecutionError::Cancelled { .. })));
    }
}
