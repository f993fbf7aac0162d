use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::engine::Engine;
use crate::core::error::{CoreError, Result};

/// Combined stdout+stderr is capped at this many bytes.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;
const TRUNCATION_SUFFIX: &str = "\n... (output truncated)";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    Pre,
    Post,
}

/// A shell command to run inside a workload's container around a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub hook_type: HookType,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_command: Option<String>,
    #[serde(default)]
    pub template_vars: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub fail_on_error: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Success,
    Failed { exit_code: i64 },
    TimedOut,
    ContainerMissing,
}

#[derive(Debug, Clone)]
pub struct HookExecution {
    pub hook_type: HookType,
    pub container_name: String,
    pub command: String,
    pub output: String,
    pub exit_code: i64,
    pub outcome: HookOutcome,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl HookExecution {
    pub fn succeeded(&self) -> bool {
        self.outcome == HookOutcome::Success
    }
}

/// Known command templates, substitutable with `${VAR}` / `${VAR:-default}`.
fn template_command(name: &str) -> Option<&'static str> {
    match name {
        "postgres-dump" => {
            Some("pg_dump -U ${PG_USER:-postgres} ${PG_DATABASE:-postgres} -f ${DUMP_PATH:-/tmp/pre-backup.sql}")
        }
        "mysql-dump" => Some(
            "mysqldump -u ${MYSQL_USER:-root} --password=${MYSQL_PASSWORD:-} ${MYSQL_DATABASE:-mysql} --result-file=${DUMP_PATH:-/tmp/pre-backup.sql}",
        ),
        "redis-save" => Some("redis-cli SAVE"),
        "sqlite-checkpoint" => {
            Some("sqlite3 ${DB_PATH:-/data/db.sqlite} 'PRAGMA wal_checkpoint(TRUNCATE);'")
        }
        "fs-sync" => Some("sync"),
        _ => None,
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` occurrences from `vars`.
/// Unknown variables without a default become empty.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &after[..end];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(default.unwrap_or("")),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn truncate_output(raw: &str) -> String {
    if raw.len() <= MAX_OUTPUT_BYTES {
        return raw.to_string();
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = raw[..cut].to_string();
    out.push_str(TRUNCATION_SUFFIX);
    out
}

pub struct HookExecutor {
    engine: Arc<dyn Engine>,
}

impl HookExecutor {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    fn resolve_command(hook: &Hook) -> Result<String> {
        let resolved = match hook.template.as_deref() {
            Some(name) => match template_command(name) {
                Some(template) => substitute(template, &hook.template_vars),
                None => hook.custom_command.clone().unwrap_or_default(),
            },
            None => hook.custom_command.clone().unwrap_or_default(),
        };
        if resolved.trim().is_empty() {
            return Err(CoreError::NoCommand);
        }
        Ok(resolved)
    }

    /// Run one hook inside its container. Failures are captured in the
    /// returned execution; only engine-level faults bubble up as `Err`.
    pub async fn run(&self, hook: &Hook, backup_id: Uuid) -> Result<HookExecution> {
        let command = Self::resolve_command(hook)?;
        let started_at = chrono::Utc::now();
        let timeout = Duration::from_secs(hook.timeout_seconds.max(1));
        let cancel = CancellationToken::new();
        let argv = vec!["sh".to_string(), "-c".to_string(), command.clone()];

        info!(
            backup_id = %backup_id,
            container = %hook.container_name,
            command = %command,
            "running hook"
        );

        let result = tokio::time::timeout(
            timeout,
            self.engine.exec(
                &hook.container_name,
                &argv,
                hook.working_dir.as_deref(),
                hook.user.as_deref(),
                &cancel,
            ),
        )
        .await;

        let (output, exit_code, outcome) = match result {
            Err(_elapsed) => {
                // Kill the in-flight exec; it may be wedged inside the container.
                cancel.cancel();
                (String::new(), -1, HookOutcome::TimedOut)
            }
            Ok(Err(CoreError::ContainerNotFound(_))) => {
                (String::new(), -1, HookOutcome::ContainerMissing)
            }
            Ok(Err(err)) => return Err(err),
            Ok(Ok(out)) => {
                let combined = truncate_output(&out.combined());
                if out.combined().contains("No such container") {
                    (combined, out.exit_code, HookOutcome::ContainerMissing)
                } else if out.exit_code != 0 {
                    let code = out.exit_code;
                    (combined, code, HookOutcome::Failed { exit_code: code })
                } else {
                    (combined, 0, HookOutcome::Success)
                }
            }
        };

        Ok(HookExecution {
            hook_type: hook.hook_type,
            container_name: hook.container_name.clone(),
            command,
            output,
            exit_code,
            outcome,
            started_at,
            finished_at: chrono::Utc::now(),
        })
    }

    /// Run every enabled hook of one type in list order. On the first failure
    /// of a `fail_on_error` hook the batch stops; executions up to and
    /// including the failing one are still returned.
    pub async fn run_all(
        &self,
        hooks: &[Hook],
        hook_type: HookType,
        backup_id: Uuid,
    ) -> (Vec<HookExecution>, Result<()>) {
        let mut executions = Vec::new();
        for hook in hooks {
            if !hook.enabled || hook.hook_type != hook_type {
                continue;
            }
            match self.run(hook, backup_id).await {
                Ok(execution) => {
                    let failed = !execution.succeeded();
                    if failed {
                        warn!(
                            container = %execution.container_name,
                            exit_code = execution.exit_code,
                            "hook failed"
                        );
                    }
                    let error = failure_error(hook, &execution);
                    executions.push(execution);
                    if failed && hook.fail_on_error {
                        return (executions, Err(error.expect("failed execution")));
                    }
                }
                Err(err) => {
                    if hook.fail_on_error {
                        return (executions, Err(err));
                    }
                    warn!(container = %hook.container_name, error = %err, "hook errored, continuing");
                }
            }
        }
        (executions, Ok(()))
    }
}

fn failure_error(hook: &Hook, execution: &HookExecution) -> Option<CoreError> {
    match &execution.outcome {
        HookOutcome::Success => None,
        HookOutcome::Failed { exit_code } => Some(CoreError::HookFailed {
            exit_code: *exit_code,
        }),
        HookOutcome::TimedOut => Some(CoreError::HookTimeout(Duration::from_secs(
            hook.timeout_seconds,
        ))),
        HookOutcome::ContainerMissing => {
            Some(CoreError::ContainerNotFound(hook.container_name.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::ExecOutput;
    use crate::core::testing::FakeEngine;

    fn hook(container: &str, command: &str) -> Hook {
        Hook {
            hook_type: HookType::Pre,
            container_name: container.into(),
            template: None,
            custom_command: Some(command.into()),
            template_vars: HashMap::new(),
            timeout_seconds: 5,
            working_dir: None,
            user: None,
            fail_on_error: false,
            enabled: true,
        }
    }

    #[test]
    fn substitution_handles_plain_default_and_missing() {
        let vars = HashMap::from([("USER".to_string(), "app".to_string())]);
        assert_eq!(substitute("run ${USER}", &vars), "run app");
        assert_eq!(substitute("run ${MISSING:-fallback}", &vars), "run fallback");
        assert_eq!(substitute("run ${MISSING}", &vars), "run ");
        assert_eq!(
            substitute("${USER}:${USER:-other}", &vars),
            "app:app"
        );
    }

    #[test]
    fn unterminated_substitution_is_left_alone() {
        let vars = HashMap::new();
        assert_eq!(substitute("echo ${OOPS", &vars), "echo ${OOPS");
    }

    #[test]
    fn output_truncates_at_exactly_the_cap() {
        let exact = "a".repeat(MAX_OUTPUT_BYTES);
        assert_eq!(truncate_output(&exact), exact);

        let over = "a".repeat(MAX_OUTPUT_BYTES + 100);
        let truncated = truncate_output(&over);
        assert_eq!(
            truncated.len(),
            MAX_OUTPUT_BYTES + TRUNCATION_SUFFIX.len()
        );
        assert!(truncated.ends_with("\n... (output truncated)"));
    }

    #[test]
    fn template_resolution_prefers_known_template() {
        let mut h = hook("db", "ignored");
        h.template = Some("fs-sync".into());
        assert_eq!(HookExecutor::resolve_command(&h).unwrap(), "sync");

        h.template = Some("no-such-template".into());
        assert_eq!(HookExecutor::resolve_command(&h).unwrap(), "ignored");

        h.custom_command = None;
        assert!(matches!(
            HookExecutor::resolve_command(&h).unwrap_err(),
            CoreError::NoCommand
        ));
    }

    #[tokio::test]
    async fn successful_hook_captures_output() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.containers.push(FakeEngine::container("db", "postgres:16", "running"));
            state.exec_results.push_back(ExecOutput {
                stdout: "dumped".into(),
                stderr: String::new(),
                exit_code: 0,
            });
        }));
        let executor = HookExecutor::new(engine);
        let execution = executor
            .run(&hook("db", "pg_dump"), Uuid::new_v4())
            .await
            .unwrap();
        assert!(execution.succeeded());
        assert_eq!(execution.output, "dumped");
        assert_eq!(execution.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_failed() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.containers.push(FakeEngine::container("db", "postgres:16", "running"));
            state.exec_results.push_back(ExecOutput {
                stdout: String::new(),
                stderr: "boom".into(),
                exit_code: 3,
            });
        }));
        let executor = HookExecutor::new(engine);
        let execution = executor
            .run(&hook("db", "false"), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(execution.outcome, HookOutcome::Failed { exit_code: 3 });
        assert_eq!(execution.output, "boom");
    }

    #[tokio::test]
    async fn missing_container_is_reported() {
        let engine = Arc::new(FakeEngine::new());
        let executor = HookExecutor::new(engine);
        let execution = executor
            .run(&hook("ghost", "true"), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(execution.outcome, HookOutcome::ContainerMissing);
        assert_eq!(execution.exit_code, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_hook_times_out() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.containers.push(FakeEngine::container("db", "postgres:16", "running"));
            state.exec_delay_ms = 30_000;
        }));
        let executor = HookExecutor::new(engine);
        let mut h = hook("db", "sleep 600");
        h.timeout_seconds = 2;
        let execution = executor.run(&h, Uuid::new_v4()).await.unwrap();
        assert_eq!(execution.outcome, HookOutcome::TimedOut);
        assert_eq!(execution.exit_code, -1);
    }

    #[tokio::test]
    async fn run_all_skips_disabled_and_wrong_type() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.containers.push(FakeEngine::container("db", "postgres:16", "running"));
        }));
        let executor = HookExecutor::new(engine.clone());

        let mut disabled = hook("db", "true");
        disabled.enabled = false;
        let mut post = hook("db", "true");
        post.hook_type = HookType::Post;
        let active = hook("db", "true");

        let (executions, result) = executor
            .run_all(&[disabled, post, active], HookType::Pre, Uuid::new_v4())
            .await;
        assert!(result.is_ok());
        assert_eq!(executions.len(), 1);
        let exec_calls = engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("exec"))
            .count();
        assert_eq!(exec_calls, 1);
    }

    #[tokio::test]
    async fn run_all_stops_on_fail_on_error() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.containers.push(FakeEngine::container("db", "postgres:16", "running"));
            state.exec_results.push_back(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 1,
            });
        }));
        let executor = HookExecutor::new(engine.clone());

        let mut failing = hook("db", "false");
        failing.fail_on_error = true;
        let trailing = hook("db", "true");

        let (executions, result) = executor
            .run_all(&[failing, trailing], HookType::Pre, Uuid::new_v4())
            .await;
        assert_eq!(executions.len(), 1);
        assert!(matches!(
            result.unwrap_err(),
            CoreError::HookFailed { exit_code: 1 }
        ));
    }

    #[tokio::test]
    async fn run_all_continues_past_tolerated_failures() {
        let engine = Arc::new(FakeEngine::with_state(|state| {
            state.containers.push(FakeEngine::container("db", "postgres:16", "running"));
            state.exec_results.push_back(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 1,
            });
            state.exec_results.push_back(ExecOutput::default());
        }));
        let executor = HookExecutor::new(engine);

        let tolerated = hook("db", "false");
        let trailing = hook("db", "true");

        let (executions, result) = executor
            .run_all(&[tolerated, trailing], HookType::Pre, Uuid::new_v4())
            .await;
        assert!(result.is_ok());
        assert_eq!(executions.len(), 2);
        assert!(!executions[0].succeeded());
        assert!(executions[1].succeeded());
    }
}
