//! The named, multi-step task runner.
//!
//! A task's steps run against a resolved [`Target`], with `${name}`
//! placeholders in `command` steps substituted through the same escaping
//! discipline as [`crate::shell`] so a parameter value can never break out of
//! its argument position. Sibling steps run sequentially by default, or
//! concurrently (bounded by `max_concurrency`) when the task declares
//! `parallel: true`.

use crate::adapter::Target;
use crate::config::schema::{ParamSpec, ParamType, StepSpec, TaskSpec};
use crate::config::{resolve_target, Configuration};
use crate::engine::Engine;
use crate::errors::{XecError, XecResult};
use crate::result::ExecResult;
use crate::shell::{Value, ShellDialect};
use std::collections::HashMap;

/// Resolved parameter values for one task invocation, keyed by parameter
/// name. Every declared parameter is present after [`resolve_params`]: either
/// the caller-supplied override, the declared default, or (for a `required`
/// parameter with neither) a `ConfigInvalid` error at resolution time.
pub type ParamValues = HashMap<String, String>;

/// Outcome of one executed step, surfaced to the caller so a `--json` CLI
/// report can show per-step detail even when the task as a whole failed.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Index of the step within the task's `steps` list.
    pub index: usize,
    /// The step's result, or the error it failed with.
    pub result: XecResult<ExecResult>,
}

/// The full report of one task run.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Per-step outcomes, in the order steps were dispatched (not
    /// necessarily completion order, when `parallel` is set).
    pub steps: Vec<StepOutcome>,
}

impl TaskReport {
    /// Whether every step that ran succeeded. A task run under
    /// `continue_on_error` can be non-`ok` even though it ran to completion.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.steps.iter().all(|s| matches!(&s.result, Ok(r) if r.ok()))
    }
}

/// Runs tasks defined in a [`Configuration`] against targets resolved from
/// that same configuration.
pub struct TaskRunner<'a> {
    engine: &'a Engine,
    config: &'a Configuration,
}

impl<'a> TaskRunner<'a> {
    /// Build a runner bound to `engine` and the targets/tasks in `config`.
    #[must_use]
    pub fn new(engine: &'a Engine, config: &'a Configuration) -> Self {
        Self { engine, config }
    }

    /// Run the named task with `overrides` applied on top of its declared
    /// parameter defaults.
    ///
    /// # Errors
    /// Returns `XecError::ConfigInvalid` if the task does not exist, a
    /// required parameter is missing, or a parameter value does not parse
    /// as its declared type. Returns `XecError::TargetNotFound` if the
    /// task's (or a step's) target token does not resolve. Step execution
    /// errors are reported per-step in the returned `TaskReport` rather than
    /// short-circuiting `run`, except when a non-`continue_on_error` task
    /// aborts early, in which case the first step error is also returned.
    pub async fn run(&self, task_name: &str, overrides: &ParamValues) -> XecResult<TaskReport> {
        let task = self
            .config
            .tasks
            .get(task_name)
            .ok_or_else(|| XecError::ConfigInvalid(format!("task '{task_name}' does not exist")))?;
        self.run_task(task, overrides).await
    }

    async fn run_task(&self, task: &TaskSpec, overrides: &ParamValues) -> XecResult<TaskReport> {
        let params = resolve_params(&task.params, overrides)?;
        let default_target = self.default_target_for(task)?;

        if task.parallel {
            self.run_parallel(task, &params, default_target.as_ref()).await
        } else {
            self.run_sequential(task, &params, default_target.as_ref()).await
        }
    }

    fn default_target_for(&self, task: &TaskSpec) -> XecResult<Option<Target>> {
        match &task.target {
            Some(token) => Ok(Some(resolve_target(self.config, token)?)),
            None => Ok(None),
        }
    }

    async fn run_sequential(
        &self,
        task: &TaskSpec,
        params: &ParamValues,
        default_target: Option<&Target>,
    ) -> XecResult<TaskReport> {
        let mut outcomes = Vec::with_capacity(task.steps.len());
        for (index, step) in task.steps.iter().enumerate() {
            let result = self.run_step(step, params, default_target).await;
            let failed = result.as_ref().map(|r| !r.ok()).unwrap_or(true);
            outcomes.push(StepOutcome { index, result: result.clone() });
            if failed && !task.continue_on_error {
                return match result {
                    Err(e) => Err(e),
                    Ok(r) => Err(r.cause.map(|c| (*c).clone()).unwrap_or(XecError::CommandFailed {
                        command: format!("step {index}"),
                        exit_code: r.exit_code.unwrap_or(-1),
                        stdout: r.stdout,
                        stderr: r.stderr,
                    })),
                };
            }
        }
        Ok(TaskReport { steps: outcomes })
    }

    async fn run_parallel(
        &self,
        task: &TaskSpec,
        params: &ParamValues,
        default_target: Option<&Target>,
    ) -> XecResult<TaskReport> {
        let concurrency = task.max_concurrency.unwrap_or(task.steps.len().max(1));
        let items: Vec<(usize, StepSpec)> = task.steps.iter().cloned().enumerate().collect();
        let params = params.clone();
        let default_target = default_target.cloned();
        let config = self.config.clone();
        let engine = self.engine.clone();

        let outcomes = crate::parallel::batch(items, concurrency, move |(index, step)| {
            let params = params.clone();
            let default_target = default_target.clone();
            let config = config.clone();
            let engine = engine.clone();
            async move {
                let runner = TaskRunner { engine: &engine, config: &config };
                let result = runner.run_step(&step, &params, default_target.as_ref()).await;
                StepOutcome { index, result }
            }
        })
        .await;

        let any_failed = outcomes.iter().any(|o| !matches!(&o.result, Ok(r) if r.ok()));
        if any_failed && !task.continue_on_error {
            let first_failure = outcomes.iter().find(|o| !matches!(&o.result, Ok(r) if r.ok()));
            if let Some(failure) = first_failure {
                if let Err(e) = &failure.result {
                    return Err(e.clone());
                }
            }
        }
        Ok(TaskReport { steps: outcomes })
    }

    async fn run_step(&self, step: &StepSpec, params: &ParamValues, default_target: Option<&Target>) -> XecResult<ExecResult> {
        let target = match &step.target {
            Some(token) => resolve_target(self.config, token)?,
            None => default_target.cloned().ok_or_else(|| {
                XecError::ConfigInvalid("step has no target and the task declares none".to_string())
            })?,
        };

        if let Some(command) = &step.command {
            let rendered = substitute(command, params)?;
            let options = crate::config::options_from_defaults(&self.config.defaults)?;
            let cmd = Engine::command_from(&options, rendered);
            let handle = self.engine.run(target, cmd).await?;
            return handle.output().await;
        }

        if let Some(script) = &step.script {
            return Err(XecError::Unsupported(format!(
                "script step '{script}' delegates to the external script-runner, which this engine does not embed"
            )));
        }

        if let Some(task_name) = &step.task {
            let mut overrides = params.clone();
            overrides.extend(step.with.clone());
            let nested = self.run(task_name, &overrides).await?;
            return nested
                .steps
                .last()
                .map(|s| s.result.clone())
                .unwrap_or_else(|| Err(XecError::ConfigInvalid(format!("task '{task_name}' has no steps"))));
        }

        Err(XecError::ConfigInvalid("step declares none of command/script/task".to_string()))
    }
}

/// Resolve a task's declared parameters against caller-supplied `overrides`,
/// validating required-ness and coercing to each parameter's declared type
/// (coercion only rejects malformed input; the resolved value is still
/// stored as a string, since `${name}` substitution always produces text).
///
/// # Errors
/// Returns `XecError::ConfigInvalid` if a required parameter has neither an
/// override nor a default, or if a supplied/default value does not parse as
/// its declared `ParamType`.
pub fn resolve_params(declared: &HashMap<String, ParamSpec>, overrides: &ParamValues) -> XecResult<ParamValues> {
    let mut resolved = ParamValues::new();
    for (name, spec) in declared {
        let value = overrides
            .get(name)
            .cloned()
            .or_else(|| spec.default.clone());
        match value {
            Some(v) => {
                validate_param_type(name, spec.param_type, &v)?;
                resolved.insert(name.clone(), v);
            }
            None if spec.required => {
                return Err(XecError::ConfigInvalid(format!("missing required parameter '{name}'")));
            }
            None => {}
        }
    }
    // Overrides for parameters the task didn't declare are passed through
    // unchanged (e.g. a nested `task` step's `with:` targeting a parameter
    // the inner task declares but the outer one does not).
    for (name, v) in overrides {
        resolved.entry(name.clone()).or_insert_with(|| v.clone());
    }
    Ok(resolved)
}

fn validate_param_type(name: &str, param_type: ParamType, value: &str) -> XecResult<()> {
    match param_type {
        ParamType::String | ParamType::Path => Ok(()),
        ParamType::Int => value
            .parse::<i64>()
            .map(|_| ())
            .map_err(|_| XecError::ConfigInvalid(format!("parameter '{name}' expects an int, got '{value}'"))),
        ParamType::Bool => match value {
            "true" | "false" => Ok(()),
            _ => Err(XecError::ConfigInvalid(format!("parameter '{name}' expects true/false, got '{value}'"))),
        },
    }
}

/// Substitute every `${name}` placeholder in `template` with its resolved,
/// shell-escaped value.
/// Unresolved placeholders (no matching parameter) are left as literal text
/// rather than erroring, treating an unmatched `${...}` as not-a-placeholder.
///
/// # Errors
/// Propagates `XecError::UnsupportedValue` should a parameter value fail
/// `shell::render`'s validation (currently unreachable, since every
/// parameter value is a plain string).
pub fn substitute(template: &str, params: &ParamValues) -> XecResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            return Ok(out);
        };
        let name = &rest[start + 2..start + end];
        out.push_str(&rest[..start]);
        match params.get(name) {
            Some(value) => {
                let rendered = crate::shell::render(&["", ""], &[Value::from(value.clone())], ShellDialect::default())?;
                out.push_str(&rendered);
            }
            None => out.push_str(&rest[start..start + end + 1]),
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_escapes_values() {
        let mut params = ParamValues::new();
        params.insert("user".to_string(), "'; rm -rf /; echo '".to_string());
        let rendered = substitute("touch ${user}", &params).unwrap();
        assert_eq!(rendered, "touch ''\\''; rm -rf /; echo '\\'''");
    }

    #[test]
    fn unresolved_placeholder_is_left_literal() {
        let params = ParamValues::new();
        let rendered = substitute("echo ${missing}", &params).unwrap();
        assert_eq!(rendered, "echo ${missing}");
    }

    #[test]
    fn required_param_without_override_or_default_errors() {
        let mut declared = HashMap::new();
        declared.insert("name".to_string(), ParamSpec { param_type: ParamType::String, default: None, required: true });
        let err = resolve_params(&declared, &ParamValues::new()).unwrap_err();
        assert!(matches!(err, XecError::ConfigInvalid(_)));
    }

    #[test]
    fn int_param_rejects_non_numeric_value() {
        let mut declared = HashMap::new();
        declared.insert(
            "count".to_string(),
            ParamSpec { param_type: ParamType::Int, default: Some("notanumber".to_string()), required: false },
        );
        let err = resolve_params(&declared, &ParamValues::new()).unwrap_err();
        assert!(matches!(err, XecError::ConfigInvalid(_)));
    }

    #[test]
    fn override_wins_over_default() {
        let mut declared = HashMap::new();
        declared.insert(
            "env".to_string(),
            ParamSpec { param_type: ParamType::String, default: Some("staging".to_string()), required: false },
        );
        let mut overrides = ParamValues::new();
        overrides.insert("env".to_string(), "production".to_string());
        let resolved = resolve_params(&declared, &overrides).unwrap();
        assert_eq!(resolved["env"], "production");
    }
}
