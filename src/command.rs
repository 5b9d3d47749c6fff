//! The immutable `Command` value and the fluent options cascade that builds
//! it.

use crate::errors::{XecError, XecResult};
use crate::shell::{self, ShellDialect, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a [`Command`] should be handed to the substrate: as direct argv, or
/// wrapped in a shell invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellMode {
    /// Pass argv directly with no shell involved.
    Direct,
    /// Wrap in the default shell (`/bin/sh -c` on Unix, substrate-specific
    /// elsewhere).
    Default,
    /// Wrap in an explicit shell binary.
    Explicit(String),
}

/// Where a command's stdin comes from.
#[derive(Debug, Clone)]
pub enum Stdin {
    /// No stdin; redirected from `/dev/null` (or platform equivalent).
    Null,
    /// Fixed bytes written then closed.
    Bytes(Vec<u8>),
    /// Inherit the parent process's stdin.
    Inherit,
}

impl Default for Stdin {
    fn default() -> Self {
        Stdin::Null
    }
}

/// The program to run: either a single shell string (built via [`cmd!`](crate::cmd))
/// or an explicit argv vector.
#[derive(Debug, Clone)]
pub enum Program {
    /// `argv[0]`, with `args` (on [`Command`]) supplying the rest.
    Argv(String),
    /// A single shell string, to be interpreted by the configured shell.
    ShellString(String),
}

/// An immutable description of one command invocation. `Command` values are never mutated after construction; the
/// [`Options`] builder produces new values by copying and overriding.
#[derive(Debug, Clone)]
pub struct Command {
    pub(crate) program: Program,
    pub(crate) args: Vec<String>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) stdin: Stdin,
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) shell: ShellMode,
    pub(crate) max_buffer_bytes: u64,
    pub(crate) throw_on_non_zero_exit: bool,
    pub(crate) raw_template: bool,
}

/// 10 MiB, the default ceiling on captured stdout/stderr.
pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 10 * 1024 * 1024;

/// Default command timeout: 30 seconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

impl Command {
    /// Build a direct-argv command with no shell involved.
    #[must_use]
    pub fn argv(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: Program::Argv(program.into()),
            args,
            env: HashMap::new(),
            cwd: None,
            stdin: Stdin::default(),
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            shell: ShellMode::Direct,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            throw_on_non_zero_exit: true,
            raw_template: false,
        }
    }

    /// Build a shell-string command (the common case, produced by [`cmd!`](crate::cmd)).
    #[must_use]
    pub fn shell_string(command: impl Into<String>) -> Self {
        Self {
            program: Program::ShellString(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stdin: Stdin::default(),
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            shell: ShellMode::Default,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            throw_on_non_zero_exit: true,
            raw_template: false,
        }
    }

    /// The full argv this command would run with, if `shell` is `Direct`.
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Configured working directory, if any.
    #[must_use]
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Configured environment overlay.
    #[must_use]
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Configured timeout in milliseconds, `None` meaning disabled.
    #[must_use]
    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    /// Whether a non-zero exit should surface as `XecError::CommandFailed`.
    #[must_use]
    pub fn throw_on_non_zero_exit(&self) -> bool {
        self.throw_on_non_zero_exit
    }

    /// The configured buffer ceiling.
    #[must_use]
    pub fn max_buffer_bytes(&self) -> u64 {
        self.max_buffer_bytes
    }

    /// The shell mode this command should be executed under.
    #[must_use]
    pub fn shell_mode(&self) -> &ShellMode {
        &self.shell
    }

    /// Render this command to a displayable string, for logs and error
    /// messages only (never re-parsed).
    #[must_use]
    pub fn display(&self) -> String {
        match &self.program {
            Program::Argv(p) => {
                let mut parts = vec![p.clone()];
                parts.extend(self.args.iter().cloned());
                parts.join(" ")
            }
            Program::ShellString(s) => s.clone(),
        }
    }
}

/// Retry policy attached to a handle via `.retry()`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt.
    pub factor: f64,
    /// Ceiling on the computed delay, regardless of `factor`.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// The delay that should precede `attempt` (1-indexed: the delay before
    /// the *next* attempt after `attempt` has failed), before jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_millis() as f64 * self.factor.powi(attempt as i32 - 1);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Cache policy attached to a handle (memoization by key with a TTL).
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Cache key; commands sharing a key reuse a cached result within `ttl`.
    pub key: String,
    /// Time-to-live for a cached result.
    pub ttl: Duration,
}

/// The fluent options cascade. Every method returns a new `Options`
/// value; nothing is mutated in place. `Options` composes with another
/// `Options` by left-to-right override, deep-merging only the `env` map.
#[derive(Debug, Clone, Default)]
pub struct Options {
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    timeout_ms: Option<u64>,
    shell: Option<ShellMode>,
    nothrow: bool,
    quiet: bool,
    retry: Option<RetryPolicy>,
    cache: Option<CachePolicy>,
    raw: bool,
    default_cwd: Option<PathBuf>,
}

impl Options {
    /// Start from an empty cascade.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base working directory new relative `cwd()` calls resolve
    /// against; defaults to the process's own `cwd` otherwise.
    #[must_use]
    pub fn default_cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_cwd = Some(path.into());
        self
    }

    /// Set (or resolve, for relative/`~` paths) the working directory.
    ///
    /// Tilde is expanded against the process user's home via `shellexpand`;
    /// a relative path resolves against whatever `cwd` this builder already
    /// carries (or `default_cwd`, or the process `cwd`, in that order).
    #[must_use]
    pub fn cwd(mut self, path: impl AsRef<str>) -> Self {
        let expanded = shellexpand::tilde(path.as_ref()).into_owned();
        let candidate = PathBuf::from(expanded);
        let resolved = if candidate.is_absolute() {
            candidate
        } else {
            let base = self
                .cwd
                .clone()
                .or_else(|| self.default_cwd.clone())
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from("."));
            base.join(candidate)
        };
        self.cwd = Some(resolved);
        self
    }

    /// Merge `map` into the environment overlay; later keys win on conflict.
    #[must_use]
    pub fn env(mut self, map: HashMap<String, String>) -> Self {
        self.env.extend(map);
        self
    }

    /// Set a single environment variable.
    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set (or clear with `0`) the timeout in milliseconds.
    #[must_use]
    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Configure shell wrapping: `false` disables it (direct argv), `true`
    /// selects the platform default, a string selects an explicit shell
    /// binary.
    #[must_use]
    pub fn shell(mut self, value: impl Into<ShellSetting>) -> Self {
        self.shell = Some(match value.into() {
            ShellSetting::Disabled => ShellMode::Direct,
            ShellSetting::Default => ShellMode::Default,
            ShellSetting::Explicit(path) => ShellMode::Explicit(path),
        });
        self
    }

    /// Suppress exceptions on non-zero exit for handles built from this
    /// cascade.
    #[must_use]
    pub fn nothrow(mut self) -> Self {
        self.nothrow = true;
        self
    }

    /// Suppress default stdout/stderr mirroring.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Attach a retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Attach a cache policy.
    #[must_use]
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Return a variant of this cascade whose template interpolation does
    /// not escape values. Carries the security obligation described in the
    /// `raw` invariant.
    #[must_use]
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// Merge `other` on top of `self`: `other`'s fields win except `env`,
    /// which is deep-merged (associativity is exercised in
    /// `tests::merge_env_is_associative`).
    #[must_use]
    pub fn merge(mut self, other: Options) -> Self {
        self.env.extend(other.env);
        self.cwd = other.cwd.or(self.cwd);
        self.default_cwd = other.default_cwd.or(self.default_cwd);
        self.timeout_ms = other.timeout_ms.or(self.timeout_ms);
        self.shell = other.shell.or(self.shell);
        self.nothrow = other.nothrow || self.nothrow;
        self.quiet = other.quiet || self.quiet;
        self.retry = other.retry.or(self.retry);
        self.cache = other.cache.or(self.cache);
        self.raw = other.raw || self.raw;
        self
    }

    /// Render a template against this cascade's `raw` setting and produce a
    /// `Command`. This is what the `cmd!` macro calls through
    /// [`crate::engine::Engine::run`].
    pub fn build_from_template(
        &self,
        fragments: &[&str],
        values: &[Value],
    ) -> XecResult<Command> {
        if matches!(self.shell, Some(ShellMode::Direct)) && self.raw {
            return Err(XecError::RawWithoutShell);
        }
        let rendered = if self.raw {
            render_raw(fragments, values)
        } else {
            shell::render(fragments, values, ShellDialect::default())?
        };
        Ok(self.apply(Command::shell_string(rendered)).with_raw_flag(self.raw))
    }

    /// Apply this cascade's overrides onto a freshly-built `Command`.
    #[must_use]
    pub fn apply(&self, mut command: Command) -> Command {
        for (k, v) in &self.env {
            command.env.insert(k.clone(), v.clone());
        }
        if let Some(cwd) = &self.cwd {
            command.cwd = Some(cwd.clone());
        }
        if let Some(timeout_ms) = self.timeout_ms {
            command.timeout_ms = if timeout_ms == 0 { None } else { Some(timeout_ms) };
        }
        if let Some(shell) = &self.shell {
            command.shell = shell.clone();
        }
        if self.nothrow {
            command.throw_on_non_zero_exit = false;
        }
        command
    }

    /// The retry policy attached to this cascade, if any.
    #[must_use]
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// The cache policy attached to this cascade, if any.
    #[must_use]
    pub fn cache_policy(&self) -> Option<&CachePolicy> {
        self.cache.as_ref()
    }

    /// Whether default stdout/stderr mirroring is suppressed.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

/// Accepted by [`Options::shell`]: boolean toggles shell wrapping on/off,
/// a string names an explicit shell binary.
pub enum ShellSetting {
    /// Disable shell wrapping.
    Disabled,
    /// Use the platform default shell.
    Default,
    /// Use an explicit shell binary.
    Explicit(String),
}

impl From<bool> for ShellSetting {
    fn from(b: bool) -> Self {
        if b {
            ShellSetting::Default
        } else {
            ShellSetting::Disabled
        }
    }
}

impl From<&str> for ShellSetting {
    fn from(s: &str) -> Self {
        ShellSetting::Explicit(s.to_string())
    }
}

impl From<String> for ShellSetting {
    fn from(s: String) -> Self {
        ShellSetting::Explicit(s)
    }
}

fn render_raw(fragments: &[&str], values: &[Value]) -> String {
    let mut out = String::new();
    for (i, fragment) in fragments.iter().enumerate() {
        out.push_str(fragment);
        if let Some(value) = values.get(i) {
            out.push_str(&value.to_string());
        }
    }
    out
}

trait WithRawFlag {
    fn with_raw_flag(self, raw: bool) -> Self;
}

impl WithRawFlag for Command {
    fn with_raw_flag(mut self, raw: bool) -> Self {
        self.raw_template = raw;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_env_is_associative() {
        let a = Options::new().env_var("A", "1");
        let b = Options::new().env_var("B", "2");
        let c = Options::new().env_var("A", "override");

        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.merge(b.merge(c));

        assert_eq!(left.env, right.env);
    }

    #[test]
    fn cwd_resolves_relative_paths_against_current_cwd() {
        let opts = Options::new().default_cwd("/srv").cwd("app");
        assert_eq!(opts.cwd, Some(PathBuf::from("/srv/app")));
    }

    #[test]
    fn cwd_expands_tilde() {
        let home = dirs::home_dir().unwrap();
        let opts = Options::new().cwd("~/project");
        assert_eq!(opts.cwd, Some(home.join("project")));
    }

    #[test]
    fn raw_without_shell_is_rejected() {
        let opts = Options::new().raw().shell(false);
        let err = opts.build_from_template(&["echo ", ""], &[Value::from("hi")]);
        assert!(matches!(err, Err(XecError::RawWithoutShell)));
    }

    #[test]
    fn timeout_zero_disables_timeout() {
        let opts = Options::new().timeout(0);
        let command = opts.apply(Command::shell_string("true"));
        assert_eq!(command.timeout_ms, None);
    }
}
