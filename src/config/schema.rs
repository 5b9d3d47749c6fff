//! The configuration tree's `serde` shape. Every field is optional at
//! this layer; required-ness is enforced when a section is resolved against
//! a target, not at parse time, since a partial profile override is valid
//! input on its own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration tree, as parsed from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Engine-wide defaults applied before any target-specific override.
    pub defaults: Defaults,
    /// Named SSH hosts.
    pub hosts: HashMap<String, HostSpec>,
    /// Named Docker containers.
    pub containers: HashMap<String, ContainerSpec>,
    /// Named Kubernetes pods.
    pub pods: HashMap<String, PodSpec>,
    /// Named profiles, each an overlay over `hosts`/`containers`/`pods`/`defaults`.
    pub profiles: HashMap<String, Profile>,
    /// Named tasks.
    pub tasks: HashMap<String, TaskSpec>,
    /// Shorthand command aliases, e.g. `deploy: "on prod-1,prod-2 ./deploy.sh"`.
    pub aliases: HashMap<String, String>,
}

/// `defaults:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Default command timeout, human unit string (`"30s"`) or bare
    /// milliseconds. Parsed via [`crate::config::units::parse_duration_ms`].
    pub timeout: Option<String>,
    /// Default shell setting (`true`/`false`/a shell path).
    pub shell: Option<ShellSetting>,
    /// Default working directory.
    pub cwd: Option<PathBuf>,
    /// Environment variables merged (deep-merge) into every command.
    pub env: HashMap<String, String>,
    /// Output text encoding; only `"utf8"` is currently honored.
    pub encoding: Option<String>,
    /// Whether a non-zero exit throws by default.
    pub throw_on_non_zero_exit: Option<bool>,
}

/// `defaults.shell` may be a boolean or an explicit shell path, mirroring
/// [`crate::command::ShellSetting`]'s `From` impls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShellSetting {
    /// `true` to use the platform default shell, `false` to disable.
    Toggle(bool),
    /// An explicit shell binary path.
    Path(String),
}

/// `hosts.<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSpec {
    /// Hostname or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// SSH username.
    pub username: String,
    /// Inline password (discouraged; prefer `private_key`/`private_key_path`).
    pub password: Option<String>,
    /// Inline private key contents.
    pub private_key: Option<String>,
    /// Path to a private key file.
    pub private_key_path: Option<PathBuf>,
    /// Passphrase for an encrypted private key.
    pub passphrase: Option<String>,
    /// How long to wait for the session to become usable, human unit string.
    pub ready_timeout: Option<String>,
    /// Keepalive interval, human unit string.
    pub keepalive_interval: Option<String>,
    /// Missed keepalives tolerated before the session is marked unhealthy.
    pub keepalive_count_max: Option<u32>,
    /// Environment variables merged into commands run against this host.
    pub env: HashMap<String, String>,
    /// Sudo escalation, if commands on this host need it.
    pub sudo: Option<SudoSpec>,
}

impl Default for HostSpec {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: None,
            private_key: None,
            private_key_path: None,
            passphrase: None,
            ready_timeout: None,
            keepalive_interval: None,
            keepalive_count_max: None,
            env: HashMap::new(),
            sudo: None,
        }
    }
}

/// Sudo escalation configuration for a host (mirrors [`crate::adapter::ssh::SudoConfig`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SudoSpec {
    /// Sudo password, if non-interactive escalation is needed.
    pub password: Option<String>,
    /// Whether to pass `-n` (never prompt).
    pub non_interactive: bool,
}

impl Default for SudoSpec {
    fn default() -> Self {
        Self { password: None, non_interactive: true }
    }
}

/// `containers.<name>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Existing container name or id to target. Mutually exclusive in
    /// practice with `image` (which implies an ephemeral container), though
    /// both are accepted at parse time.
    pub container: Option<String>,
    /// Image to run an ephemeral container from when `container` is unset.
    pub image: Option<String>,
    /// Environment variables for `docker exec`/`docker run`.
    pub env: HashMap<String, String>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// User to run as inside the container.
    pub user: Option<String>,
    /// Allocate a TTY for interactive commands.
    pub tty: bool,
}

/// `pods.<name>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSpec {
    /// Pod name.
    pub name: String,
    /// Namespace, default `"default"`.
    pub namespace: Option<String>,
    /// Container within the pod.
    pub container: Option<String>,
    /// `kubectl` context.
    pub context: Option<String>,
    /// Path to an explicit kubeconfig file.
    pub kubeconfig: Option<PathBuf>,
}

/// `profiles.<name>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Name of a profile this one inherits from.
    pub extends: Option<String>,
    /// Defaults overlay.
    pub defaults: Option<Defaults>,
    /// Hosts overlay (merged key-by-key over the base `hosts` map).
    pub hosts: HashMap<String, HostSpec>,
    /// Containers overlay.
    pub containers: HashMap<String, ContainerSpec>,
    /// Pods overlay.
    pub pods: HashMap<String, PodSpec>,
}

/// `tasks.<name>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// Human-readable description, surfaced by `xec config`/`xec run --help`.
    pub description: Option<String>,
    /// Typed parameter declarations.
    pub params: HashMap<String, ParamSpec>,
    /// Default target token for steps that don't specify one.
    pub target: Option<String>,
    /// Multiple target tokens, for a task meant to fan out.
    pub targets: Vec<String>,
    /// The ordered steps that make up this task.
    pub steps: Vec<StepSpec>,
    /// Run sibling steps concurrently instead of sequentially.
    pub parallel: bool,
    /// Concurrency cap when `parallel` is set.
    pub max_concurrency: Option<usize>,
    /// Keep running remaining steps after one fails.
    pub continue_on_error: bool,
}

/// One parameter declaration for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSpec {
    /// The parameter's type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Default value, rendered as a string regardless of `param_type`.
    pub default: Option<String>,
    /// Whether the task fails to resolve if this parameter is not supplied.
    pub required: bool,
}

impl Default for ParamSpec {
    fn default() -> Self {
        Self { param_type: ParamType::String, default: None, required: false }
    }
}

/// Declared type of a task parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Free-form text.
    String,
    /// Parsed as an integer.
    Int,
    /// Parsed as `true`/`false`.
    Bool,
    /// A filesystem path, subject to the same `~`/relative resolution as
    /// `cwd`.
    Path,
}

/// One step of a task: exactly one of `command`, `script`, `task` is
/// set; which one determines the step's kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSpec {
    /// A shell string to run, with `${param}` placeholders.
    pub command: Option<String>,
    /// A relative path to a script file, delegated to the out-of-scope
    /// script-runner collaborator.
    pub script: Option<String>,
    /// A reference to another task by name.
    pub task: Option<String>,
    /// Parameter overrides when `task` is set.
    pub with: HashMap<String, String>,
    /// Target token override for this step only.
    pub target: Option<String>,
}
