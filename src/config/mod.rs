//! Declarative configuration: the YAML schema, the merge
//! cascade, the target resolver, and human-unit parsing, tied together here
//! by the loader that actually walks the search path and applies the
//! `XEC_*` environment overlay.

pub mod merge;
pub mod resolver;
pub mod schema;
pub mod units;

pub use resolver::{levenshtein, resolve_target};
pub use schema::{Configuration, ContainerSpec, Defaults, HostSpec, PodSpec, Profile, ShellSetting, StepSpec, TaskSpec};

use crate::errors::{XecError, XecResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Inputs that steer configuration loading beyond the on-disk search path
///.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// An explicit config path (`--config`/`XEC_CONFIG`); bypasses the
    /// search path entirely when set.
    pub explicit_path: Option<PathBuf>,
    /// The active profile name (`--profile`/`XEC_PROFILE`), applied after
    /// the environment overlay.
    pub profile: Option<String>,
    /// Directory the search path walks upward from; defaults to the
    /// process's current directory. Exposed for testability.
    pub start_dir: Option<PathBuf>,
}

/// Load and fully resolve configuration: find the file (or start from
/// built-in defaults if none exists), parse it, overlay `XEC_*` environment
/// variables, then apply the active profile.
///
/// # Errors
/// Returns `XecError::ConfigInvalid` if a found file fails to parse, or
/// `XecError::ProfileCycle` if the active profile's `extends` chain cycles.
pub fn load(opts: &LoadOptions) -> XecResult<Configuration> {
    let config = match find_config_path(opts) {
        Some(path) => parse_file(&path)?,
        None => Configuration::default(),
    };
    let config = apply_env_overlay(config, &std::env::vars().collect());
    apply_active_profile(config, opts.profile.as_deref())
}

/// Parse a single YAML file into a `Configuration`.
///
/// # Errors
/// Returns `XecError::ConfigInvalid` on I/O failure or malformed YAML.
pub fn parse_file(path: &Path) -> XecResult<Configuration> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| XecError::ConfigInvalid(format!("reading {}: {e}", path.display())))?;
    parse_str(&text)
}

/// Parse configuration YAML from a string, for tests and inline sources.
///
/// # Errors
/// Returns `XecError::ConfigInvalid` on malformed YAML.
pub fn parse_str(text: &str) -> XecResult<Configuration> {
    serde_yaml_ng::from_str(text).map_err(|e| XecError::ConfigInvalid(format!("invalid YAML: {e}")))
}

/// Resolve which config file, if any, should be loaded.
///
/// An explicit path always wins. Otherwise the search order is: walking
/// upward from `start_dir` looking for `.xec/config.yaml`, then `.xec.yaml`
/// and `xec.yaml` in `start_dir` itself, then `${HOME}/.xec/config.yaml`,
/// then `${HOME}/.xec.yaml`. The first existing file stops the search.
#[must_use]
pub fn find_config_path(opts: &LoadOptions) -> Option<PathBuf> {
    if let Some(explicit) = &opts.explicit_path {
        return Some(explicit.clone());
    }

    let start = opts.start_dir.clone().or_else(|| std::env::current_dir().ok())?;
    if let Some(found) = walk_upward_for(&start, Path::new(".xec/config.yaml")) {
        return Some(found);
    }
    for candidate in [".xec.yaml", "xec.yaml"] {
        let path = start.join(candidate);
        if path.is_file() {
            return Some(path);
        }
    }

    let home = dirs::home_dir()?;
    let home_nested = home.join(".xec/config.yaml");
    if home_nested.is_file() {
        return Some(home_nested);
    }
    let home_flat = home.join(".xec.yaml");
    if home_flat.is_file() {
        return Some(home_flat);
    }
    None
}

/// Walk from `dir` upward through its ancestors looking for `relative` under
/// each one, stopping at the first match.
fn walk_upward_for(dir: &Path, relative: &Path) -> Option<PathBuf> {
    let mut current = Some(dir);
    while let Some(d) = current {
        let candidate = d.join(relative);
        if candidate.is_file() {
            return Some(candidate);
        }
        current = d.parent();
    }
    None
}

/// Overlay `XEC_*` environment variables onto `config.defaults`.
/// Only the defaults understood by the CLI's global flags are consumed here
/// (`XEC_TIMEOUT`, `XEC_SHELL`, `XEC_CWD`); `XEC_CONFIG`/`XEC_PROFILE` steer
/// loading itself and are read by the caller, not folded into the tree.
#[must_use]
pub fn apply_env_overlay(mut config: Configuration, env: &HashMap<String, String>) -> Configuration {
    if let Some(timeout) = env.get("XEC_TIMEOUT") {
        config.defaults.timeout = Some(timeout.clone());
    }
    if let Some(shell) = env.get("XEC_SHELL") {
        config.defaults.shell = Some(ShellSetting::Path(shell.clone()));
    }
    if let Some(cwd) = env.get("XEC_CWD") {
        config.defaults.cwd = Some(PathBuf::from(cwd));
    }
    config
}

/// Flatten and apply `profile_name`, if set, onto `config`.
///
/// # Errors
/// Returns `XecError::ProfileCycle` on an `extends` cycle, or
/// `XecError::ConfigInvalid` if `profile_name` does not exist.
pub fn apply_active_profile(config: Configuration, profile_name: Option<&str>) -> XecResult<Configuration> {
    match profile_name {
        Some(name) => {
            let resolved = merge::resolve_profile(&config.profiles, name)?;
            Ok(merge::apply_profile(config, resolved))
        }
        None => Ok(config),
    }
}

/// Resolve `defaults.timeout` into milliseconds, if set.
///
/// # Errors
/// Propagates `XecError::ConfigInvalid` from `units::parse_duration_ms`.
pub fn default_timeout_ms(defaults: &Defaults) -> XecResult<Option<u64>> {
    defaults.timeout.as_deref().map(units::parse_duration_ms).transpose()
}

/// Build an [`crate::command::Options`] cascade from a configuration's
/// `defaults:` section, feeding every command the CLI builds unless
/// overridden by a more specific flag.
///
/// # Errors
/// Propagates `XecError::ConfigInvalid` from a malformed `timeout` string.
pub fn options_from_defaults(defaults: &Defaults) -> XecResult<crate::command::Options> {
    let mut options = crate::command::Options::new();
    if let Some(ms) = default_timeout_ms(defaults)? {
        options = options.timeout(ms);
    }
    if !defaults.env.is_empty() {
        options = options.env(defaults.env.clone());
    }
    if let Some(cwd) = &defaults.cwd {
        options = options.cwd(cwd.to_string_lossy().into_owned());
    }
    if let Some(shell) = &defaults.shell {
        options = match shell {
            ShellSetting::Toggle(b) => options.shell(*b),
            ShellSetting::Path(p) => options.shell(p.as_str()),
        };
    }
    if defaults.throw_on_non_zero_exit == Some(false) {
        options = options.nothrow();
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
hosts:
  prod-1:
    host: 10.0.0.1
    username: deploy
aliases:
  deploy: "on prod-1 ./deploy.sh"
"#;
        let config = parse_str(yaml).unwrap();
        assert_eq!(config.hosts["prod-1"].host, "10.0.0.1");
        assert_eq!(config.aliases["deploy"], "on prod-1 ./deploy.sh");
    }

    #[test]
    fn env_overlay_sets_timeout_shell_and_cwd() {
        let mut env = HashMap::new();
        env.insert("XEC_TIMEOUT".to_string(), "10s".to_string());
        env.insert("XEC_SHELL".to_string(), "/bin/zsh".to_string());
        env.insert("XEC_CWD".to_string(), "/srv/app".to_string());
        let config = apply_env_overlay(Configuration::default(), &env);
        assert_eq!(config.defaults.timeout.as_deref(), Some("10s"));
        assert!(matches!(config.defaults.shell, Some(ShellSetting::Path(ref p)) if p == "/bin/zsh"));
        assert_eq!(config.defaults.cwd, Some(PathBuf::from("/srv/app")));
    }

    #[test]
    fn search_path_walks_upward_for_dot_xec_dir() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        let xec_dir = temp.path().join("a/.xec");
        std::fs::create_dir_all(&xec_dir).unwrap();
        std::fs::write(xec_dir.join("config.yaml"), "aliases: {}\n").unwrap();

        let opts = LoadOptions { explicit_path: None, profile: None, start_dir: Some(nested) };
        let found = find_config_path(&opts).unwrap();
        assert_eq!(found, temp.path().join("a/.xec/config.yaml"));
    }

    #[test]
    fn explicit_path_bypasses_search() {
        let opts = LoadOptions { explicit_path: Some(PathBuf::from("/tmp/custom.yaml")), profile: None, start_dir: None };
        assert_eq!(find_config_path(&opts), Some(PathBuf::from("/tmp/custom.yaml")));
    }

    #[test]
    fn active_profile_is_applied() {
        let mut config = Configuration::default();
        config.profiles.insert(
            "staging".to_string(),
            Profile {
                hosts: {
                    let mut m = HashMap::new();
                    m.insert("web".to_string(), HostSpec { host: "staging.example".to_string(), ..Default::default() });
                    m
                },
                ..Default::default()
            },
        );
        let resolved = apply_active_profile(config, Some("staging")).unwrap();
        assert_eq!(resolved.hosts["web"].host, "staging.example");
    }
}
