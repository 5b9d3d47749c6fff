//! Target resolution: turn a user-supplied token into an
//! [`Target`](crate::adapter::Target), searching `aliases`, `hosts`,
//! `containers`, `pods` in that order, with a forced-prefix escape hatch and
//! Levenshtein-distance suggestions on miss.

use super::schema::{Configuration, ContainerSpec, HostSpec, PodSpec};
use crate::adapter::{DockerSpec, K8sSpec, SshSpec, Target};
use crate::errors::{XecError, XecResult};

/// Resolve `token` against `config` into a concrete [`Target`].
///
/// Resolution order: `aliases` (an alias resolves to its aliased token,
/// recursively, once), then `hosts`, `containers`, `pods`. A `pod:<name>`
/// prefix forces pod lookup; `docker:<name>` forces container lookup. On
/// ambiguity between sections, hosts win.
///
/// # Errors
/// Returns `XecError::TargetNotFound` carrying the closest known target name
/// (by edit distance) when nothing matches.
pub fn resolve_target(config: &Configuration, token: &str) -> XecResult<Target> {
    if let Some(name) = token.strip_prefix("pod:") {
        return pod_target(config, name);
    }
    if let Some(name) = token.strip_prefix("docker:") {
        return container_target(config, name);
    }

    if let Some(aliased) = config.aliases.get(token) {
        return resolve_target(config, aliased);
    }
    if config.hosts.contains_key(token) {
        return host_target(config, token);
    }
    if config.containers.contains_key(token) {
        return container_target(config, token);
    }
    if config.pods.contains_key(token) {
        return pod_target(config, token);
    }

    Err(XecError::TargetNotFound { token: token.to_string(), suggestion: suggest(config, token) })
}

fn host_target(config: &Configuration, name: &str) -> XecResult<Target> {
    let spec = config.hosts.get(name).ok_or_else(|| not_found(config, name))?;
    Ok(Target::Ssh(to_ssh_spec(spec)?))
}

fn container_target(config: &Configuration, name: &str) -> XecResult<Target> {
    let spec = config.containers.get(name).ok_or_else(|| not_found(config, name))?;
    Ok(Target::Docker(to_docker_spec(name, spec)))
}

fn pod_target(config: &Configuration, name: &str) -> XecResult<Target> {
    let spec = config.pods.get(name).ok_or_else(|| not_found(config, name))?;
    Ok(Target::K8s(to_k8s_spec(spec)))
}

fn not_found(config: &Configuration, name: &str) -> XecError {
    XecError::TargetNotFound { token: name.to_string(), suggestion: suggest(config, name) }
}

fn to_ssh_spec(spec: &HostSpec) -> XecResult<SshSpec> {
    let defaults = SshSpec::new(String::new(), String::new(), crate::adapter::ssh::SshAuth::Agent);
    let ready_timeout = match &spec.ready_timeout {
        Some(s) => std::time::Duration::from_millis(super::units::parse_duration_ms(s)?),
        None => defaults.ready_timeout,
    };
    let keepalive_interval = match &spec.keepalive_interval {
        Some(s) => Some(std::time::Duration::from_millis(super::units::parse_duration_ms(s)?)),
        None => defaults.keepalive_interval,
    };
    let keepalive_count_max = spec.keepalive_count_max.unwrap_or(defaults.keepalive_count_max);

    Ok(SshSpec {
        host: spec.host.clone(),
        port: spec.port,
        user: spec.username.clone(),
        auth: crate::adapter::ssh::SshAuth::from_host_spec(
            spec.password.clone(),
            spec.private_key.clone(),
            spec.private_key_path.clone(),
            spec.passphrase.clone(),
        ),
        ready_timeout,
        keepalive_interval,
        keepalive_count_max,
        env: spec.env.clone(),
        sudo: spec.sudo.as_ref().map(|s| crate::adapter::ssh::SudoConfig {
            password: s.password.clone(),
            non_interactive: s.non_interactive,
        }),
    })
}

fn to_docker_spec(name: &str, spec: &ContainerSpec) -> DockerSpec {
    let container = spec.container.clone().or_else(|| {
        if spec.image.is_none() {
            Some(name.to_string())
        } else {
            None
        }
    });
    DockerSpec {
        container,
        image: spec.image.clone(),
        env: spec.env.clone(),
        workdir: spec.workdir.clone(),
        user: spec.user.clone(),
        tty: spec.tty,
        auto_remove: spec.image.is_some(),
    }
}

fn to_k8s_spec(spec: &PodSpec) -> K8sSpec {
    let mut k8s = K8sSpec::new(spec.name.clone());
    k8s.namespace = spec.namespace.clone();
    k8s.container = spec.container.clone();
    k8s.context = spec.context.clone();
    k8s.kubeconfig = spec.kubeconfig.clone();
    k8s
}

/// Find the closest known target name to `token` by Levenshtein distance,
/// searched across aliases, hosts, containers, and pod names.
fn suggest(config: &Configuration, token: &str) -> Option<String> {
    let candidates = config
        .aliases
        .keys()
        .chain(config.hosts.keys())
        .chain(config.containers.keys())
        .chain(config.pods.keys());

    candidates
        .map(|name| (name, levenshtein(token, name)))
        .min_by_key(|(_, dist)| *dist)
        .filter(|(_, dist)| *dist <= 3)
        .map(|(name, _)| name.clone())
}

/// Classic Wagner-Fischer edit distance, used for `TargetNotFound`
/// suggestions and unknown-CLI-command suggestions.
#[must_use]
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for i in 1..=a.len() {
        let mut prev_diag = row[0];
        row[0] = i;
        for j in 1..=b.len() {
            let temp = row[j];
            row[j] = if a[i - 1] == b[j - 1] {
                prev_diag
            } else {
                1 + row[j].min(row[j - 1]).min(prev_diag)
            };
            prev_diag = temp;
        }
    }
    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_config() -> Configuration {
        let mut config = Configuration::default();
        config.hosts.insert("prod-1".to_string(), HostSpec { host: "10.0.0.1".to_string(), ..Default::default() });
        config.containers.insert("redis".to_string(), ContainerSpec::default());
        config.aliases.insert("production".to_string(), "prod-1".to_string());
        config
    }

    #[test]
    fn alias_resolves_to_its_target() {
        let config = sample_config();
        let target = resolve_target(&config, "production").unwrap();
        assert!(matches!(target, Target::Ssh(_)));
    }

    #[test]
    fn pod_prefix_forces_pod_lookup() {
        let mut config = sample_config();
        config.pods.insert("redis".to_string(), PodSpec { name: "redis".to_string(), ..Default::default() });
        let target = resolve_target(&config, "pod:redis").unwrap();
        assert!(matches!(target, Target::K8s(_)));
    }

    #[test]
    fn unknown_token_suggests_closest_match() {
        let config = sample_config();
        let err = resolve_target(&config, "prod-2").unwrap_err();
        match err {
            XecError::TargetNotFound { suggestion, .. } => assert_eq!(suggestion.as_deref(), Some("prod-1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn host_target_parses_ready_timeout_and_keepalive_from_human_units() {
        let mut config = Configuration::default();
        config.hosts.insert(
            "prod-1".to_string(),
            HostSpec {
                host: "10.0.0.1".to_string(),
                ready_timeout: Some("5s".to_string()),
                keepalive_interval: Some("30s".to_string()),
                keepalive_count_max: Some(5),
                ..Default::default()
            },
        );
        let target = resolve_target(&config, "prod-1").unwrap();
        match target {
            Target::Ssh(spec) => {
                assert_eq!(spec.ready_timeout, std::time::Duration::from_secs(5));
                assert_eq!(spec.keepalive_interval, Some(std::time::Duration::from_secs(30)));
                assert_eq!(spec.keepalive_count_max, 5);
            }
            other => panic!("expected an SSH target, got {other:?}"),
        }
    }

    #[test]
    fn host_target_falls_back_to_ssh_spec_defaults_when_unset() {
        let config = sample_config();
        let target = resolve_target(&config, "prod-1").unwrap();
        match target {
            Target::Ssh(spec) => {
                let defaults = SshSpec::new("", "", crate::adapter::ssh::SshAuth::Agent);
                assert_eq!(spec.ready_timeout, defaults.ready_timeout);
                assert_eq!(spec.keepalive_interval, defaults.keepalive_interval);
                assert_eq!(spec.keepalive_count_max, defaults.keepalive_count_max);
            }
            other => panic!("expected an SSH target, got {other:?}"),
        }
    }

    #[test]
    fn host_target_rejects_an_unparseable_ready_timeout() {
        let mut config = Configuration::default();
        config.hosts.insert(
            "prod-1".to_string(),
            HostSpec { host: "10.0.0.1".to_string(), ready_timeout: Some("5x".to_string()), ..Default::default() },
        );
        let err = resolve_target(&config, "prod-1").unwrap_err();
        assert!(matches!(err, XecError::ConfigInvalid(_)));
    }

    #[test]
    fn levenshtein_matches_known_values() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    #[allow(unused)]
    fn unused_import_guard() {
        let _: HashMap<String, String> = HashMap::new();
    }
}
