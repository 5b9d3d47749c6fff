//! Source merging: later sources override earlier ones, `env` maps
//! deep-merge, every other map merges shallowly key-by-key.

use super::schema::{Configuration, Defaults, Profile};
use crate::errors::{XecError, XecResult};
use std::collections::{HashMap, HashSet};

/// Merge `overlay` onto `base`, consuming both. `env` deep-merges (keys from
/// `overlay` win on conflict); `hosts`/`containers`/`pods`/`tasks`/`aliases`
/// shallow-merge (an overlay entry replaces a base entry with the same key
/// wholesale, it does not merge fields within the entry).
#[must_use]
pub fn merge_configuration(mut base: Configuration, overlay: Configuration) -> Configuration {
    base.defaults = merge_defaults(base.defaults, overlay.defaults);
    extend_map(&mut base.hosts, overlay.hosts);
    extend_map(&mut base.containers, overlay.containers);
    extend_map(&mut base.pods, overlay.pods);
    extend_map(&mut base.profiles, overlay.profiles);
    extend_map(&mut base.tasks, overlay.tasks);
    extend_map(&mut base.aliases, overlay.aliases);
    base
}

/// Merge two `defaults:` sections; `env` deep-merges, scalar fields take the
/// overlay's value when present.
#[must_use]
pub fn merge_defaults(mut base: Defaults, overlay: Defaults) -> Defaults {
    if overlay.timeout.is_some() {
        base.timeout = overlay.timeout;
    }
    if overlay.shell.is_some() {
        base.shell = overlay.shell;
    }
    if overlay.cwd.is_some() {
        base.cwd = overlay.cwd;
    }
    if overlay.encoding.is_some() {
        base.encoding = overlay.encoding;
    }
    if overlay.throw_on_non_zero_exit.is_some() {
        base.throw_on_non_zero_exit = overlay.throw_on_non_zero_exit;
    }
    for (k, v) in overlay.env {
        base.env.insert(k, v);
    }
    base
}

fn extend_map<K: std::hash::Hash + Eq, V>(base: &mut HashMap<K, V>, overlay: HashMap<K, V>) {
    for (k, v) in overlay {
        base.insert(k, v);
    }
}

/// Flatten a profile's `extends` chain into a single effective overlay,
/// applying ancestors first so the named profile's own fields win.
///
/// # Errors
/// Returns `XecError::ProfileCycle` if the `extends` chain revisits a
/// profile already on the current resolution path.
pub fn resolve_profile(profiles: &HashMap<String, Profile>, name: &str) -> XecResult<Profile> {
    let mut stack = HashSet::new();
    resolve_profile_inner(profiles, name, &mut stack)
}

fn resolve_profile_inner(profiles: &HashMap<String, Profile>, name: &str, stack: &mut HashSet<String>) -> XecResult<Profile> {
    if !stack.insert(name.to_string()) {
        return Err(XecError::ProfileCycle(format!(
            "profile '{name}' is part of an extends cycle: {}",
            stack.iter().cloned().collect::<Vec<_>>().join(" -> ")
        )));
    }
    let profile = profiles
        .get(name)
        .ok_or_else(|| XecError::ConfigInvalid(format!("profile '{name}' does not exist")))?
        .clone();

    let flattened = match &profile.extends {
        Some(parent_name) => {
            let parent = resolve_profile_inner(profiles, parent_name, stack)?;
            merge_profile(parent, profile)
        }
        None => profile,
    };
    stack.remove(name);
    Ok(flattened)
}

fn merge_profile(mut base: Profile, overlay: Profile) -> Profile {
    base.defaults = match (base.defaults.take(), overlay.defaults) {
        (Some(b), Some(o)) => Some(merge_defaults(b, o)),
        (Some(b), None) => Some(b),
        (None, o) => o,
    };
    extend_map(&mut base.hosts, overlay.hosts);
    extend_map(&mut base.containers, overlay.containers);
    extend_map(&mut base.pods, overlay.pods);
    base.extends = overlay.extends.or(base.extends);
    base
}

/// Apply a resolved profile overlay onto the base configuration.
#[must_use]
pub fn apply_profile(mut config: Configuration, profile: Profile) -> Configuration {
    if let Some(defaults) = profile.defaults {
        config.defaults = merge_defaults(config.defaults, defaults);
    }
    extend_map(&mut config.hosts, profile.hosts);
    extend_map(&mut config.containers, profile.containers);
    extend_map(&mut config.pods, profile.pods);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_cycle_is_detected() {
        let mut profiles = HashMap::new();
        profiles.insert("a".to_string(), Profile { extends: Some("b".to_string()), ..Default::default() });
        profiles.insert("b".to_string(), Profile { extends: Some("a".to_string()), ..Default::default() });
        let err = resolve_profile(&profiles, "a").unwrap_err();
        assert!(matches!(err, XecError::ProfileCycle(_)));
    }

    #[test]
    fn extends_chain_flattens_in_ancestor_first_order() {
        let mut profiles = HashMap::new();
        let mut base_defaults = Defaults::default();
        base_defaults.timeout = Some("10s".to_string());
        profiles.insert("base".to_string(), Profile { defaults: Some(base_defaults), ..Default::default() });

        let mut child_defaults = Defaults::default();
        child_defaults.shell = Some(super::super::schema::ShellSetting::Toggle(true));
        profiles.insert(
            "child".to_string(),
            Profile { extends: Some("base".to_string()), defaults: Some(child_defaults), ..Default::default() },
        );

        let flattened = resolve_profile(&profiles, "child").unwrap();
        let defaults = flattened.defaults.unwrap();
        assert_eq!(defaults.timeout.as_deref(), Some("10s"));
        assert!(matches!(defaults.shell, Some(super::super::schema::ShellSetting::Toggle(true))));
    }

    #[test]
    fn env_deep_merges_while_hosts_shallow_merge() {
        let mut base = Configuration::default();
        base.defaults.env.insert("A".to_string(), "1".to_string());
        base.hosts.insert(
            "web".to_string(),
            super::super::schema::HostSpec { host: "old".to_string(), ..Default::default() },
        );

        let mut overlay = Configuration::default();
        overlay.defaults.env.insert("B".to_string(), "2".to_string());
        overlay.hosts.insert(
            "web".to_string(),
            super::super::schema::HostSpec { host: "new".to_string(), ..Default::default() },
        );

        let merged = merge_configuration(base, overlay);
        assert_eq!(merged.defaults.env.get("A"), Some(&"1".to_string()));
        assert_eq!(merged.defaults.env.get("B"), Some(&"2".to_string()));
        assert_eq!(merged.hosts["web"].host, "new");
    }
}
