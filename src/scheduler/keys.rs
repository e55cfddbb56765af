//! Store key naming.

use crate::config::KeysConfig;

/// Fully qualified store keys.
///
/// A non-empty hash tag is appended as `{tag}` so every key lands in the
/// same Redis Cluster slot, which multi-key Lua scripts require.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerKeys {
    pub waiting: String,
    pub working: String,
    pub cleanup_leader: String,
}

impl SchedulerKeys {
    pub fn from_config(config: &KeysConfig) -> Self {
        Self {
            waiting: qualify(config, &config.waiting_set),
            working: qualify(config, &config.working_set),
            cleanup_leader: qualify(config, &config.cleanup_leader_key),
        }
    }
}

impl Default for SchedulerKeys {
    fn default() -> Self {
        Self::from_config(&KeysConfig::default())
    }
}

fn qualify(config: &KeysConfig, name: &str) -> String {
    let tag = config.hash_tag.trim();
    if tag.is_empty() {
        format!("{}{}", config.prefix, name)
    } else {
        format!("{}{}{{{}}}", config.prefix, name, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keys() {
        let keys = SchedulerKeys::default();
        assert_eq!(keys.waiting, "waiting");
        assert_eq!(keys.working, "working");
        assert_eq!(keys.cleanup_leader, "cleanup-leader");
    }

    #[test]
    fn test_prefix_and_hash_tag() {
        let config = KeysConfig {
            prefix: "prod:".to_string(),
            hash_tag: "sched".to_string(),
            ..Default::default()
        };
        let keys = SchedulerKeys::from_config(&config);
        assert_eq!(keys.waiting, "prod:waiting{sched}");
        assert_eq!(keys.working, "prod:working{sched}");
        assert_eq!(keys.cleanup_leader, "prod:cleanup-leader{sched}");
    }
}
