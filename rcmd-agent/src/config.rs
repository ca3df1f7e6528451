//! Agent configuration read from the environment.

use std::path::PathBuf;

/// Overrides the directory nohup rendezvous directories are created in.
pub const ENV_SCRATCH_DIR: &str = "RCMD_SCRATCH_DIR";

/// `tracing` filter directive for the agent's own diagnostics.
pub const ENV_LOG: &str = "RCMD_LOG";

/// Filter used when [`ENV_LOG`] is unset.
pub const DEFAULT_LOG: &str = "warn";

/// Runtime settings of a slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Parent directory of `cmd_XXXX` rendezvous directories.
    pub scratch_root: PathBuf,
    /// Log filter directive.
    pub log_filter: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("/tmp"),
            log_filter: DEFAULT_LOG.to_owned(),
        }
    }
}

impl AgentConfig {
    /// Builds the configuration from `RCMD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(dir) = lookup(ENV_SCRATCH_DIR).filter(|d| !d.is_empty()) {
            cfg.scratch_root = PathBuf::from(dir);
        }
        if let Some(filter) = lookup(ENV_LOG).filter(|f| !f.is_empty()) {
            cfg.log_filter = filter;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = AgentConfig::from_lookup(|_| None);
        assert_eq!(cfg, AgentConfig::default());
        assert_eq!(cfg.scratch_root, PathBuf::from("/tmp"));
    }

    #[test]
    fn env_overrides() {
        let cfg = AgentConfig::from_lookup(|k| match k {
            ENV_SCRATCH_DIR => Some("/var/tmp/rcmd".into()),
            ENV_LOG => Some("debug".into()),
            _ => None,
        });
        assert_eq!(cfg.scratch_root, PathBuf::from("/var/tmp/rcmd"));
        assert_eq!(cfg.log_filter, "debug");
    }

    #[test]
    fn empty_values_are_ignored() {
        let cfg = AgentConfig::from_lookup(|_| Some(String::new()));
        assert_eq!(cfg, AgentConfig::default());
    }
}
