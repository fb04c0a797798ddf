//! Engine configuration.
//!
//! Resource knobs the distilled specification leaves implementation-defined
//! (initial stack/trail capacity, choice-point and step bounds) live here,
//! loaded the way the teacher codebase loads its own manifests: a `serde` +
//! `toml` document with field-level defaults, so a partial file only
//! overrides what it mentions.

use serde::Deserialize;

/// Tunable resource limits for one [`crate::engine::Engine`].
///
/// `EngineConfig::default()` matches the distilled specification's behavior
/// exactly: unbounded choice points, unbounded steps, singleton warnings on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Initial capacity reserved on the data stack.
    pub initial_stack_capacity: usize,
    /// Initial capacity reserved on the trail.
    pub initial_trail_capacity: usize,
    /// Maximum live choice points before the engine raises a fatal error.
    /// `0` means unbounded.
    pub max_choice_points: usize,
    /// Maximum `CCall`/`CLastCall` steps before a run is aborted.
    /// `0` means unbounded.
    pub max_steps: usize,
    /// Whether compilation emits singleton-variable warnings.
    pub warn_singletons: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            initial_stack_capacity: 1024,
            initial_trail_capacity: 256,
            max_choice_points: 0,
            max_steps: 0,
            warn_singletons: true,
        }
    }
}

impl EngineConfig {
    /// Parse an `EngineConfig` from a TOML document. Fields absent from
    /// `text` fall back to their `Default` value individually.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_unbounded_behavior() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_choice_points, 0);
        assert_eq!(cfg.max_steps, 0);
        assert!(cfg.warn_singletons);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg = EngineConfig::from_toml_str("max_steps = 10000\n").unwrap();
        assert_eq!(cfg.max_steps, 10000);
        assert_eq!(cfg.initial_stack_capacity, 1024);
        assert!(cfg.warn_singletons);
    }

    #[test]
    fn empty_toml_is_pure_default() {
        let cfg = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }
}
