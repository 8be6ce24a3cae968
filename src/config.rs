use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::permissions::TrustLevel;

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "SandboxConfig::default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "SandboxConfig::default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "SandboxConfig::default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "SandboxConfig::default_max_array_size")]
    pub max_array_size: usize,
    #[serde(default = "SandboxConfig::default_max_map_size")]
    pub max_map_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "EngineConfig::default_execution_workers")]
    pub execution_workers: usize,
    #[serde(default = "EngineConfig::default_maintenance_workers")]
    pub maintenance_workers: usize,
    /// Maximum number of scripts sharing one isolation domain.
    #[serde(default = "EngineConfig::default_domain_capacity")]
    pub domain_capacity: usize,
    #[serde(default = "EngineConfig::default_max_domains")]
    pub max_domains: usize,
    #[serde(default = "EngineConfig::default_trust_level")]
    pub default_trust_level: TrustLevel,
    /// Per-function trust requirements layered over the built-in capability table.
    #[serde(default)]
    pub function_trust: HashMap<String, TrustLevel>,
    /// Handler wall-clock budget in milliseconds. Zero disables the limit.
    #[serde(default = "EngineConfig::default_max_handler_ms")]
    pub max_handler_ms: u64,
    #[serde(default = "EngineConfig::default_max_consecutive_faults")]
    pub max_consecutive_faults: u32,
    #[serde(default = "EngineConfig::default_load_retry_limit")]
    pub load_retry_limit: u32,
    #[serde(default = "EngineConfig::default_error_fetch_timeout_ms")]
    pub error_fetch_timeout_ms: u64,
    #[serde(default = "EngineConfig::default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    #[serde(default = "EngineConfig::default_detect_history")]
    pub detect_history: usize,
    #[serde(default = "EngineConfig::default_top_scripts_limit")]
    pub top_scripts_limit: usize,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl SandboxConfig {
    const fn default_max_operations() -> u64 {
        1_000_000
    }

    const fn default_max_call_levels() -> usize {
        32
    }

    const fn default_max_string_size() -> usize {
        64 * 1024
    }

    const fn default_max_array_size() -> usize {
        16 * 1024
    }

    const fn default_max_map_size() -> usize {
        4 * 1024
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: Self::default_max_operations(),
            max_call_levels: Self::default_max_call_levels(),
            max_string_size: Self::default_max_string_size(),
            max_array_size: Self::default_max_array_size(),
            max_map_size: Self::default_max_map_size(),
        }
    }
}

impl EngineConfig {
    const fn default_execution_workers() -> usize {
        4
    }

    const fn default_maintenance_workers() -> usize {
        2
    }

    const fn default_domain_capacity() -> usize {
        15
    }

    const fn default_max_domains() -> usize {
        256
    }

    fn default_trust_level() -> TrustLevel {
        TrustLevel::Moderate
    }

    const fn default_max_handler_ms() -> u64 {
        5_000
    }

    const fn default_max_consecutive_faults() -> u32 {
        3
    }

    const fn default_load_retry_limit() -> u32 {
        3
    }

    const fn default_error_fetch_timeout_ms() -> u64 {
        5_000
    }

    const fn default_maintenance_interval_ms() -> u64 {
        250
    }

    const fn default_detect_history() -> usize {
        16
    }

    const fn default_top_scripts_limit() -> usize {
        100
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read engine config {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse engine config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("Engine config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn handler_budget(&self) -> Option<Duration> {
        (self.max_handler_ms > 0).then(|| Duration::from_millis(self.max_handler_ms))
    }

    pub fn error_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.error_fetch_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_workers: Self::default_execution_workers(),
            maintenance_workers: Self::default_maintenance_workers(),
            domain_capacity: Self::default_domain_capacity(),
            max_domains: Self::default_max_domains(),
            default_trust_level: Self::default_trust_level(),
            function_trust: HashMap::new(),
            max_handler_ms: Self::default_max_handler_ms(),
            max_consecutive_faults: Self::default_max_consecutive_faults(),
            load_retry_limit: Self::default_load_retry_limit(),
            error_fetch_timeout_ms: Self::default_error_fetch_timeout_ms(),
            maintenance_interval_ms: Self::default_maintenance_interval_ms(),
            detect_history: Self::default_detect_history(),
            top_scripts_limit: Self::default_top_scripts_limit(),
            sandbox: SandboxConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_config_fills_defaults() {
        let mut file = NamedTempFile::new().expect("temp config");
        write!(file, r#"{{ "domain_capacity": 4, "function_trust": {{ "say": "trusted" }} }}"#).expect("write config");
        let cfg = EngineConfig::load(file.path()).expect("config should parse");
        assert_eq!(cfg.domain_capacity, 4);
        assert_eq!(cfg.execution_workers, 4);
        assert_eq!(cfg.function_trust.get("say"), Some(&TrustLevel::Trusted));
        assert_eq!(cfg.sandbox.max_call_levels, 32);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = EngineConfig::load_or_default("/definitely/not/here/engine.json");
        assert_eq!(cfg.max_consecutive_faults, 3);
        assert_eq!(cfg.handler_budget(), Some(Duration::from_millis(5_000)));
    }
}
