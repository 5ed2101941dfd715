//! Configuration
//!
//! JSON configuration file with serde defaults for every key, so a partial
//! file (or none at all) yields a fully usable setup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::executor::AutonomyLevel;

/// Metric thresholds for the trigger layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_per_cpu: f64,
    /// Priority<=3 journal records per check pass before an error_rate event.
    pub error_log_rate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            memory_percent: 85.0,
            disk_percent: 90.0,
            load_per_cpu: 2.0,
            error_log_rate: 10.0,
        }
    }
}

/// Inference backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend_url: String,
    /// Default model when a layer does not name its own.
    pub model: String,
    pub trigger_model: String,
    pub review_model: String,
    pub meta_model: String,
    /// Optional tokenizer.json for accurate token counting. The len/4
    /// heuristic is used when absent; behaviour is identical either way.
    pub tokenizer_path: Option<PathBuf>,
    /// Declared context capacity of the configured models.
    pub model_context_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:11434".to_string(),
            model: "qwen3:14b".to_string(),
            trigger_model: "qwen3:1b".to_string(),
            review_model: "qwen3:4b".to_string(),
            meta_model: "qwen3:14b".to_string(),
            tokenizer_path: None,
            model_context_size: 131072,
        }
    }
}

/// Notification transport settings. Absent URL means log-only delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between trigger passes.
    pub trigger_interval: u64,
    /// Seconds between review passes.
    pub review_interval: u64,
    /// Token budget for the context window.
    pub context_size: usize,
    pub autonomy_level: AutonomyLevel,
    pub thresholds: Thresholds,
    pub inference: InferenceConfig,
    pub notify: NotifyConfig,
    pub state_dir: PathBuf,
    /// Units the trigger layer always watches.
    pub critical_services: Vec<String>,
    /// Units the executor refuses to restart, regardless of autonomy.
    pub protected_services: Vec<String>,
    /// Whether log_pattern events get a small-model classification attached.
    pub use_trigger_model: bool,
    /// Whether the vector store loads an embedding model; disabled it falls
    /// back to token-overlap recall.
    pub semantic_embeddings: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trigger_interval: 30,
            review_interval: 60,
            context_size: 131072,
            autonomy_level: AutonomyLevel::Suggest,
            thresholds: Thresholds::default(),
            inference: InferenceConfig::default(),
            notify: NotifyConfig::default(),
            state_dir: PathBuf::from("/var/lib/ai-sysadmin"),
            critical_services: default_critical_services(),
            protected_services: crate::safety::default_protected_units(),
            use_trigger_model: true,
            semantic_embeddings: true,
        }
    }
}

fn default_critical_services() -> Vec<String> {
    [
        "sshd",
        "systemd-networkd",
        "NetworkManager",
        "systemd-resolved",
        "dbus",
        "systemd-journald",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Load configuration from a JSON file. A missing file yields defaults;
    /// a malformed file is an error (fatal at init, per the error policy).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        info!(
            "Loaded config: autonomy={:?}, trigger_interval={}s, review_interval={}s",
            config.autonomy_level, config.trigger_interval, config.review_interval
        );
        Ok(config)
    }

    /// Ensure the state directory exists and is writable. Fatal when not.
    pub fn ensure_state_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("state directory {:?} is not writable", self.state_dir))?;
        let probe = self.state_dir.join(".write_probe");
        std::fs::write(&probe, b"ok")
            .with_context(|| format!("state directory {:?} is not writable", self.state_dir))?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }

    /// Clamp the configured context budget to 75% of the model capacity.
    pub fn effective_context_size(&self) -> usize {
        let cap = (self.inference.model_context_size * 3) / 4;
        if self.context_size > cap {
            warn!(
                "Configured context size {} exceeds 75% of model capacity {}; clamping to {}",
                self.context_size, self.inference.model_context_size, cap
            );
            cap
        } else {
            self.context_size
        }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/ai-sysadmin/config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load(Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(config.trigger_interval, 30);
        assert_eq!(config.review_interval, 60);
        assert_eq!(config.autonomy_level, AutonomyLevel::Suggest);
        assert_eq!(config.thresholds.cpu_percent, 90.0);
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"trigger_interval": 10, "autonomy_level": "auto-safe", "thresholds": {"cpu_percent": 75.0}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.trigger_interval, 10);
        assert_eq!(config.autonomy_level, AutonomyLevel::AutoSafe);
        assert_eq!(config.thresholds.cpu_percent, 75.0);
        // Untouched keys keep their defaults.
        assert_eq!(config.thresholds.disk_percent, 90.0);
        assert_eq!(config.review_interval, 60);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_context_size_clamped_to_model_capacity() {
        let mut config = Config::default();
        config.context_size = 200_000;
        config.inference.model_context_size = 131072;
        assert_eq!(config.effective_context_size(), 98304);

        config.context_size = 32_000;
        assert_eq!(config.effective_context_size(), 32_000);
    }
}
