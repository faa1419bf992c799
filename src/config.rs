//! Service configuration, loaded from `loom.toml` with defaults for every
//! missing section. Secrets (inference API key) come from the environment.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct LoomConfig {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub sandbox: SandboxConfig,
    pub limits: Limits,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the env var holding the API key, not the key itself.
    pub api_key_env: String,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub base_url: String,
    /// Timeout for ordinary gateway calls.
    pub request_timeout_secs: u64,
    /// Default timeout handed to `executeCommands`.
    pub command_timeout_secs: u64,
}

/// Bounded-retry knobs. Exhaustion is observable in session state, so these
/// are deliberately small.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub phase_retries: u32,
    pub setup_retries: u32,
    pub fix_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Ordered region fallback list for cross-region session resolution.
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    pub base_url: String,
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3580,
                db_path: std::path::PathBuf::from(".loom/sessions.db"),
                dev_mode: false,
            },
            inference: InferenceConfig {
                base_url: "http://127.0.0.1:8787".to_string(),
                model: "app-coder-large".to_string(),
                api_key_env: "LOOM_INFERENCE_API_KEY".to_string(),
            },
            sandbox: SandboxConfig {
                base_url: "http://127.0.0.1:8788".to_string(),
                request_timeout_secs: 30,
                command_timeout_secs: 180,
            },
            limits: Limits {
                phase_retries: 3,
                setup_retries: 1,
                fix_attempts: 3,
            },
            registry: RegistryConfig { regions: Vec::new() },
        }
    }
}

// Raw TOML structure for `loom.toml`; every field optional.
#[derive(Debug, Deserialize)]
struct LoomToml {
    server: Option<ServerSection>,
    inference: Option<InferenceSection>,
    sandbox: Option<SandboxSection>,
    limits: Option<LimitsSection>,
    registry: Option<RegistrySection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    db_path: Option<String>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InferenceSection {
    base_url: Option<String>,
    model: Option<String>,
    api_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LimitsSection {
    phase_retries: Option<u32>,
    setup_retries: Option<u32>,
    fix_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RegistrySection {
    /// `regions.eu = "https://eu.example.com"` ordering follows declaration.
    regions: Option<Vec<RegionConfig>>,
}

impl LoomConfig {
    /// Load config from the given path. Returns defaults if the file does
    /// not exist; a present-but-invalid file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let toml: LoomToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut config = Self::default();
        if let Some(s) = toml.server {
            if let Some(port) = s.port {
                config.server.port = port;
            }
            if let Some(db_path) = s.db_path {
                config.server.db_path = std::path::PathBuf::from(db_path);
            }
            if let Some(dev_mode) = s.dev_mode {
                config.server.dev_mode = dev_mode;
            }
        }
        if let Some(s) = toml.inference {
            if let Some(base_url) = s.base_url {
                config.inference.base_url = base_url;
            }
            if let Some(model) = s.model {
                config.inference.model = model;
            }
            if let Some(api_key_env) = s.api_key_env {
                config.inference.api_key_env = api_key_env;
            }
        }
        if let Some(s) = toml.sandbox {
            if let Some(base_url) = s.base_url {
                config.sandbox.base_url = base_url;
            }
            if let Some(t) = s.request_timeout_secs {
                config.sandbox.request_timeout_secs = t;
            }
            if let Some(t) = s.command_timeout_secs {
                config.sandbox.command_timeout_secs = t;
            }
        }
        if let Some(s) = toml.limits {
            if let Some(n) = s.phase_retries {
                config.limits.phase_retries = n;
            }
            if let Some(n) = s.setup_retries {
                config.limits.setup_retries = n;
            }
            if let Some(n) = s.fix_attempts {
                config.limits.fix_attempts = n;
            }
        }
        if let Some(s) = toml.registry
            && let Some(regions) = s.regions
        {
            config.registry.regions = regions;
        }

        Ok(config)
    }

    /// Resolve the inference API key from the configured env var.
    pub fn inference_api_key(&self) -> Option<String> {
        std::env::var(&self.inference.api_key_env).ok()
    }

    /// Region fallback order as (name, base_url) pairs.
    pub fn region_order(&self) -> Vec<(String, String)> {
        self.registry
            .regions
            .iter()
            .map(|r| (r.name.clone(), r.base_url.clone()))
            .collect()
    }
}

/// Environment overrides applied after file load; used by `serve`.
pub fn apply_env_overrides(config: &mut LoomConfig, env: &HashMap<String, String>) {
    if let Some(url) = env.get("LOOM_SANDBOX_URL") {
        config.sandbox.base_url = url.clone();
    }
    if let Some(url) = env.get("LOOM_INFERENCE_URL") {
        config.inference.base_url = url.clone();
    }
    if let Some(port) = env.get("LOOM_PORT")
        && let Ok(port) = port.parse()
    {
        config.server.port = port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_config_defaults() {
        let config = LoomConfig::default();
        assert_eq!(config.server.port, 3580);
        assert_eq!(config.limits.phase_retries, 3);
        assert_eq!(config.limits.setup_retries, 1);
        assert_eq!(config.limits.fix_attempts, 3);
        assert!(config.registry.regions.is_empty());
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoomConfig::load(&dir.path().join("loom.toml")).unwrap();
        assert_eq!(config.server.port, 3580);
    }

    #[test]
    fn test_config_load_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loom.toml");
        fs::write(
            &path,
            r#"
[server]
port = 4000
db_path = "/tmp/loom.db"
dev_mode = true

[inference]
base_url = "https://inference.internal"
model = "coder-xl"

[sandbox]
base_url = "https://sandbox.internal"
command_timeout_secs = 600

[limits]
phase_retries = 5
fix_attempts = 2

[[registry.regions]]
name = "us-east"
base_url = "https://us-east.loom.internal"

[[registry.regions]]
name = "eu-west"
base_url = "https://eu-west.loom.internal"
"#,
        )
        .unwrap();

        let config = LoomConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 4000);
        assert!(config.server.dev_mode);
        assert_eq!(config.inference.model, "coder-xl");
        assert_eq!(config.sandbox.command_timeout_secs, 600);
        assert_eq!(config.sandbox.request_timeout_secs, 30); // default
        assert_eq!(config.limits.phase_retries, 5);
        assert_eq!(config.limits.fix_attempts, 2);
        assert_eq!(config.limits.setup_retries, 1); // default
        let regions = config.region_order();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].0, "us-east");
        assert_eq!(regions[1].0, "eu-west");
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loom.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(LoomConfig::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = LoomConfig::default();
        let mut env = HashMap::new();
        env.insert("LOOM_SANDBOX_URL".to_string(), "http://sb:9".to_string());
        env.insert("LOOM_PORT".to_string(), "8123".to_string());
        apply_env_overrides(&mut config, &env);
        assert_eq!(config.sandbox.base_url, "http://sb:9");
        assert_eq!(config.server.port, 8123);
    }
}
