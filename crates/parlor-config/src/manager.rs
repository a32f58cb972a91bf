use crate::config::{Config, ConfigError, ConfigResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

/// Owns the on-disk config file and its parsed contents
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Load the config file, writing defaults first if it does not exist
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = tokio::fs::read_to_string(path).await?;
            let content = Self::expand_env_vars(&content)?;
            let config: Config = serde_json::from_str(&content)?;
            Self::validate(&config)?;
            config
        } else {
            info!("Config file not found, creating default config at {:?}", path);
            let default_config = Config::default();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_string_pretty(&default_config)?;
            tokio::fs::write(path, &content).await?;
            default_config
        };

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn save(&self) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(&self.config)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&self.path, content).await?;
        info!("Config saved to {:?}", self.path);
        Ok(())
    }

    /// Apply a change in memory, validate it, then persist it
    pub async fn update<F>(&mut self, f: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut candidate = self.config.clone();
        f(&mut candidate);
        Self::validate(&candidate)?;
        self.config = candidate;
        self.save().await
    }

    pub fn validate(config: &Config) -> ConfigResult<()> {
        if config.server.port == 0 {
            return Err(ConfigError::Validation(
                "Server port cannot be 0".to_string(),
            ));
        }

        let hub = &config.hub;
        if hub.max_connections == 0 {
            return Err(ConfigError::Validation(
                "hub.max_connections must be greater than 0".to_string(),
            ));
        }
        // Room for the welcome plus the client's own join announcement
        if hub.send_queue_capacity < 2 {
            return Err(ConfigError::Validation(
                "hub.send_queue_capacity must be at least 2".to_string(),
            ));
        }
        for (name, value) in [
            ("ping_interval_secs", hub.ping_interval_secs),
            ("read_timeout_secs", hub.read_timeout_secs),
            ("write_timeout_secs", hub.write_timeout_secs),
            ("handshake_timeout_secs", hub.handshake_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "hub.{} must be greater than 0",
                    name
                )));
            }
        }

        // A read timeout shorter than the ping interval would drop healthy idle clients
        if hub.read_timeout_secs <= hub.ping_interval_secs {
            return Err(ConfigError::Validation(
                "hub.read_timeout_secs must be longer than hub.ping_interval_secs".to_string(),
            ));
        }

        Ok(())
    }

    /// Expand `${VAR}` and `${VAR:-default}`
    fn expand_env_vars(content: &str) -> ConfigResult<String> {
        static ENV_VAR: OnceLock<Regex> = OnceLock::new();
        let re = ENV_VAR.get_or_init(|| {
            Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is a valid regex")
        });

        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_expr = &cap[1];

            let (var_name, default_value) = match var_expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_expr, None),
            };

            let replacement = match std::env::var(var_name) {
                Ok(val) => val,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    None => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
                },
            };

            result = result.replace(full_match, &replacement);
        }

        Ok(result)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
