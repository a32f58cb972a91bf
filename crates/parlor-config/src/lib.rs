pub mod config;
pub mod manager;

pub use config::{
    Config, ConfigError, ConfigResult, HubConfig, LogLevel, LoggingConfig, ServerConfig,
};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// Expand a leading `~/` to the home directory
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir().map(|home| home.join(rest))
    } else {
        Some(PathBuf::from(path))
    }
}
