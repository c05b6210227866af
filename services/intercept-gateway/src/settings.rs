//! Gateway settings
//!
//! An optional TOML file (`intercept.toml`, or the path in `INTERCEPT_CONFIG`)
//! overlaid by `INTERCEPT_*` environment variables. Nested keys use `__`,
//! e.g. `INTERCEPT_CORE__SUPERVISOR__GRACE_PERIOD_MS=5000`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const CONFIG_PATH_VAR: &str = "INTERCEPT_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "intercept.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    /// Browser UI served at `/` when set
    pub static_dir: Option<PathBuf>,

    /// `tracing` filter directives; `RUST_LOG` wins when present
    pub log_filter: String,

    pub core: intercept_core::Config,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            static_dir: None,
            log_filter: "intercept_gateway=info,intercept_core=info,tower_http=info".to_string(),
            core: intercept_core::Config::default(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("INTERCEPT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
