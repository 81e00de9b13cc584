use std::sync::LazyLock;

use capture_bus::SessionConfig;
use serde::Deserialize;

const CONFIG_ENV: &str = "FRAMECAP_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FramecapConfig {
    #[serde(flatten)]
    session: SessionConfig,
    output: Option<String>,
}

impl Default for FramecapConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            output: None,
        }
    }
}

impl FramecapConfig {
    fn load() -> Self {
        let Ok(path) = std::env::var(CONFIG_ENV) else {
            return Self::default();
        };
        let parsed = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|json| serde_json::from_str::<Self>(&json).map_err(anyhow::Error::from));
        match parsed {
            Ok(config) => {
                log::info!("loaded config from {}", path);
                config
            }
            Err(e) => {
                log::warn!("ignoring config {}: {:#}, using defaults", path, e);
                Self::default()
            }
        }
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// Output file; defaults to `capture.<ext>` for the configured format.
    pub fn output(&self) -> String {
        self.output
            .clone()
            .unwrap_or_else(|| format!("capture.{}", self.session.format.extension()))
    }
}

pub fn config() -> &'static FramecapConfig {
    static CONFIG: LazyLock<FramecapConfig> = LazyLock::new(FramecapConfig::load);
    &CONFIG
}
