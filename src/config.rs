//! Typed configuration: storage path, radio endpoint, resync timing, and the default pod
//! limits used to bootstrap a fresh `PodRecord` when no persisted one exists yet.

use serde::{Deserialize, Serialize};

use crate::pod::Hundredths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdmConfig {
    pub storage_path: String,
    pub radio_host: String,
    pub radio_port: u16,

    /// Seconds slept before the interim-resync status probe. Overridable so tests don't
    /// actually block for 15 real seconds.
    pub resync_sleep_before_secs: u64,
    /// Seconds slept after the interim-resync status probe.
    pub resync_sleep_after_secs: u64,

    pub default_maximum_bolus: Hundredths,
    pub default_maximum_temp_basal: Hundredths,
    pub default_reservoir: Hundredths,
    pub default_utc_offset_minutes: i32,
}

impl Default for PdmConfig {
    fn default() -> Self {
        Self {
            storage_path: "pod.json".to_string(),
            radio_host: "127.0.0.1".to_string(),
            radio_port: 8282,
            resync_sleep_before_secs: 15,
            resync_sleep_after_secs: 5,
            default_maximum_bolus: 3000,
            default_maximum_temp_basal: 3000,
            default_reservoir: 5000,
            default_utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("configured pod limit out of range: {0}")]
    OutOfRange(String),
}

impl PdmConfig {
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let bytes = tokio::fs::read(path).await?;
        let config: PdmConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn radio_addr(&self) -> String {
        format!("{}:{}", self.radio_host, self.radio_port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        const MAX_RESERVOIR: Hundredths = 20_000; // 200 U, generously above any real pod capacity
        if self.default_maximum_bolus == 0 || self.default_maximum_bolus > MAX_RESERVOIR {
            return Err(ConfigError::OutOfRange(format!(
                "default_maximum_bolus {} is out of range",
                self.default_maximum_bolus
            )));
        }
        if self.default_reservoir > MAX_RESERVOIR {
            return Err(ConfigError::OutOfRange(format!(
                "default_reservoir {} is out of range",
                self.default_reservoir
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_minimal_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"radio_port": 9000}"#).await.unwrap();

        let config = PdmConfig::from_file(&path).await.unwrap();
        assert_eq!(config.radio_port, 9000);
        assert_eq!(config.radio_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn rejects_out_of_range_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"default_maximum_bolus": 999999}"#).await.unwrap();

        let result = PdmConfig::from_file(&path).await;
        assert!(matches!(result, Err(ConfigError::OutOfRange(_))));
    }
}
