//! File configuration: `--config`, else the user config directory, else defaults

use anyhow::{Context, Result};
use image_analysis::AnalysisConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use task_scheduler::SchedulerConfig;
use tracing::debug;

const APP_DIR: &str = "aerial-qa";
const CONFIG_FILE: &str = "config.toml";

/// Analysis sections at the top level, worker pool under `[scheduler]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(flatten)]
    pub analysis: AnalysisConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Load and validate. An explicit path must exist; the default location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate().context("Invalid analysis configuration")?;
        self.scheduler.validate().context("Invalid scheduler configuration")?;
        Ok(())
    }
}

/// `~/.config/aerial-qa/config.toml` on Linux, the platform equivalent elsewhere
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let file = write_config(
            r#"
[blur]
multi_scale = true

[scheduler]
workers = 2
"#,
        );
        let config = AppConfig::load(Some(file.path()))?;

        assert!(config.analysis.blur.multi_scale);
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.respawn_backoff_ms, 250);
        assert_eq!(config.analysis.noise, AnalysisConfig::default().noise);
        Ok(())
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/aerial-qa.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config("[scheduler]\nworkers = 0\n");
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("workers"));

        let file = write_config("[scoring.bands]\nexcellent = 60\ngood = 70\nacceptable = 55\npoor = 40\n");
        assert!(AppConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_malformed_toml_reports_path() {
        let file = write_config("[blur\n");
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn test_printed_config_loads_back() -> Result<()> {
        let config = AppConfig::default();
        let printed = config.to_toml()?;
        assert!(printed.contains("[scheduler]"));
        assert!(printed.contains("[blur]"));
        assert_eq!(AppConfig::from_toml(&printed)?, config);
        Ok(())
    }
}
