//! Configuration handling for the CLI

use anyhow::{Context, Result};
use leyline_lib::config::AppConfig;
use leyline_lib::RunOptions;
use std::path::{Path, PathBuf};
use tracing::info;

/// Loaded configuration and the file it came from
pub struct Settings {
    pub path: PathBuf,
    pub app: AppConfig,
}

impl Settings {
    /// Load and validate the configuration file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!(
                "configuration file {:?} is missing; create it or pass --config",
                path
            );
        }

        let app = AppConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        app.validate()?;

        Ok(Self {
            path: path.to_path_buf(),
            app,
        })
    }

    /// Combine command-line overrides into per-run options
    pub fn run_options(&self, reset: bool, update: bool, model: bool) -> RunOptions {
        RunOptions {
            force_update: update,
            force_retrain: model || reset,
            reset,
        }
    }

    /// Reset the one-shot reset flags in the file once they have been honoured
    pub fn clear_one_shot_flags(&self, data: bool, model: bool) -> Result<()> {
        let flags = [
            ("force_data_reset", data && self.app.force_data_reset),
            ("force_model_reset", model && self.app.force_model_reset),
        ];

        for (key, honoured) in flags {
            if honoured {
                AppConfig::clear_flag(&self.path, key)
                    .with_context(|| format!("Failed to clear {} in {}", key, self.path.display()))?;
                info!(flag = key, "Cleared one-shot configuration flag");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: serde_json::Value) -> PathBuf {
        let snapshot = dir.path().join("workbook.json");
        std::fs::write(&snapshot, "{}").unwrap();

        let mut body = body;
        body["sheet"] = serde_json::Value::String(snapshot.display().to_string());
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&body).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_missing_file_is_actionable() {
        let dir = TempDir::new().unwrap();
        let err = Settings::load(&dir.path().join("nope.json")).err().unwrap();
        assert!(err.to_string().contains("--config"));
    }

    #[test]
    fn test_reset_implies_retrain() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, serde_json::json!({ "regions": ["Mondstadt"] }));
        let settings = Settings::load(&path).unwrap();

        let options = settings.run_options(true, false, false);
        assert!(options.reset);
        assert!(options.force_retrain);
        assert!(!options.force_update);
    }

    #[test]
    fn test_clears_only_honoured_flags() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            serde_json::json!({
                "regions": ["Mondstadt"],
                "force_data_reset": true,
                "force_model_reset": true,
            }),
        );
        let settings = Settings::load(&path).unwrap();
        settings.clear_one_shot_flags(true, false).unwrap();

        let reloaded: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded["force_data_reset"], false);
        assert_eq!(reloaded["force_model_reset"], true);
        assert_eq!(reloaded["regions"][0], "Mondstadt");
    }
}
