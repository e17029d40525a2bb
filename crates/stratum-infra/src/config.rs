//! Configuration loader for stratum.
//!
//! Reads `config.toml` from the data directory (`~/.stratum/` in production)
//! and deserializes it into [`StratumConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::{Path, PathBuf};

use stratum_types::config::StratumConfig;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "STRATUM_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STRATUM_DATA_DIR` environment variable
/// 2. `~/.stratum`
/// 3. `./.stratum`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stratum");
    }

    PathBuf::from(".stratum")
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: returns [`StratumConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> StratumConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return StratumConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return StratumConfig::default();
        }
    };

    match toml::from_str::<StratumConfig>(&content) {
        Ok(config) => {
            tracing::debug!(
                integrations = config.integrations.len(),
                channels = config.notification_channels.len(),
                "loaded {}",
                config_path.display()
            );
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            StratumConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_types::config::{NotificationChannelKind, OverlapPolicy};
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config.engine.integration_timeout_secs, 30);
        assert!(config.integrations.is_empty());
    }

    #[tokio::test]
    async fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
overlap_policy = "queue"
max_iterations = 50

[[integrations]]
id = "crm"
platform_type = "rest"
base_url = "http://localhost:9000"
timeout_secs = 5

[[notification_channels]]
name = "audit"
kind = "log"
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.engine.overlap_policy, OverlapPolicy::Queue);
        assert_eq!(config.engine.max_iterations, 50);
        assert_eq!(config.engine.max_loop_depth, 3);
        assert_eq!(config.integrations[0].timeout_secs, Some(5));
        assert_eq!(config.notification_channels[0].kind, NotificationChannelKind::Log);
    }

    #[tokio::test]
    async fn load_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is [not valid toml")
            .await
            .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.server.port, 3000);
    }

    #[tokio::test]
    async fn load_config_wrong_type_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "[engine]\nrun_timeout_secs = \"soon\"\n",
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.engine.run_timeout_secs, 1800);
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: no other test reads or writes STRATUM_DATA_DIR.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, "/tmp/test-stratum");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-stratum"));
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
    }
}
