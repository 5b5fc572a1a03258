use crate::fs::ensure_directory_exists;
use anyhow::{Context, Result};
use config::ConfigError;
use portal_feed::{ReducerConfig, StreamConfig, WarmUp};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use url::Url;
use walrus_pool::{MirrorPool, MirrorPoolConfig};

const DEFAULT_STREAM_URL: &str = "http://127.0.0.1:8787/events";
const DEFAULT_PACKAGE_ID: &str = "0x0";
const DEFAULT_WARM_UP_MS: u64 = 2_000;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_EPOCHS: u32 = 1;
const DEFAULT_MIRRORS: &[&str] = &[
    "https://publisher.walrus-testnet.walrus.space",
    "https://wal-publisher-testnet.staketab.org",
];

/// Prefix of environment variables that override the config file, e.g.
/// `PORTAL_STREAM__API_KEY`.
const ENV_PREFIX: &str = "PORTAL";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub stream: Stream,
    pub storage: Storage,
}

impl Config {
    pub fn read<D>(config_file: D) -> Result<Self, ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        let config = config::Config::builder()
            .add_source(config::File::from(config_file))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Self>()?;

        config.stream.validate().map_err(ConfigError::Message)?;

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream: Stream {
                url: Url::parse(DEFAULT_STREAM_URL).expect("default stream url is valid"),
                api_key: None,
                package_id: DEFAULT_PACKAGE_ID.to_owned(),
                warm_up_ms: DEFAULT_WARM_UP_MS,
                initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
                max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            },
            storage: Storage {
                mirrors: DEFAULT_MIRRORS
                    .iter()
                    .map(|mirror| Url::parse(mirror).expect("default mirror url is valid"))
                    .collect(),
                epochs: DEFAULT_EPOCHS,
            },
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Stream {
    pub url: Url,
    /// Leave unset to run without live updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub package_id: String,
    /// Callbacks are held back for this long after the first event. `0`
    /// notifies about every event, including the replayed backlog.
    #[serde(default = "default_warm_up_ms")]
    pub warm_up_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Stream {
    /// Reject backoff settings that would make the client hammer the server.
    fn validate(&self) -> Result<(), String> {
        if self.initial_backoff_ms == 0 {
            return Err("stream.initial_backoff_ms must be greater than zero".to_owned());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(format!(
                "stream.max_backoff_ms ({}) must not be below stream.initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            ));
        }

        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn reducer_config(&self) -> ReducerConfig {
        let warm_up = match self.warm_up_ms {
            0 => WarmUp::Disabled,
            ms => WarmUp::AfterFirstEvent(Duration::from_millis(ms)),
        };

        ReducerConfig {
            package_id: self.package_id.clone(),
            warm_up,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Storage {
    /// Publisher mirrors, tried in this order.
    pub mirrors: Vec<Url>,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
}

impl Storage {
    pub fn mirror_pool(&self) -> Result<MirrorPool> {
        let pool = MirrorPool::new_with_config(
            self.mirrors.clone(),
            MirrorPoolConfig {
                epochs: self.epochs,
            },
        )
        .context("Invalid storage configuration")?;

        Ok(pool)
    }
}

fn default_warm_up_ms() -> u64 {
    DEFAULT_WARM_UP_MS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn default_epochs() -> u32 {
    DEFAULT_EPOCHS
}

/// No config file exists yet at the expected location.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("No config file at {}, run `portal init` to create one", path.display())]
pub struct ConfigNotInitialized {
    pub path: PathBuf,
}

/// Refused to replace a config file without `--force`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Config file already exists at {}, pass --force to overwrite it", path.display())]
pub struct ConfigExists {
    pub path: PathBuf,
}

/// Read the config file, or report that `portal init` has not been run yet.
pub fn read_config(config_path: &Path) -> Result<Result<Config, ConfigNotInitialized>> {
    if !config_path.exists() {
        return Ok(Err(ConfigNotInitialized {
            path: config_path.to_path_buf(),
        }));
    }

    let config = Config::read(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    info!(path = %config_path.display(), "Loaded config file");

    Ok(Ok(config))
}

/// Write `config` as TOML, creating parent directories as needed.
///
/// An existing file is only replaced when `overwrite` is set.
pub fn write_config(config_path: &Path, config: &Config, overwrite: bool) -> Result<()> {
    if config_path.exists() && !overwrite {
        return Err(ConfigExists {
            path: config_path.to_path_buf(),
        }
        .into());
    }

    ensure_directory_exists(config_path)?;
    let toml = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(config_path, toml)
        .with_context(|| format!("Failed to write config file at {}", config_path.display()))?;

    info!(path = %config_path.display(), overwrite, "Wrote config file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::tempdir;

    #[test]
    fn config_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let expected = Config {
            stream: Stream {
                url: Url::from_str("https://notify.example.com/events").unwrap(),
                api_key: Some("key".to_owned()),
                package_id: "0xP".to_owned(),
                warm_up_ms: 0,
                initial_backoff_ms: 500,
                max_backoff_ms: 8_000,
            },
            storage: Storage {
                mirrors: vec![
                    Url::from_str("https://a.example.com").unwrap(),
                    Url::from_str("https://b.example.com").unwrap(),
                ],
                epochs: 5,
            },
        };

        write_config(&config_path, &expected, false).unwrap();
        let actual = read_config(&config_path).unwrap().unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn missing_file_is_not_initialized() {
        let temp_dir = tempdir().unwrap();

        let config_path = temp_dir.path().join("config.toml");

        let result = read_config(&config_path).unwrap();

        assert_eq!(result, Err(ConfigNotInitialized { path: config_path }));
    }

    #[test]
    fn existing_file_is_only_replaced_with_overwrite() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let mut config = Config::default();
        write_config(&config_path, &config, false).unwrap();

        config.stream.package_id = "0xNew".to_owned();
        let error = write_config(&config_path, &config, false).unwrap_err();
        assert!(error.downcast_ref::<ConfigExists>().is_some());
        assert_eq!(
            read_config(&config_path).unwrap().unwrap().stream.package_id,
            DEFAULT_PACKAGE_ID
        );

        write_config(&config_path, &config, true).unwrap();
        assert_eq!(
            read_config(&config_path).unwrap().unwrap().stream.package_id,
            "0xNew"
        );
    }

    #[test]
    fn optional_fields_take_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
            [stream]
            url = "https://notify.example.com/events"
            package_id = "0xP"

            [storage]
            mirrors = ["https://a.example.com"]
            "#,
        )
        .unwrap();

        let config = Config::read(&config_path).unwrap();

        assert_eq!(config.stream.warm_up_ms, DEFAULT_WARM_UP_MS);
        assert_eq!(config.storage.epochs, DEFAULT_EPOCHS);
        assert_eq!(
            config.stream.reducer_config().warm_up,
            WarmUp::AfterFirstEvent(Duration::from_secs(2))
        );
        assert_eq!(
            config.stream.stream_config().max_backoff,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn zero_warm_up_disables_suppression() {
        let mut stream = Config::default().stream;
        stream.warm_up_ms = 0;

        assert_eq!(stream.reducer_config().warm_up, WarmUp::Disabled);
    }

    #[test]
    fn zero_initial_backoff_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
            [stream]
            url = "https://notify.example.com/events"
            package_id = "0xP"
            initial_backoff_ms = 0

            [storage]
            mirrors = ["https://a.example.com"]
            "#,
        )
        .unwrap();

        let error = Config::read(&config_path).unwrap_err();

        assert!(error.to_string().contains("initial_backoff_ms"));
    }

    #[test]
    fn max_backoff_below_initial_is_rejected() {
        let mut stream = Config::default().stream;
        stream.initial_backoff_ms = 5_000;
        stream.max_backoff_ms = 1_000;

        assert!(stream.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
            [stream]
            url = "https://notify.example.com/events"
            package_id = "0xP"
            colour = "blue"

            [storage]
            mirrors = ["https://a.example.com"]
            "#,
        )
        .unwrap();

        assert!(Config::read(&config_path).is_err());
    }

    #[test]
    fn empty_mirror_list_is_rejected() {
        let mut storage = Config::default().storage;
        storage.mirrors.clear();

        assert!(storage.mirror_pool().is_err());
    }
}
