//! Engine configuration.
//!
//! Settings are read from `config/docflow.toml` when present, then overlaid
//! with `DOCFLOW__<SECTION>__<KEY>` environment variables. Every value has a
//! default, so an empty environment yields a working engine.
use crate::sequence::{DEFAULT_MAX_ATTEMPTS, DEFAULT_PAD_WIDTH, NumberFormat, Numbering};
use crate::workflow::DocumentKind;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "config/docflow.toml";
const ENV_PREFIX: &str = "DOCFLOW";

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,
    #[serde(default = "default_flush_every_ms")]
    pub flush_every_ms: Option<u64>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/docflow.sled")
}

fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024
}

fn default_flush_every_ms() -> Option<u64> {
    Some(500)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            temporary: false,
            cache_capacity_bytes: default_cache_capacity(),
            flush_every_ms: default_flush_every_ms(),
        }
    }
}

impl StoreConfig {
    /// In-memory store that is discarded on drop; used by demos and tests.
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    /// Number format overrides keyed by document kind code, e.g. `expense_log`.
    #[serde(default)]
    pub numbering: HashMap<String, NumberFormat>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from the default file location (optional) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|err| {
                ConfigError::Message(format!(
                    "failed to read configuration from {} and environment: {err}",
                    path.display()
                ))
            })?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allocation.max_attempts == 0 {
            return Err(ConfigError::Message(
                "allocation.max_attempts must be at least 1".to_string(),
            ));
        }
        self.numbering_table().map(|_| ())
    }

    /// Resolves the `numbering` section into per-kind formats.
    pub fn numbering_table(&self) -> Result<Numbering, ConfigError> {
        let mut numbering = Numbering::default();
        for (code, format) in &self.numbering {
            let kind: DocumentKind = code
                .parse()
                .map_err(|_| ConfigError::Message(format!("numbering: unknown document kind '{code}'")))?;
            if format.prefix.trim().is_empty() {
                return Err(ConfigError::Message(format!("numbering.{code}: prefix must not be empty")));
            }
            if !(1..=12).contains(&format.pad_width) {
                return Err(ConfigError::Message(format!(
                    "numbering.{code}: pad_width must be within 1..=12"
                )));
            }
            numbering = numbering.with_override(kind, format.clone());
        }
        Ok(numbering)
    }
}
