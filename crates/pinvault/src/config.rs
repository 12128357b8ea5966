//! toml configuration
//!
//! ```toml
//! [store]
//! path = "store"
//! label_bits = 14
//! bits_per_level = 2
//!
//! [[credentials.delay_schedule]]
//! attempts = 3
//! delay_secs = 30
//!
//! [[credentials.delay_schedule]]
//! attempts = 5        # no delay_secs: locked until reset
//!
//! [keyblob]
//! key_path = "keyblob.key"
//! os_version = 0
//! os_patchlevel = 0
//! ```
//!
//! every field is optional. relative paths are resolved against the data
//! directory by the caller.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::delay::{Delay, DelaySchedule};
use crate::error::ConfigError;
use crate::tree::TreeGeometry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub credentials: CredentialsConfig,
    pub keyblob: KeyBlobConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub label_bits: u32,
    pub bits_per_level: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let geometry = TreeGeometry::default();
        Self {
            path: PathBuf::from("store"),
            label_bits: geometry.label_bits(),
            bits_per_level: geometry.bits_per_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    /// schedule for credentials inserted without an explicit one
    pub delay_schedule: Vec<DelayEntry>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self { delay_schedule: vec![DelayEntry { attempts: 5, delay_secs: None }] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayEntry {
    pub attempts: u32,
    /// `None` locks the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyBlobConfig {
    pub key_path: PathBuf,
    pub os_version: u32,
    pub os_patchlevel: u32,
}

impl Default for KeyBlobConfig {
    fn default() -> Self {
        Self { key_path: PathBuf::from("keyblob.key"), os_version: 0, os_patchlevel: 0 }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry()?;
        let mut seen = BTreeSet::new();
        if let Some(dup) = self.credentials.delay_schedule.iter().find(|e| !seen.insert(e.attempts)) {
            return Err(ConfigError::Invalid(format!(
                "delay schedule lists {} attempts twice",
                dup.attempts
            )));
        }
        self.delay_schedule()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("delay schedule: {}", e)))
    }

    pub fn geometry(&self) -> Result<TreeGeometry, ConfigError> {
        TreeGeometry::new(self.store.label_bits, self.store.bits_per_level)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn delay_schedule(&self) -> DelaySchedule {
        self.credentials
            .delay_schedule
            .iter()
            .fold(DelaySchedule::new(), |s, e| {
                let delay = e.delay_secs.map(Delay::Seconds).unwrap_or(Delay::Infinite);
                s.with(e.attempts, delay)
            })
    }
}
