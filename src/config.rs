//! Configuration loading.
//!
//! A TOML-backed settings file with env var overrides, covering every
//! tunable the detection and persistence pipeline exposes. Invalid values
//! are rejected at load time, never silently defaulted.

use std::collections::HashMap;
use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, SentinelError};
use crate::orchestrator::PersistenceLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub level: PersistenceLevel,
    #[serde(default = "default_min_locations")]
    pub min_required_locations: u32,
    #[serde(default = "default_true")]
    pub auto_refresh: bool,
    #[serde(default = "default_refresh_hours")]
    pub refresh_hours: u32,
}

fn default_min_locations() -> u32 {
    5
}
fn default_true() -> bool {
    true
}
fn default_refresh_hours() -> u32 {
    24
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            level: PersistenceLevel::Advanced,
            min_required_locations: default_min_locations(),
            auto_refresh: default_true(),
            refresh_hours: default_refresh_hours(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CryptoAlgorithm {
    AeadA,
    AeadB,
    StreamMac,
    BlockCtrMac,
    Polymorphic,
}

impl Default for CryptoAlgorithm {
    fn default() -> Self {
        CryptoAlgorithm::Polymorphic
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default)]
    pub algorithm: CryptoAlgorithm,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    #[serde(default = "default_rotation_hours")]
    pub key_rotation_hours: u32,
}

fn default_kdf_iterations() -> u32 {
    10_000
}
fn default_rotation_hours() -> u32 {
    24 * 7
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            algorithm: CryptoAlgorithm::default(),
            kdf_iterations: default_kdf_iterations(),
            key_rotation_hours: default_rotation_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlConfig {
    #[serde(default)]
    pub detection_threshold: HashMap<String, f32>,
    #[serde(default)]
    pub confidence_threshold: HashMap<String, f32>,
    #[serde(default)]
    pub auto_threshold: bool,
    #[serde(default = "default_target_fp_rate")]
    pub target_fp_rate: f32,
}

fn default_target_fp_rate() -> f32 {
    0.01
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            detection_threshold: HashMap::new(),
            confidence_threshold: HashMap::new(),
            auto_threshold: false,
            target_fp_rate: default_target_fp_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_actions")]
    pub max_actions_per_minute: u32,
    #[serde(default = "default_trust_decay")]
    pub trust_decay: f32,
    #[serde(default = "default_trust_recovery")]
    pub trust_recovery: f32,
}

fn default_max_actions() -> u32 {
    600
}
fn default_trust_decay() -> f32 {
    0.1
}
fn default_trust_recovery() -> f32 {
    0.001
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_actions_per_minute: default_max_actions(),
            trust_decay: default_trust_decay(),
            trust_recovery: default_trust_recovery(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Where flushed entries live on disk. `None` keeps the log in-memory
    /// only, and `next_id` resets to 1 on every restart.
    #[serde(default)]
    pub log_path: Option<String>,
}

fn default_retention_days() -> u32 {
    90
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7420".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub ml: MlConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl SentinelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SentinelError::with_source(
                ErrorKind::IoUnavailable(format!(
                    "cannot read config file {}",
                    path.as_ref().display()
                )),
                e,
            )
        })?;
        let cfg: SentinelConfig = toml::from_str(&text).map_err(|e| {
            SentinelError::with_source(
                ErrorKind::InvalidInput(format!(
                    "malformed config file {}",
                    path.as_ref().display()
                )),
                e,
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("SENTINEL_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("SENTINEL_MIN_LOCATIONS") {
            if let Ok(n) = v.parse() {
                self.persistence.min_required_locations = n;
            }
        }
        if let Ok(v) = std::env::var("SENTINEL_RETENTION_DAYS") {
            if let Ok(n) = v.parse() {
                self.audit.retention_days = n;
            }
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.persistence.min_required_locations == 0 {
            return Err(ErrorKind::InvalidInput(
                "persistence.min_required_locations must be >= 1".into(),
            )
            .into());
        }
        if self.crypto.kdf_iterations < 10_000 {
            return Err(ErrorKind::InvalidInput(
                "crypto.kdf_iterations must be >= 10000".into(),
            )
            .into());
        }
        if !(0.0..=1.0).contains(&self.ml.target_fp_rate) {
            return Err(ErrorKind::InvalidInput(
                "ml.target_fp_rate must be within [0,1]".into(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = SentinelConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_min_locations() {
        let mut cfg = SentinelConfig::default();
        cfg.persistence.min_required_locations = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_low_kdf_iterations() {
        let mut cfg = SentinelConfig::default();
        cfg.crypto.kdf_iterations = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_override_bind_addr() {
        std::env::set_var("SENTINEL_BIND_ADDR", "0.0.0.0:9000");
        let cfg = SentinelConfig::default().from_env_overrides();
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:9000");
        std::env::remove_var("SENTINEL_BIND_ADDR");
    }
}
