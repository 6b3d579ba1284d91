//! Recognized configuration keys. Configuration file I/O is
//! named as an out-of-scope collaborator by `spec.md` §1, but the typed
//! surface the rest of the server consumes is the real deliverable here —
//! only the thin "read a JSON file if present" step is the collaborator.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use sdr_core::WorkModeKind;

use crate::error::ServerError;

fn default_device_timeout_ms() -> u64 {
    10_000
}

fn default_gnss_system_id() -> u8 {
    1
}

fn default_gnss_component_id() -> u8 {
    1
}

fn default_req_message_rate() -> u32 {
    5
}

fn default_record_send_delay_ms() -> u64 {
    30
}

fn default_store_folder() -> String {
    "records".to_string()
}

fn default_file_cache_time_ms() -> u64 {
    5_000
}

fn default_calibration_folder() -> String {
    "calibration".to_string()
}

/// The payload's recognized configuration keys. Every field
/// has the documented default, via `#[serde(default = "...")]`, so a config
/// file only needs to override what it actually changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,

    #[serde(default = "default_gnss_system_id")]
    pub gnss_system_id: u8,

    #[serde(default = "default_gnss_component_id")]
    pub gnss_component_id: u8,

    #[serde(default = "default_req_message_rate")]
    pub req_message_rate: u32,

    #[serde(default = "default_record_send_delay_ms")]
    pub record_send_delay_ms: u64,

    #[serde(default = "default_store_folder")]
    pub sdr_record_store_folder: String,

    #[serde(default = "default_file_cache_time_ms")]
    pub file_cache_time_ms: u64,

    #[serde(default = "default_calibration_folder")]
    pub calibration_folder: String,

    /// Per-mode map of implementation-name -> enabled; exactly one enabled
    /// entry is expected per mode.
    #[serde(default)]
    pub analyzers: HashMap<WorkModeKind, HashMap<String, bool>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_timeout_ms: default_device_timeout_ms(),
            gnss_system_id: default_gnss_system_id(),
            gnss_component_id: default_gnss_component_id(),
            req_message_rate: default_req_message_rate(),
            record_send_delay_ms: default_record_send_delay_ms(),
            sdr_record_store_folder: default_store_folder(),
            file_cache_time_ms: default_file_cache_time_ms(),
            calibration_folder: default_calibration_folder(),
            analyzers: HashMap::new(),
        }
    }
}

impl Config {
    /// Reads and parses a JSON config file if `path` exists, else returns
    /// `Config::default()`. Never fails on a missing file -- only a present
    /// but malformed one.
    pub fn load(path: &Path) -> Result<Config, ServerError> {
        if !path.exists() {
            log::info!("no config file at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// The single enabled analyzer implementation name for `mode`, if any
    /// is configured.
    pub fn enabled_analyzer(&self, mode: WorkModeKind) -> Option<&str> {
        self.analyzers
            .get(&mode)?
            .iter()
            .find(|(_, enabled)| **enabled)
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.device_timeout_ms, 10_000);
        assert_eq!(config.record_send_delay_ms, 30);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"RecordSendDelayMs": 50}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.record_send_delay_ms, 50);
        assert_eq!(config.device_timeout_ms, 10_000);
    }

    #[test]
    fn analyzers_picks_the_single_enabled_impl() {
        let mut config = Config::default();
        let mut impls = HashMap::new();
        impls.insert("reference".to_string(), true);
        impls.insert("experimental".to_string(), false);
        config.analyzers.insert(WorkModeKind::Llz, impls);
        assert_eq!(config.enabled_analyzer(WorkModeKind::Llz), Some("reference"));
        assert_eq!(config.enabled_analyzer(WorkModeKind::Gp), None);
    }
}
