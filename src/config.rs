// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Driver configuration.
//!
//! A configuration file loader lives outside this crate; what lives here
//! is the typed record the core consumes, its defaults, and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One configured tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolConfig {
    pub name: String,
    pub serial_number: String,
    #[serde(default)]
    pub definition: Option<String>,
    /// Present in some configuration formats but explicitly unsupported;
    /// any non-identity value is rejected by [`DriverConfig::validate`].
    #[serde(default)]
    pub rotation: Option<[f64; 4]>,
    #[serde(default)]
    pub tooltip_offset: [f64; 3],
}

/// Top-level driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Explicit device path; empty triggers discovery.
    #[serde(default)]
    pub serial_port: Option<String>,

    /// Ordered directories searched for `.rom` tool definitions by name.
    #[serde(default)]
    pub definition_path: Vec<PathBuf>,

    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    /// Tracking loop period.
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    /// Read deadline during steady operation.
    #[serde(default = "default_steady_read_timeout_ms")]
    pub steady_read_timeout_ms: u64,

    /// Read deadline during bring-up and reset.
    #[serde(default = "default_bringup_read_timeout_ms")]
    pub bringup_read_timeout_ms: u64,

    /// Bound on the `00000000` serial-number workaround recursion.
    #[serde(default = "default_max_zero_serial_retries")]
    pub max_zero_serial_retries: u32,

    /// Whether to request the stray-marker block on each `TX`.
    #[serde(default)]
    pub track_stray_markers: bool,
}

fn default_tick_period_ms() -> u64 {
    20
}

fn default_steady_read_timeout_ms() -> u64 {
    2_000
}

fn default_bringup_read_timeout_ms() -> u64 {
    5_000
}

fn default_max_zero_serial_retries() -> u32 {
    3
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            serial_port: None,
            definition_path: Vec::new(),
            tools: Vec::new(),
            tick_period_ms: default_tick_period_ms(),
            steady_read_timeout_ms: default_steady_read_timeout_ms(),
            bringup_read_timeout_ms: default_bringup_read_timeout_ms(),
            max_zero_serial_retries: default_max_zero_serial_retries(),
            track_stray_markers: false,
        }
    }
}

impl DriverConfig {
    /// Load from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration; also resolves each tool's `definition`
    /// against `definition_path` if not already absolute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("tick_period_ms must be > 0".into()));
        }
        if self.steady_read_timeout_ms == 0 || self.bringup_read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "read timeouts must be > 0".into(),
            ));
        }

        let mut seen_serials = std::collections::HashSet::new();
        for tool in &self.tools {
            if tool.name.is_empty() {
                return Err(ConfigError::Invalid("tool name must not be empty".into()));
            }
            if tool.serial_number.len() != 8 {
                return Err(ConfigError::Invalid(format!(
                    "tool {:?} serial_number must be exactly 8 characters",
                    tool.name
                )));
            }
            if !seen_serials.insert(tool.serial_number.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate serial_number {:?} in configuration",
                    tool.serial_number
                )));
            }
            if let Some(rotation) = tool.rotation {
                if rotation != [1.0, 0.0, 0.0, 0.0] {
                    return Err(ConfigError::Invalid(format!(
                        "tool {:?} requests tooltip rotation {:?}, which is unsupported",
                        tool.name, rotation
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve `tool.definition` against `definition_path`, returning the
    /// first directory in which it exists (or the path unchanged if it is
    /// already absolute).
    pub fn resolve_definition(&self, tool: &ToolConfig) -> Option<PathBuf> {
        let def = tool.definition.as_ref()?;
        let candidate = PathBuf::from(def);
        if candidate.is_absolute() {
            return Some(candidate);
        }
        for dir in &self.definition_path {
            let joined = dir.join(&candidate);
            if joined.exists() {
                return Some(joined);
            }
        }
        self.definition_path.first().map(|d| d.join(&candidate))
    }
}
