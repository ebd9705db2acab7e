// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the tracker driver core.
//!
//! Subsystem errors ([`WireError`], [`BringupError`], [`RegistryError`],
//! [`ConfigError`]) convert into [`DriverError`] via `#[from]` so call sites
//! can propagate with `?` regardless of which layer failed.

use thiserror::Error;

/// Errors from the serial framing / CRC / response-reading layer (C2-C4).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("read deadline exceeded")]
    Timeout,

    #[error("CRC mismatch: expected {expected:04X}, got {got:04X}")]
    BadCrc { expected: u16, got: u16 },

    #[error("unexpected response: expected prefix {expected:?}, got {got:?}")]
    Unexpected { expected: String, got: String },

    #[error("missing line feed between tool rows")]
    ProtocolFraming,

    #[error("response buffer overflowed capacity {capacity}")]
    BufferOverflow { capacity: usize },

    #[error("response too short to contain a CRC")]
    ResponseTooShort,
}

/// Errors from connection bring-up and the port-handle state machine (C5, C6, C8).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BringupError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("firmware version {got:?} is not the supported firmware {expected:?}")]
    UnsupportedFirmware { expected: &'static str, got: String },

    #[error("no responsive device found among candidate ports")]
    NoDevice,

    #[error("unrecognized tool main_type {0:?}")]
    UnknownToolType(String),

    #[error("baud rate {0} has no `COMM` encoding")]
    UnsupportedBaud(u32),

    #[error("tool definition at {path} is {size} bytes, exceeds 960 byte limit")]
    DefinitionTooLarge { path: String, size: u64 },

    #[error("serial number stayed 00000000 after {retries} retries (Aurora USB fault workaround exhausted)")]
    TransientZeroSerialExhausted { retries: u32 },

    #[error("failed to read tool definition file {path}: {source}")]
    DefinitionIo {
        path: String,
        #[source]
        source: std::sync::Arc<std::io::Error>,
    },
}

/// Errors from the tool registry (C7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a tool named {0:?} already exists with a different serial number")]
    DuplicateName(String),
}

/// Errors from loading and validating [`crate::config::DriverConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error type returned across the driver's public API.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Bringup(#[from] BringupError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("driver is not connected")]
    NotConnected,

    #[error("driver is already connected")]
    AlreadyConnected,

    #[error("beep count {0} out of range 1..=9")]
    InvalidBeepCount(u8),
}
