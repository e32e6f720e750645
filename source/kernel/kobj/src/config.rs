// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sizing knobs for the kernel-object tables
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig (default/from_toml_str/validate), ConfigError
//! DEPENDS_ON: serde, toml
//! INVARIANTS: Tables are fixed-size once the kernel is built; idle + init always fit

use serde::Deserialize;
use static_assertions::const_assert;

/// Process table slots.
pub const DEFAULT_MAX_PROC: usize = 1024;
/// Per-process handle slots.
pub const DEFAULT_MAX_FILEID: usize = 16;
/// System-wide file control blocks.
pub const DEFAULT_MAX_FILES: usize = 1024;
/// Bytes buffered per pipe direction.
pub const DEFAULT_PIPE_BUFFER_SIZE: usize = 8192;
/// Highest legal port number.
pub const DEFAULT_MAX_PORT: u16 = 1023;

const_assert!(DEFAULT_MAX_PROC >= 2);
const_assert!(DEFAULT_PIPE_BUFFER_SIZE > 0);

/// Errors produced while loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse kernel config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid kernel config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

/// Table sizes used when building a [`crate::Kernel`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub max_proc: usize,
    pub max_fileid: usize,
    pub max_files: usize,
    pub pipe_buffer_size: usize,
    pub max_port: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_proc: DEFAULT_MAX_PROC,
            max_fileid: DEFAULT_MAX_FILEID,
            max_files: DEFAULT_MAX_FILES,
            pipe_buffer_size: DEFAULT_PIPE_BUFFER_SIZE,
            max_port: DEFAULT_MAX_PORT,
        }
    }
}

impl KernelConfig {
    /// Parses a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_proc < 2 {
            return Err(ConfigError::Invalid {
                field: "max_proc",
                reason: "idle and init need two slots",
            });
        }
        if self.max_proc > u32::MAX as usize {
            return Err(ConfigError::Invalid { field: "max_proc", reason: "pid must fit u32" });
        }
        if self.max_fileid == 0 {
            return Err(ConfigError::Invalid { field: "max_fileid", reason: "must be non-zero" });
        }
        if self.max_files == 0 {
            return Err(ConfigError::Invalid { field: "max_files", reason: "must be non-zero" });
        }
        if self.pipe_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "pipe_buffer_size",
                reason: "must be non-zero",
            });
        }
        if self.max_port == 0 {
            return Err(ConfigError::Invalid { field: "max_port", reason: "no usable ports" });
        }
        Ok(())
    }
}
