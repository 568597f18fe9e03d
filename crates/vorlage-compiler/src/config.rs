/*
 * config.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Compiler configuration.
//!
//! Buffer sizes bound how much of a document is ever held in memory at once,
//! so they are configurable per host. Values are usually loaded from a TOML
//! file:
//!
//! ```toml
//! macro-max-length = 1024
//! max-variable-length = 32
//! read-buffer-size = 4096
//! reserved-prefix = "__"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::variable::VARIABLE_PREFIX;

pub const DEFAULT_MACRO_MAX_LENGTH: usize = 1024;
pub const DEFAULT_MAX_VARIABLE_LENGTH: usize = 32;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_RESERVED_PREFIX: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct CompilerConfig {
    /// Window used when scanning a macro line. A directive longer than this is an error.
    pub macro_max_length: usize,

    /// Capacity of the variable scratch buffer, prefix and suffix included.
    pub max_variable_length: usize,

    /// Chunk size used when pulling raw bytes from a document's own content.
    pub read_buffer_size: usize,

    /// Prefix reserved for inputs injected by the host.
    pub reserved_prefix: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            macro_max_length: DEFAULT_MACRO_MAX_LENGTH,
            max_variable_length: DEFAULT_MAX_VARIABLE_LENGTH,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reserved_prefix: DEFAULT_RESERVED_PREFIX.to_string(),
        }
    }
}

impl CompilerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: CompilerConfig = toml::from_str(source)
            .map_err(|e| Error::new(ErrorKind::Config).with_subject(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::io(ErrorKind::Open, path.display(), e))?;
        Self::from_toml_str(&source).map_err(|e| {
            Error::new(ErrorKind::Config)
                .with_subject(path.display().to_string())
                .because(e)
        })
    }

    pub fn validate(&self) -> Result<()> {
        // the shortest token is `$(x)`
        let shortest = VARIABLE_PREFIX.len() + 2;
        if self.max_variable_length < shortest {
            return Err(Error::new(ErrorKind::Config).with_subject(format!(
                "max-variable-length must be at least {shortest}, got {}",
                self.max_variable_length
            )));
        }
        if self.macro_max_length < 2 {
            return Err(Error::new(ErrorKind::Config).with_subject(format!(
                "macro-max-length must be at least 2, got {}",
                self.macro_max_length
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::new(ErrorKind::Config)
                .with_subject("read-buffer-size must not be zero"));
        }
        if self.reserved_prefix.is_empty() {
            return Err(Error::new(ErrorKind::Config)
                .with_subject("reserved-prefix must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.macro_max_length, 1024);
        assert_eq!(config.max_variable_length, 32);
        assert_eq!(config.reserved_prefix, "__");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CompilerConfig::from_toml_str("max-variable-length = 64\n").unwrap();
        assert_eq!(config.max_variable_length, 64);
        assert_eq!(config.macro_max_length, DEFAULT_MACRO_MAX_LENGTH);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_rejects_tiny_variable_buffer() {
        let err = CompilerConfig::from_toml_str("max-variable-length = 3\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = CompilerConfig::from_toml_str("buffer = 3\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vorlage.toml");
        std::fs::write(&path, "read-buffer-size = 16\nreserved-prefix = \"@@\"\n").unwrap();
        let config = CompilerConfig::load(&path).unwrap();
        assert_eq!(config.read_buffer_size, 16);
        assert_eq!(config.reserved_prefix, "@@");
    }
}
