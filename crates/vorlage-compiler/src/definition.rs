/*
 * definition.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Definitions: the resettable byte sources variables expand to.

use std::io::{self, Read};
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::variable::VariableRef;

/// A resettable, byte-producing value.
///
/// [`Read::read`] returning `Ok(0)` marks the end of the value. The reader
/// calls [`Definition::reset`] before every reference, so the same
/// definition may be replayed any number of times within a request.
pub trait Definition: Read + Send {
    /// Rewind to the first byte.
    fn reset(&mut self) -> io::Result<()>;

    /// Release resources held by the definition.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An in-memory definition. Processors use this for values they have
/// already computed.
#[derive(Debug, Clone, Default)]
pub struct StringDefinition {
    value: Arc<[u8]>,
    cursor: usize,
}

impl StringDefinition {
    pub fn new(value: impl AsRef<[u8]>) -> Self {
        Self {
            value: Arc::from(value.as_ref()),
            cursor: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }
}

impl Read for StringDefinition {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.value[self.cursor..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.cursor += n;
        Ok(n)
    }
}

impl Definition for StringDefinition {
    fn reset(&mut self) -> io::Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.cursor = 0;
        Ok(())
    }
}

/// A definition created by `#define`.
///
/// The value is shared with the registry, so handing out a fresh copy for
/// each reference is cheap.
#[derive(Debug, Clone)]
pub struct NormalDefinition {
    full_name: String,
    value: StringDefinition,
}

impl NormalDefinition {
    /// Build a definition from a `#define` line's variable token and value.
    pub fn new(variable: &str, value: &str) -> Result<Self> {
        let reference = VariableRef::parse(variable.as_bytes(), 0).map_err(|e| {
            Error::new(ErrorKind::InvalidDefinition)
                .with_subject(variable.to_string())
                .because(e)
        })?;
        if reference.is_processor_variable() {
            return Err(
                Error::new(ErrorKind::DefineProcessorVariable).with_subject(reference.full_name)
            );
        }
        if value.is_empty() {
            return Err(Error::new(ErrorKind::InvalidDefinition)
                .with_subject(format!("{} has a blank value", reference.full_name)));
        }
        Ok(Self {
            full_name: reference.full_name,
            value: StringDefinition::new(value),
        })
    }

    /// The token this definition replaces, delimiters included.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn value(&self) -> &[u8] {
        self.value.as_bytes()
    }

    /// The name alongside the readable value.
    pub(crate) fn parts_mut(&mut self) -> (&str, &mut StringDefinition) {
        (&self.full_name, &mut self.value)
    }
}

impl Read for NormalDefinition {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.value.read(buf)
    }
}

impl Definition for NormalDefinition {
    fn reset(&mut self) -> io::Result<()> {
        self.value.reset()
    }
}

/// All `#define`d values of one compile request, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: Vec<NormalDefinition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. Names are unique per request.
    pub fn insert(&mut self, definition: NormalDefinition) -> Result<()> {
        if self.get(definition.full_name()).is_some() {
            return Err(
                Error::new(ErrorKind::AlreadyDefined).with_subject(definition.full_name.clone())
            );
        }
        tracing::debug!(variable = %definition.full_name(), "registered definition");
        self.definitions.push(definition);
        Ok(())
    }

    /// Look up by full token, e.g. `$(title)`.
    pub fn get(&self, full_name: &str) -> Option<&NormalDefinition> {
        self.definitions.iter().find(|d| d.full_name == full_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NormalDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(def: &mut dyn Definition, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = def.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_string_definition_replays_after_reset() {
        let mut def = StringDefinition::new("hello world");
        assert_eq!(read_all(&mut def, 3), b"hello world");
        assert_eq!(read_all(&mut def, 3), b"");
        def.reset().unwrap();
        assert_eq!(read_all(&mut def, 64), b"hello world");
    }

    #[test]
    fn test_normal_definition_rejects_processor_names() {
        let err = NormalDefinition::new("$(proc.x)", "value").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DefineProcessorVariable);
    }

    #[test]
    fn test_normal_definition_rejects_bad_tokens() {
        let err = NormalDefinition::new("title", "value").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDefinition);
        assert_eq!(
            err.cause().map(Error::kind),
            Some(ErrorKind::InvalidVariableName)
        );
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = DefinitionRegistry::new();
        registry
            .insert(NormalDefinition::new("$(a)", "1").unwrap())
            .unwrap();
        registry
            .insert(NormalDefinition::new("$(b)", "2").unwrap())
            .unwrap();
        let err = registry
            .insert(NormalDefinition::new("$(a)", "3").unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyDefined);
        assert_eq!(err.subject(), Some("$(a)"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("$(a)").unwrap().value(), b"1");
    }

    #[test]
    fn test_registry_preserves_insertion_order() {
        let mut registry = DefinitionRegistry::new();
        for name in ["$(z)", "$(a)", "$(m)"] {
            registry
                .insert(NormalDefinition::new(name, "v").unwrap())
                .unwrap();
        }
        let names: Vec<_> = registry.iter().map(|d| d.full_name()).collect();
        assert_eq!(names, vec!["$(z)", "$(a)", "$(m)"]);
    }
}
