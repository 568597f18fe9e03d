/*
 * context.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Per-request state threaded through composition, resolution and streaming.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::definition::DefinitionRegistry;
use crate::error::{Error, ErrorKind, Result};
use crate::processor::{RequestInfo, Rid, StreamInput};

enum StreamSlot {
    Available(StreamInput),
    Consumed { by: String },
}

/// State owned by one compile request.
///
/// Nothing in here is shared between requests; concurrent requests each get
/// their own context.
pub struct CompileContext {
    rid: Rid,
    path: PathBuf,
    inputs: HashMap<String, String>,
    streams: HashMap<String, StreamSlot>,
    requests: HashMap<String, RequestInfo>,
    pub(crate) definitions: DefinitionRegistry,
    definition_stack: Vec<String>,
}

impl CompileContext {
    pub fn new(
        rid: Rid,
        path: impl Into<PathBuf>,
        inputs: HashMap<String, String>,
        streams: HashMap<String, StreamInput>,
    ) -> Self {
        Self {
            rid,
            path: path.into(),
            inputs,
            streams: streams
                .into_iter()
                .map(|(k, v)| (k, StreamSlot::Available(v)))
                .collect(),
            requests: HashMap::new(),
            definitions: DefinitionRegistry::new(),
            definition_stack: Vec::new(),
        }
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    /// Scalar input by name. A missing input is the empty string.
    pub fn input(&self, name: &str) -> &str {
        match self.inputs.get(name) {
            Some(value) => value,
            None => {
                tracing::debug!(input = %name, rid = self.rid, "input not supplied, using empty string");
                ""
            }
        }
    }

    /// Bind `names` to scalar inputs, in order.
    pub fn bind_inputs<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Vec<(String, String)> {
        names
            .into_iter()
            .map(|name| (name.to_string(), self.input(name).to_string()))
            .collect()
    }

    /// Record the request info a processor was started with.
    pub fn set_request(&mut self, processor: &str, request: RequestInfo) {
        self.requests.insert(processor.to_string(), request);
    }

    /// Request info for `processor`, or a bare one if it was never started.
    pub fn request(&self, processor: &str) -> RequestInfo {
        self.requests
            .get(processor)
            .cloned()
            .unwrap_or_else(|| RequestInfo {
                rid: self.rid,
                path: self.path.clone(),
                inputs: Vec::new(),
            })
    }

    /// Claim stream input `name` on behalf of `consumer`.
    ///
    /// Returns `Ok(None)` when the stream was not supplied, or when the same
    /// consumer already took it. A second, different consumer is an error.
    pub fn take_stream(&mut self, name: &str, consumer: &str) -> Result<Option<StreamInput>> {
        let Some(slot) = self.streams.get_mut(name) else {
            return Ok(None);
        };
        if let StreamSlot::Consumed { by } = slot {
            if by.as_str() == consumer {
                tracing::debug!(stream = %name, consumer = %consumer, "stream already consumed by this reference");
                return Ok(None);
            }
            return Err(Error::new(ErrorKind::DoubleStreamInput)
                .with_subject(format!("\"{name}\" wanted by {consumer}, already consumed by {by}")));
        }
        let taken = std::mem::replace(
            slot,
            StreamSlot::Consumed {
                by: consumer.to_string(),
            },
        );
        match taken {
            StreamSlot::Available(stream) => Ok(Some(stream)),
            StreamSlot::Consumed { .. } => Ok(None),
        }
    }

    /// Which reference consumed stream input `name`, if any.
    pub fn stream_consumer(&self, name: &str) -> Option<&str> {
        match self.streams.get(name) {
            Some(StreamSlot::Consumed { by }) => Some(by),
            _ => None,
        }
    }

    /// Enter the expansion of `full_name`, failing if it is already being expanded.
    pub fn push_definition(&mut self, full_name: &str) -> Result<()> {
        if self.definition_stack.iter().any(|n| n == full_name) {
            let chain = self
                .definition_stack
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(full_name))
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::new(ErrorKind::CircularDefinition).with_subject(chain));
        }
        self.definition_stack.push(full_name.to_string());
        Ok(())
    }

    pub fn pop_definition(&mut self) -> Option<String> {
        self.definition_stack.pop()
    }

    pub fn definition_depth(&self) -> usize {
        self.definition_stack.len()
    }

    pub(crate) fn clear_definition_stack(&mut self) {
        self.definition_stack.clear();
    }
}
