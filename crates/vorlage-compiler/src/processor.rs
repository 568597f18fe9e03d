/*
 * processor.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Processors: external providers of variable values.
//!
//! A processor declares a set of variables, each with the scalar and stream
//! inputs it needs. The reader calls [`Processor::define_variable`] whenever
//! it meets `$(processor.variable)` in a document. How a processor gets loaded
//! (a dynamic library, a plugin host, plain Rust) is up to the host; this
//! crate only sees the trait.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::definition::{Definition, StringDefinition};
use crate::error::{Error, ErrorKind, Result};

static PROCESSOR_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]+$").unwrap());

/// Request id, unique within one [`crate::Compiler`].
pub type Rid = u64;

/// A named, one-shot byte source supplied with a request.
pub type StreamInput = Box<dyn Read + Send>;

/// Error type processors report failures with.
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPrototype {
    pub name: String,
    pub description: String,
}

impl InputPrototype {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorVariable {
    pub name: String,
    pub description: String,
    pub inputs: Vec<InputPrototype>,
    pub stream_inputs: Vec<InputPrototype>,
}

impl ProcessorVariable {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.inputs.push(InputPrototype::new(name, description));
        self
    }

    pub fn with_stream_input(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.stream_inputs.push(InputPrototype::new(name, description));
        self
    }
}

/// What a processor reports about itself when registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorInfo {
    pub name: String,
    pub description: String,
    /// Scalar inputs bound once per request and passed to [`Processor::on_request`].
    pub inputs: Vec<InputPrototype>,
    pub variables: Vec<ProcessorVariable>,
}

impl ProcessorInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.inputs.push(InputPrototype::new(name, description));
        self
    }

    pub fn with_variable(mut self, variable: ProcessorVariable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn variable(&self, name: &str) -> Option<&ProcessorVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    fn validate(&self) -> Result<()> {
        if !PROCESSOR_NAME.is_match(&self.name) {
            return Err(Error::new(ErrorKind::ProcessorName).with_subject(self.name.clone()));
        }
        for variable in &self.variables {
            for input in &variable.inputs {
                if variable.stream_inputs.iter().any(|s| s.name == input.name) {
                    return Err(Error::new(ErrorKind::InputInStreamAndStatic)
                        .with_subject(format!("\"{}\" in {}.{}", input.name, self.name, variable.name)));
                }
            }
        }
        Ok(())
    }
}

fn write_prototypes(
    f: &mut fmt::Formatter<'_>,
    prefix: &str,
    kind: &str,
    prototypes: &[InputPrototype],
) -> fmt::Result {
    if prototypes.is_empty() {
        return writeln!(f, "{prefix}no {kind} requested");
    }
    for p in prototypes {
        writeln!(f, "{prefix}{:<28}: {}", format!("{kind}[{}]", p.name), p.description)?;
    }
    Ok(())
}

impl fmt::Display for ProcessorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\t{:<28}: {}", "name", self.name)?;
        writeln!(f, "\t{:<28}: {}", "description", self.description)?;
        write_prototypes(f, "\t", "inputs", &self.inputs)?;
        for v in &self.variables {
            let prefix = format!("variable[{}]", v.name);
            writeln!(f, "\t{prefix:<28}: {}", v.description)?;
            write_prototypes(f, &format!("\t{prefix}"), "input", &v.inputs)?;
            write_prototypes(f, &format!("\t{prefix}"), "stream", &v.stream_inputs)?;
        }
        Ok(())
    }
}

/// Per-request information handed to a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub rid: Rid,
    pub path: PathBuf,
    /// The processor's declared scalar inputs, bound from the request.
    /// Missing inputs are bound to the empty string.
    pub inputs: Vec<(String, String)>,
}

impl RequestInfo {
    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "request #{}:", self.rid)?;
        write!(f, "\t{:<28}: {}", "filepath", self.path.display())?;
        for (k, v) in &self.inputs {
            write!(f, "\n\t{:<28}: {}", format!("input[{k}]"), v)?;
        }
        Ok(())
    }
}

/// Instruction a processor returns from [`Processor::on_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The request cannot complete because of a backend failure.
    Critical(String),
    /// The requestor may not see this document.
    AccessFail(String),
    /// The requestor should make a new request for another path.
    See(String),
    /// A header to add to an HTTP response, for hosts that have one.
    HttpHeader(String),
}

/// Everything a processor needs to define one variable reference.
pub struct DefineCall<'a> {
    pub request: &'a RequestInfo,
    pub variable: &'a ProcessorVariable,
    /// Declared scalar inputs, in declaration order. Missing ones are empty.
    pub inputs: Vec<(String, String)>,
    /// Declared stream inputs that the request actually supplied.
    pub streams: Vec<(String, StreamInput)>,
}

impl DefineCall<'_> {
    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Take ownership of a bound stream input.
    pub fn take_stream(&mut self, name: &str) -> Option<StreamInput> {
        let i = self.streams.iter().position(|(k, _)| k == name)?;
        Some(self.streams.remove(i).1)
    }
}

/// An external provider of variable values.
///
/// Implementations must be shareable between concurrently streaming
/// requests; per-request state is keyed by [`RequestInfo::rid`].
pub trait Processor: Send + Sync {
    /// Describe the processor. Called once, when the processor is registered.
    fn info(&self) -> ProcessorInfo;

    /// Called once per request before the document is composed.
    fn on_request(&self, _request: &RequestInfo) -> Vec<Action> {
        Vec::new()
    }

    /// Produce the value for one reference to one of the declared variables.
    fn define_variable(
        &self,
        call: DefineCall<'_>,
    ) -> std::result::Result<Box<dyn Definition>, ProcessorError>;

    /// Called once when the request's document is closed.
    fn on_finish(&self, _request: &RequestInfo) {}

    fn shutdown(&self) -> std::result::Result<(), ProcessorError> {
        Ok(())
    }
}

/// A registered processor together with its validated info.
#[derive(Clone)]
pub struct ProcessorHandle {
    info: ProcessorInfo,
    processor: Arc<dyn Processor>,
}

impl ProcessorHandle {
    pub fn info(&self) -> &ProcessorInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }
}

impl fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

/// The set of processors available to a compiler.
#[derive(Debug, Clone, Default)]
pub struct ProcessorRegistry {
    processors: Vec<ProcessorHandle>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a processor.
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> Result<()> {
        let info = processor.info();
        info.validate()?;
        if self.find_processor(&info.name).is_some() {
            return Err(Error::new(ErrorKind::DuplicateProcessor).with_subject(info.name));
        }
        tracing::info!(processor = %info.name, "loaded processor");
        tracing::debug!("{} information:\n{}", info.name, info);
        self.processors.push(ProcessorHandle { info, processor });
        Ok(())
    }

    pub fn with(mut self, processor: Arc<dyn Processor>) -> Result<Self> {
        self.register(processor)?;
        Ok(self)
    }

    pub fn find_processor(&self, name: &str) -> Option<&ProcessorHandle> {
        self.processors.iter().find(|p| p.info.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessorHandle> {
        self.processors.iter()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Shut down every processor, collecting failures.
    pub fn shutdown(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        for handle in &self.processors {
            if let Err(e) = handle.processor.shutdown() {
                errors.push(
                    Error::new(ErrorKind::Shutdown)
                        .with_subject(format!("{}: {e}", handle.info.name)),
                );
            }
        }
        errors
    }
}

type ValueFn = dyn Fn(&mut DefineCall<'_>) -> std::result::Result<String, ProcessorError>
    + Send
    + Sync;

/// A processor whose variables are computed by closures.
///
/// Useful for tests and for hosts embedding small processors directly.
pub struct MemoryProcessor {
    info: ProcessorInfo,
    values: HashMap<String, Box<ValueFn>>,
    actions: Vec<Action>,
    calls: Mutex<Vec<String>>,
    finished: Mutex<Vec<Rid>>,
}

impl MemoryProcessor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            info: ProcessorInfo::new(name, description),
            values: HashMap::new(),
            actions: Vec::new(),
            calls: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    /// Declare a variable with a constant value.
    pub fn constant(self, variable: ProcessorVariable, value: impl Into<String>) -> Self {
        let value = value.into();
        self.computed(variable, move |_| Ok(value.clone()))
    }

    /// Declare a variable computed from its call.
    pub fn computed<F>(mut self, variable: ProcessorVariable, f: F) -> Self
    where
        F: Fn(&mut DefineCall<'_>) -> std::result::Result<String, ProcessorError>
            + Send
            + Sync
            + 'static,
    {
        self.values.insert(variable.name.clone(), Box::new(f));
        self.info.variables.push(variable);
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.info.inputs.push(InputPrototype::new(name, description));
        self
    }

    /// Actions returned from every `on_request`.
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Names of the variables defined so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Requests that have finished.
    pub fn finished(&self) -> Vec<Rid> {
        self.finished.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl Processor for MemoryProcessor {
    fn info(&self) -> ProcessorInfo {
        self.info.clone()
    }

    fn on_request(&self, _request: &RequestInfo) -> Vec<Action> {
        self.actions.clone()
    }

    fn define_variable(
        &self,
        mut call: DefineCall<'_>,
    ) -> std::result::Result<Box<dyn Definition>, ProcessorError> {
        let name = call.variable.name.clone();
        let f = self
            .values
            .get(&name)
            .ok_or_else(|| format!("no value for {name}"))?;
        let value = f(&mut call)?;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(name);
        }
        Ok(Box::new(StringDefinition::new(value)))
    }

    fn on_finish(&self, request: &RequestInfo) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.push(request.rid);
        }
    }
}
