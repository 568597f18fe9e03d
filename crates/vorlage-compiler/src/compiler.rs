/*
 * compiler.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The compile request entry point.
//!
//! A [`Compiler`] is shared by every request a host serves. It owns the
//! processor registry, the file converters and the configuration, and turns
//! each [`CompileRequest`] into a [`StreamingDocument`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::CompilerConfig;
use crate::context::CompileContext;
use crate::document::{ComposeOptions, DocumentTree};
use crate::error::{Error, ErrorKind, Result};
use crate::processor::{Action, ProcessorRegistry, RequestInfo, StreamInput};
use crate::reader::StreamingDocument;
use crate::source::FileConverter;

/// Counts one compile from its start until its document is closed.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Receives the actions processors return when a request starts.
pub trait ActionHandler {
    fn handle(&mut self, processor: &str, action: &Action);
}

/// Ignores every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActionHandler;

impl ActionHandler for NoopActionHandler {
    fn handle(&mut self, _processor: &str, _action: &Action) {}
}

/// Collects every action, e.g. for a host to turn headers into a response.
#[derive(Debug, Clone, Default)]
pub struct CollectingActionHandler {
    pub actions: Vec<(String, Action)>,
}

impl ActionHandler for CollectingActionHandler {
    fn handle(&mut self, processor: &str, action: &Action) {
        self.actions.push((processor.to_string(), action.clone()));
    }
}

/// Everything one compile needs from the caller.
#[derive(Default)]
pub struct CompileRequest {
    path: PathBuf,
    inputs: HashMap<String, String>,
    reserved: HashMap<String, String>,
    streams: HashMap<String, StreamInput>,
}

impl CompileRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A scalar input supplied by the requestor.
    pub fn input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn inputs<K, V>(mut self, inputs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.inputs
            .extend(inputs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// A scalar input injected by the host. Its name must carry the reserved prefix.
    pub fn reserved_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.reserved.insert(name.into(), value.into());
        self
    }

    /// A one-shot stream input.
    pub fn stream(mut self, name: impl Into<String>, stream: StreamInput) -> Self {
        self.streams.insert(name.into(), stream);
        self
    }
}

impl std::fmt::Debug for CompileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileRequest")
            .field("path", &self.path)
            .field("inputs", &self.inputs)
            .field("reserved", &self.reserved)
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct Compiler {
    processors: RwLock<Arc<ProcessorRegistry>>,
    converters: Vec<Arc<dyn FileConverter>>,
    config: CompilerConfig,
    in_flight: Arc<AtomicUsize>,
    next_rid: AtomicU64,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            processors: RwLock::new(Arc::new(ProcessorRegistry::new())),
            converters: Vec::new(),
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_rid: AtomicU64::new(1),
        })
    }

    pub fn with_processors(self, registry: ProcessorRegistry) -> Self {
        match self.processors.write() {
            Ok(mut guard) => *guard = Arc::new(registry),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(registry),
        }
        self
    }

    /// Add a converter. Converters are tried in the order they were added.
    pub fn with_converter(mut self, converter: Arc<dyn FileConverter>) -> Self {
        tracing::debug!(converter = converter.description(), "added file converter");
        self.converters.push(converter);
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// The current processor registry.
    pub fn processors(&self) -> Arc<ProcessorRegistry> {
        match self.processors.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Number of compiles started whose documents are still open.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Compose `path` with the given inputs, ignoring processor actions other
    /// than the ones that abort the request.
    pub fn compose(
        &self,
        path: impl Into<PathBuf>,
        inputs: HashMap<String, String>,
        streams: HashMap<String, StreamInput>,
    ) -> Result<StreamingDocument> {
        let mut request = CompileRequest::new(path).inputs(inputs);
        request.streams = streams;
        self.compile(request, &mut NoopActionHandler)
    }

    /// Start a request: notify the processors, compose the document tree and
    /// hand back the document, ready to stream.
    pub fn compile(
        &self,
        request: CompileRequest,
        handler: &mut dyn ActionHandler,
    ) -> Result<StreamingDocument> {
        let guard = InFlightGuard::acquire(&self.in_flight);
        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
        let CompileRequest {
            path,
            inputs,
            reserved,
            streams,
        } = request;
        tracing::debug!(rid, path = %path.display(), "compile request");

        let inputs = self.merge_inputs(inputs, reserved)?;
        let processors = self.processors();
        let mut ctx = CompileContext::new(rid, &path, inputs, streams);

        let started = start_processors(&processors, &mut ctx, handler);
        let composed = started.and_then(|_| {
            let options = ComposeOptions {
                macro_max_length: self.config.macro_max_length,
                converters: &self.converters,
            };
            DocumentTree::compose(&path, &mut ctx, &options)
        });
        match composed {
            Ok(tree) => Ok(StreamingDocument::new(
                tree,
                ctx,
                processors,
                &self.config,
                Some(guard),
            )),
            Err(err) => {
                for handle in processors.iter() {
                    handle.processor().on_finish(&ctx.request(handle.name()));
                }
                Err(err)
            }
        }
    }

    fn merge_inputs(
        &self,
        inputs: HashMap<String, String>,
        reserved: HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let prefix = self.config.reserved_prefix.as_str();
        let mut merged: HashMap<String, String> = inputs
            .into_iter()
            .filter(|(name, _)| {
                let keep = !name.starts_with(prefix);
                if !keep {
                    tracing::warn!(input = %name, "dropping requestor input with reserved prefix");
                }
                keep
            })
            .collect();
        for (name, value) in reserved {
            if !name.starts_with(prefix) {
                return Err(Error::new(ErrorKind::BadReservedInput).with_subject(name));
            }
            merged.insert(name, value);
        }
        Ok(merged)
    }

    /// Swap in a new processor registry. Refused while compiles are running;
    /// the old processors are shut down.
    pub fn reload_processors(&self, registry: ProcessorRegistry) -> Result<()> {
        self.ensure_quiescent()?;
        let old = {
            let mut guard = match self.processors.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, Arc::new(registry))
        };
        tracing::info!(processors = self.processors().len(), "reloaded processors");
        first_error(old.shutdown())
    }

    /// Shut every processor down. Refused while compiles are running.
    pub fn shutdown(&self) -> Result<()> {
        self.ensure_quiescent()?;
        tracing::info!("shutting down processors");
        first_error(self.processors().shutdown())
    }

    fn ensure_quiescent(&self) -> Result<()> {
        match self.in_flight() {
            0 => Ok(()),
            n => Err(Error::new(ErrorKind::CompilesRunning).with_subject(format!("{n} running"))),
        }
    }
}

/// Run `on_request` for each processor and act on what they return.
fn start_processors(
    processors: &ProcessorRegistry,
    ctx: &mut CompileContext,
    handler: &mut dyn ActionHandler,
) -> Result<()> {
    for handle in processors.iter() {
        let info = handle.info();
        let request = RequestInfo {
            rid: ctx.rid(),
            path: ctx.path().to_path_buf(),
            inputs: ctx.bind_inputs(info.inputs.iter().map(|p| p.name.as_str())),
        };
        tracing::debug!("{} {}", info.name, request);
        let actions = handle.processor().on_request(&request);
        ctx.set_request(&info.name, request);

        for action in &actions {
            handler.handle(&info.name, action);
            let subject = |message: &str| format!("{}: {message}", info.name);
            match action {
                Action::Critical(message) => {
                    return Err(Error::new(ErrorKind::ProcessorCritical).with_subject(subject(message)));
                }
                Action::AccessFail(message) => {
                    return Err(Error::new(ErrorKind::AccessDenied).with_subject(subject(message)));
                }
                Action::See(path) => {
                    return Err(Error::new(ErrorKind::Redirect).with_subject(subject(path)));
                }
                Action::HttpHeader(header) => {
                    tracing::debug!(processor = %info.name, header = %header, "processor set header");
                }
            }
        }
    }
    Ok(())
}

fn first_error(errors: Vec<Error>) -> Result<()> {
    let mut errors = errors.into_iter();
    let first = errors.next();
    for rest in errors {
        tracing::warn!(error = %rest, "additional shutdown failure");
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{MemoryProcessor, ProcessorVariable};

    fn fixture(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_reserved_inputs() {
        let (_dir, path) = fixture("body");
        let compiler = Compiler::new(CompilerConfig::default()).unwrap();
        let document = compiler
            .compile(
                CompileRequest::new(&path)
                    .input("__user", "mallory")
                    .input("lang", "en")
                    .reserved_input("__user", "alice"),
                &mut NoopActionHandler,
            )
            .unwrap();
        assert_eq!(document.context().input("__user"), "alice");
        assert_eq!(document.context().input("lang"), "en");

        let err = compiler
            .compile(
                CompileRequest::new(&path).reserved_input("user", "alice"),
                &mut NoopActionHandler,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadReservedInput);
    }

    #[test]
    fn test_request_ids_increase() {
        let (_dir, path) = fixture("body");
        let compiler = Compiler::new(CompilerConfig::default()).unwrap();
        let a = compiler.compose(&path, HashMap::new(), HashMap::new()).unwrap();
        let b = compiler.compose(&path, HashMap::new(), HashMap::new()).unwrap();
        assert!(b.rid() > a.rid());
    }

    #[test]
    fn test_shutdown_waits_for_documents() {
        let (_dir, path) = fixture("body");
        let compiler = Compiler::new(CompilerConfig::default()).unwrap();
        let mut document = compiler.compose(&path, HashMap::new(), HashMap::new()).unwrap();
        assert_eq!(compiler.in_flight(), 1);
        assert_eq!(
            compiler.shutdown().unwrap_err().kind(),
            ErrorKind::CompilesRunning
        );
        assert_eq!(
            compiler
                .reload_processors(ProcessorRegistry::new())
                .unwrap_err()
                .kind(),
            ErrorKind::CompilesRunning
        );
        document.close().unwrap();
        assert_eq!(compiler.in_flight(), 0);
        compiler.shutdown().unwrap();
    }

    #[test]
    fn test_failed_compile_is_not_in_flight() {
        let compiler = Compiler::new(CompilerConfig::default()).unwrap();
        let err = compiler
            .compose("/nonexistent/doc.txt", HashMap::new(), HashMap::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Open);
        assert_eq!(compiler.in_flight(), 0);
    }

    #[test]
    fn test_actions() {
        let (_dir, path) = fixture("body");
        let registry = ProcessorRegistry::new()
            .with(Arc::new(
                MemoryProcessor::new("headers", "")
                    .with_action(Action::HttpHeader("X-Test: 1".to_string())),
            ))
            .unwrap()
            .with(Arc::new(
                MemoryProcessor::new("auth", "")
                    .with_action(Action::AccessFail("not logged in".to_string())),
            ))
            .unwrap();
        let compiler = Compiler::new(CompilerConfig::default())
            .unwrap()
            .with_processors(registry);
        let mut handler = CollectingActionHandler::default();
        let err = compiler
            .compile(CompileRequest::new(&path), &mut handler)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(err.subject(), Some("auth: not logged in"));
        assert_eq!(handler.actions.len(), 2);
        assert_eq!(handler.actions[0].0, "headers");
    }

    #[test]
    fn test_processor_request_inputs() {
        let (_dir, path) = fixture("$(site.Lang)");
        let processor = MemoryProcessor::new("site", "")
            .with_input("lang", "")
            .computed(ProcessorVariable::new("Lang", ""), |call| {
                Ok(call.request.input("lang").unwrap_or_default().to_uppercase())
            });
        let compiler = Compiler::new(CompilerConfig::default())
            .unwrap()
            .with_processors(ProcessorRegistry::new().with(Arc::new(processor)).unwrap());
        let mut document = compiler
            .compile(CompileRequest::new(&path).input("lang", "de"), &mut NoopActionHandler)
            .unwrap();
        let mut out = String::new();
        std::io::Read::read_to_string(&mut document, &mut out).unwrap();
        assert_eq!(out, "DE");
    }
}
