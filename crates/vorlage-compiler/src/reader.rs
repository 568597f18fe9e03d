/*
 * reader.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The streaming reader.
//!
//! A [`StreamingDocument`] produces the composed output one buffer at a time.
//! Instead of recursing, it keeps an explicit stack of frames:
//!
//! - a document frame walks its node through prepends, own content and
//!   appends;
//! - a normal expansion frame reads a `#define`d value, scanning it for
//!   nested variables;
//! - a processor expansion frame copies a processor-provided value verbatim;
//! - a literal frame emits a variable token that could not be resolved.
//!
//! The definition names of the active normal expansions are tracked in the
//! request context, so a definition that ends up referencing itself is
//! reported instead of expanding forever.

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use crate::compiler::InFlightGuard;
use crate::config::CompilerConfig;
use crate::context::CompileContext;
use crate::definition::{Definition, NormalDefinition};
use crate::document::{DocumentId, DocumentTree};
use crate::error::{Error, ErrorCategory, ErrorKind, Result};
use crate::processor::{ProcessorRegistry, Rid};
use crate::resolver::{Resolved, resolve};
use crate::variable::{Scan, VariableRef, VariableScanner};

/// Raw bytes pulled from a source and run through a variable scanner.
struct ScanState {
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
    scanner: VariableScanner,
    /// Bytes that must go out before anything else is scanned.
    carry: Vec<u8>,
    carry_pos: usize,
    eof: bool,
}

enum Step {
    Wrote(usize),
    Token(VariableRef),
    End,
}

impl ScanState {
    fn new(buffer_size: usize, max_variable_length: usize) -> Self {
        Self {
            buf: vec![0u8; buffer_size.max(1)].into_boxed_slice(),
            pos: 0,
            len: 0,
            scanner: VariableScanner::new(max_variable_length),
            carry: Vec::new(),
            carry_pos: 0,
            eof: false,
        }
    }

    fn drain_carry(&mut self, out: &mut [u8]) -> usize {
        let rest = &self.carry[self.carry_pos..];
        let n = rest.len().min(out.len());
        out[..n].copy_from_slice(&rest[..n]);
        self.carry_pos += n;
        if self.carry_pos == self.carry.len() {
            self.carry.clear();
            self.carry_pos = 0;
        }
        n
    }

    fn set_carry(&mut self, bytes: Vec<u8>) {
        self.carry = bytes;
        self.carry_pos = 0;
    }

    /// Produce the next piece of output: plain bytes written into `out`, a
    /// recognized token, or the end of the source.
    ///
    /// Read failures are reported against `subject`.
    fn step<R: Read + ?Sized>(
        &mut self,
        source: &mut R,
        subject: &dyn fmt::Display,
        out: &mut [u8],
    ) -> Result<Step> {
        loop {
            if self.carry_pos < self.carry.len() {
                return Ok(Step::Wrote(self.drain_carry(out)));
            }

            if self.pos == self.len {
                if self.eof {
                    // a token still open at the end is plain text after all
                    match self.scanner.finish() {
                        Some(rest) => {
                            self.set_carry(rest);
                            continue;
                        }
                        None => return Ok(Step::End),
                    }
                }
                let n = read_some(source, &mut self.buf)
                    .map_err(|e| Error::io(ErrorKind::Read, subject, e))?;
                if n == 0 {
                    self.eof = true;
                } else {
                    self.pos = 0;
                    self.len = n;
                }
                continue;
            }

            let end = if self.scanner.is_idle() {
                self.len.min(self.pos + out.len())
            } else {
                self.len
            };
            let chunk = &self.buf[self.pos..end];
            match self.scanner.scan(chunk)? {
                Scan::Text(n) => {
                    out[..n].copy_from_slice(&chunk[..n]);
                    self.pos += n;
                    return Ok(Step::Wrote(n));
                }
                Scan::Pending(n) => self.pos += n,
                Scan::Rejected { consumed, literal } => {
                    self.pos += consumed;
                    self.set_carry(literal);
                }
                Scan::Token {
                    consumed,
                    reference,
                } => {
                    self.pos += consumed;
                    return Ok(Step::Token(reference));
                }
            }
        }
    }
}

fn read_some<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepends(usize),
    Content,
    Appends(usize),
    Done,
}

enum Frame {
    Document {
        id: DocumentId,
        phase: Phase,
        scan: ScanState,
    },
    Normal {
        definition: NormalDefinition,
        scan: ScanState,
    },
    Processor {
        full_name: String,
        definition: Box<dyn Definition>,
    },
    Literal {
        bytes: Vec<u8>,
        pos: usize,
    },
}

impl Frame {
    fn document(id: DocumentId, read_buffer_size: usize, max_variable_length: usize) -> Self {
        Frame::Document {
            id,
            phase: Phase::Prepends(0),
            scan: ScanState::new(read_buffer_size, max_variable_length),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            Frame::Normal { definition, .. } => definition.close(),
            Frame::Processor { definition, .. } => definition.close(),
            Frame::Document { .. } | Frame::Literal { .. } => Ok(()),
        }
    }
}

/// What the top frame asks the reader to do next.
enum Next {
    Wrote(usize),
    Expand(VariableRef),
    Push(Frame),
    Pop,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Streaming,
    Failed,
    Closed,
}

/// A composed document, read incrementally.
///
/// Reads may return fewer bytes than requested at any point; only `Ok(0)`
/// marks the end. When an error hits after some bytes of a read were already
/// produced, those bytes are returned first and the error is reported by the
/// next call. After any error the output must be treated as a failed compile.
pub struct StreamingDocument {
    tree: DocumentTree,
    ctx: CompileContext,
    processors: Arc<ProcessorRegistry>,
    read_buffer_size: usize,
    max_variable_length: usize,
    frames: Vec<Frame>,
    state: State,
    deferred: Option<Error>,
    guard: Option<InFlightGuard>,
}

impl StreamingDocument {
    pub(crate) fn new(
        tree: DocumentTree,
        ctx: CompileContext,
        processors: Arc<ProcessorRegistry>,
        config: &CompilerConfig,
        guard: Option<InFlightGuard>,
    ) -> Self {
        let mut document = Self {
            tree,
            ctx,
            processors,
            read_buffer_size: config.read_buffer_size,
            max_variable_length: config.max_variable_length,
            frames: Vec::new(),
            state: State::Streaming,
            deferred: None,
            guard,
        };
        let root = document.root_frame();
        document.frames.push(root);
        document
    }

    fn root_frame(&self) -> Frame {
        Frame::document(DocumentId::ROOT, self.read_buffer_size, self.max_variable_length)
    }

    pub fn tree(&self) -> &DocumentTree {
        &self.tree
    }

    pub fn context(&self) -> &CompileContext {
        &self.ctx
    }

    pub fn rid(&self) -> Rid {
        self.ctx.rid()
    }

    /// Paths of every distinct document included by the root.
    pub fn dependants(&self) -> Vec<PathBuf> {
        self.tree.dependants()
    }

    /// Number of active frames. Stays bounded by inclusion and definition depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Read the next bytes of output into `out`.
    ///
    /// Returns `Ok(0)` at the end of output. As with [`io::Read`], an empty
    /// `out` also returns `Ok(0)` without consuming anything, so callers must
    /// pass a non-empty buffer to detect the end.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        match self.state {
            State::Closed => {
                return Err(Error::new(ErrorKind::StreamFailed).with_subject("document is closed"));
            }
            State::Failed => return Err(Error::new(ErrorKind::StreamFailed)),
            State::Streaming => {}
        }
        if let Some(err) = self.deferred.take() {
            self.state = State::Failed;
            return Err(err);
        }

        let mut written = 0;
        while written < out.len() {
            match self.advance(&mut out[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) => {
                    tracing::debug!(rid = self.ctx.rid(), error = %err, "stream failed");
                    if written > 0 {
                        self.deferred = Some(err);
                        return Ok(written);
                    }
                    self.state = State::Failed;
                    return Err(err);
                }
            }
        }
        Ok(written)
    }

    /// Write at least one byte into `out`, or return 0 at the end of output.
    fn advance(&mut self, out: &mut [u8]) -> Result<usize> {
        loop {
            let next = {
                let Some(frame) = self.frames.last_mut() else {
                    return Ok(0);
                };
                match frame {
                    Frame::Document { id, phase, scan } => {
                        let node = self.tree.node_mut(*id);
                        match *phase {
                            Phase::Prepends(i) => match node.prepends.get(i).copied() {
                                Some(inclusion) => {
                                    *phase = Phase::Prepends(i + 1);
                                    if inclusion.owner {
                                        Next::Push(Frame::document(
                                            inclusion.target,
                                            self.read_buffer_size,
                                            self.max_variable_length,
                                        ))
                                    } else {
                                        Next::Continue
                                    }
                                }
                                None => {
                                    *phase = Phase::Content;
                                    Next::Continue
                                }
                            },
                            Phase::Content => match scan.step(
                                node.content.as_mut(),
                                &node.path.display(),
                                out,
                            )? {
                                Step::Wrote(n) => Next::Wrote(n),
                                Step::Token(reference) => Next::Expand(reference),
                                Step::End => {
                                    *phase = Phase::Appends(0);
                                    Next::Continue
                                }
                            },
                            Phase::Appends(i) => match node.appends.get(i).copied() {
                                Some(inclusion) => {
                                    *phase = Phase::Appends(i + 1);
                                    if inclusion.owner {
                                        Next::Push(Frame::document(
                                            inclusion.target,
                                            self.read_buffer_size,
                                            self.max_variable_length,
                                        ))
                                    } else {
                                        Next::Continue
                                    }
                                }
                                None => {
                                    *phase = Phase::Done;
                                    Next::Continue
                                }
                            },
                            Phase::Done => Next::Pop,
                        }
                    }
                    Frame::Normal { definition, scan } => {
                        let (name, value) = definition.parts_mut();
                        match scan.step(value, &name, out)? {
                            Step::Wrote(n) => Next::Wrote(n),
                            Step::Token(reference) => Next::Expand(reference),
                            Step::End => Next::Pop,
                        }
                    }
                    Frame::Processor {
                        full_name,
                        definition,
                    } => {
                        let n = read_some(definition.as_mut(), out).map_err(|e| {
                            Error::new(ErrorKind::Read)
                                .with_subject(full_name.clone())
                                .because(e)
                        })?;
                        if n == 0 { Next::Pop } else { Next::Wrote(n) }
                    }
                    Frame::Literal { bytes, pos } => {
                        let rest = &bytes[*pos..];
                        if rest.is_empty() {
                            Next::Pop
                        } else {
                            let n = rest.len().min(out.len());
                            out[..n].copy_from_slice(&rest[..n]);
                            *pos += n;
                            Next::Wrote(n)
                        }
                    }
                }
            };

            match next {
                Next::Wrote(n) => return Ok(n),
                Next::Expand(reference) => self.expand(reference)?,
                Next::Push(frame) => self.frames.push(frame),
                Next::Pop => self.pop_frame()?,
                Next::Continue => {}
            }
        }
    }

    fn expand(&mut self, reference: VariableRef) -> Result<()> {
        match resolve(&reference, &mut self.ctx, &self.processors) {
            Ok(Resolved::Normal(definition)) => {
                self.ctx.push_definition(&reference.full_name)?;
                let size = self.read_buffer_size.min(definition.value().len());
                self.frames.push(Frame::Normal {
                    definition,
                    scan: ScanState::new(size, self.max_variable_length),
                });
            }
            Ok(Resolved::Processor(definition)) => {
                self.frames.push(Frame::Processor {
                    full_name: reference.full_name,
                    definition,
                });
            }
            Err(err) if err.category() == ErrorCategory::Resolution => {
                tracing::warn!(variable = %reference.full_name, error = %err, "leaving variable unresolved");
                self.frames.push(Frame::Literal {
                    bytes: reference.full_name.into_bytes(),
                    pos: 0,
                });
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn pop_frame(&mut self) -> Result<()> {
        let Some(mut frame) = self.frames.pop() else {
            return Ok(());
        };
        if let Frame::Normal { .. } = frame {
            self.ctx.pop_definition();
        }
        let name = match &frame {
            Frame::Normal { definition, .. } => Some(definition.full_name().to_string()),
            Frame::Processor { full_name, .. } => Some(full_name.clone()),
            _ => None,
        };
        frame.close().map_err(|e| {
            Error::new(ErrorKind::Close)
                .with_subject(name.unwrap_or_default())
                .because(e)
        })
    }

    /// Start the output over from the beginning.
    ///
    /// Every document is sought back to its content start; macros are not
    /// scanned again. Pending expansions are dropped. Stream inputs that were
    /// already consumed stay consumed.
    pub fn rewind(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Err(Error::new(ErrorKind::Rewind).with_subject("document is closed"));
        }
        tracing::debug!(rid = self.ctx.rid(), "rewinding document");
        let closed = self.close_frames();
        self.ctx.clear_definition_stack();
        self.deferred = None;
        if let Err(err) = closed.and_then(|_| self.tree.rewind()) {
            self.state = State::Failed;
            return Err(err);
        }
        let root = self.root_frame();
        self.frames.push(root);
        self.state = State::Streaming;
        Ok(())
    }

    fn close_frames(&mut self) -> Result<()> {
        let mut first = None;
        while let Some(mut frame) = self.frames.pop() {
            if let Err(e) = frame.close() {
                tracing::warn!(error = %e, "failed to close definition");
                first.get_or_insert(Error::new(ErrorKind::Close).because(e));
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Release every source and definition and tell each processor the
    /// request has finished. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.state = State::Closed;
        let frames = self.close_frames();
        let documents = self.tree.close();
        for handle in self.processors.iter() {
            handle.processor().on_finish(&self.ctx.request(handle.name()));
        }
        self.guard.take();
        tracing::debug!(rid = self.ctx.rid(), "closed document");
        frames.and(documents)
    }
}

impl Read for StreamingDocument {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        StreamingDocument::read(self, buf).map_err(io::Error::from)
    }
}

impl Drop for StreamingDocument {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(rid = self.ctx.rid(), error = %err, "error while dropping document");
        }
    }
}

impl std::fmt::Debug for StreamingDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDocument")
            .field("rid", &self.ctx.rid())
            .field("documents", &self.tree.len())
            .field("depth", &self.frames.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ComposeOptions;
    use crate::processor::{MemoryProcessor, ProcessorVariable};
    use std::collections::HashMap;
    use std::path::Path;

    fn open(path: &Path, config: &CompilerConfig, processors: ProcessorRegistry) -> StreamingDocument {
        let mut ctx = CompileContext::new(1, path, HashMap::new(), HashMap::new());
        let options = ComposeOptions {
            macro_max_length: config.macro_max_length,
            converters: &[],
        };
        let tree = DocumentTree::compose(path, &mut ctx, &options).unwrap();
        StreamingDocument::new(tree, ctx, Arc::new(processors), config, None)
    }

    fn stream(document: &mut StreamingDocument, chunk: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = document.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    fn fixture(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_replays_definitions() {
        let (_dir, path) = fixture("#define $(x) hi\n$(x) $(x)");
        let mut document = open(&path, &CompilerConfig::default(), ProcessorRegistry::new());
        assert_eq!(stream(&mut document, 64).unwrap(), b"hi hi");
    }

    #[test]
    fn test_output_independent_of_buffer_sizes() {
        let (_dir, path) = fixture(
            "#define $(name) world\n#define $(greeting) hello $(name)\n$(greeting), $(greeting)! $5 $$(name)",
        );
        let expected = b"hello world, hello world! $5 $world".to_vec();
        for read_buffer_size in [1, 2, 3, 7, 4096] {
            let config = CompilerConfig {
                read_buffer_size,
                ..Default::default()
            };
            for chunk in [1, 2, 5, 64] {
                let mut document = open(&path, &config, ProcessorRegistry::new());
                assert_eq!(
                    stream(&mut document, chunk).unwrap(),
                    expected,
                    "read buffer {read_buffer_size}, chunk {chunk}"
                );
            }
        }
    }

    #[test]
    fn test_circular_definition() {
        let (_dir, path) = fixture("#define $(x) a $(x)\nbefore $(x)");
        let mut document = open(&path, &CompilerConfig::default(), ProcessorRegistry::new());
        let mut buf = [0u8; 64];
        // partial output comes first, the error on the next read
        let n = document.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"before a ");
        let err = document.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircularDefinition);
        assert_eq!(err.subject(), Some("$(x) -> $(x)"));
        assert_eq!(
            document.read(&mut buf).unwrap_err().kind(),
            ErrorKind::StreamFailed
        );
    }

    #[test]
    fn test_unresolved_stays_literal() {
        let (_dir, path) = fixture("a $(missing) b $(proc.Var) c");
        let mut document = open(&path, &CompilerConfig::default(), ProcessorRegistry::new());
        assert_eq!(
            stream(&mut document, 3).unwrap(),
            b"a $(missing) b $(proc.Var) c"
        );
    }

    #[test]
    fn test_processor_values_are_not_rescanned() {
        let (_dir, path) = fixture("#define $(x) local\n[$(clock.Raw)]");
        let processors = ProcessorRegistry::new()
            .with(Arc::new(
                MemoryProcessor::new("clock", "").constant(ProcessorVariable::new("Raw", ""), "$(x)"),
            ))
            .unwrap();
        let mut document = open(&path, &CompilerConfig::default(), processors);
        assert_eq!(stream(&mut document, 4).unwrap(), b"[$(x)]");
    }

    #[test]
    fn test_rewind_replays_output() {
        let (_dir, path) = fixture("#define $(x) hi\n$(x) there");
        let mut document = open(&path, &CompilerConfig::default(), ProcessorRegistry::new());
        let mut buf = [0u8; 4];
        document.read(&mut buf).unwrap();
        document.rewind().unwrap();
        assert_eq!(stream(&mut document, 64).unwrap(), b"hi there");
        document.rewind().unwrap();
        assert_eq!(stream(&mut document, 1).unwrap(), b"hi there");
    }

    #[test]
    fn test_empty_buffer_is_not_end_of_output() {
        let (_dir, path) = fixture("#define $(x) hi\n$(x)!");
        let mut document = open(&path, &CompilerConfig::default(), ProcessorRegistry::new());
        assert_eq!(document.read(&mut []).unwrap(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(document.read(&mut buf).unwrap(), 1);
        assert_eq!(document.read(&mut []).unwrap(), 0);
        assert_eq!(stream(&mut document, 8).unwrap(), b"i!");
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let (_dir, path) = fixture("body");
        let mut document = open(&path, &CompilerConfig::default(), ProcessorRegistry::new());
        document.close().unwrap();
        document.close().unwrap();
        assert_eq!(
            document.read(&mut [0u8; 4]).unwrap_err().kind(),
            ErrorKind::StreamFailed
        );
        assert_eq!(document.rewind().unwrap_err().kind(), ErrorKind::Rewind);
    }

    #[test]
    fn test_trailing_partial_token_is_text() {
        let (_dir, path) = fixture("#define $(a) 1\nvalue $(a) $(a");
        let config = CompilerConfig {
            read_buffer_size: 2,
            ..Default::default()
        };
        let mut document = open(&path, &config, ProcessorRegistry::new());
        assert_eq!(stream(&mut document, 3).unwrap(), b"value 1 $(a");
    }
}
