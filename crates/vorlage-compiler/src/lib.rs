/*
 * lib.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Streaming document composition for Vorlage.
//!
//! A document starts with directive lines and continues with content that
//! may reference variables:
//!
//! - `#prepend path` and `#append path` include other documents around this
//!   one, resolved relative to the including document
//! - `#define $(name) value` declares a request-local variable
//! - `$(name)` expands a `#define`d variable, `$(processor.Name)` asks a
//!   registered [`Processor`] for a value
//!
//! Composition happens up front and catches structural problems (inclusion
//! cycles, duplicate definitions, malformed directives) before any output is
//! produced. Variables are only resolved while the output streams, one
//! buffer at a time, so a document is never held in memory as a whole.
//!
//! # Example
//!
//! ```ignore
//! use std::collections::HashMap;
//! use std::io::Read;
//! use vorlage_compiler::{Compiler, CompilerConfig};
//!
//! let compiler = Compiler::new(CompilerConfig::default())?;
//! let mut document = compiler.compose("index.html", HashMap::new(), HashMap::new())?;
//! let mut output = String::new();
//! document.read_to_string(&mut output)?;
//! document.close()?;
//! ```

pub mod compiler;
pub mod config;
pub mod context;
pub mod definition;
pub mod document;
pub mod error;
pub mod macros;
pub mod processor;
pub mod reader;
pub mod resolver;
pub mod source;
pub mod variable;

// Re-export main types at crate root
pub use compiler::{
    ActionHandler, CollectingActionHandler, CompileRequest, Compiler, NoopActionHandler,
};
pub use config::CompilerConfig;
pub use context::CompileContext;
pub use definition::{Definition, DefinitionRegistry, NormalDefinition, StringDefinition};
pub use document::{DocumentId, DocumentNode, DocumentTree, Inclusion};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use macros::{MacroPosition, detect_macros};
pub use processor::{
    Action, DefineCall, InputPrototype, MemoryProcessor, Processor, ProcessorError,
    ProcessorHandle, ProcessorInfo, ProcessorRegistry, ProcessorVariable, RequestInfo, Rid,
    StreamInput,
};
pub use reader::StreamingDocument;
pub use source::{ContentSource, FileConverter, FileIdentity, FileSource, MemorySource};
pub use variable::{VariableRef, VariableScanner};
