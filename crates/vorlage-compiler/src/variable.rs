/*
 * variable.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Incremental variable token scanning.
//!
//! A variable is written `$(name)` or `$(processor.name)`. Tokens may arrive
//! split across any number of read calls, so [`VariableScanner`] carries the
//! bytes of a token in progress between calls in a bounded scratch buffer.

use memchr::memchr;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::error::{Error, ErrorKind, Result};

pub const VARIABLE_PREFIX: &[u8] = b"$(";
pub const VARIABLE_SUFFIX: u8 = b')';
pub const PROCESSOR_SEPARATOR: char = '.';

static VARIABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[a-z0-9]+\.)?[a-zA-Z0-9]+$").unwrap());

/// A recognized variable token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRef {
    /// The token as written, delimiters included: `$(proc.name)`.
    pub full_name: String,
    /// The bare name between the delimiters: `proc.name`.
    pub name: String,
    /// `Some(("proc", "name"))` for processor variables.
    pub processor: Option<(String, String)>,
    /// Offset of the token's first byte in the scanned stream.
    pub offset: u64,
}

impl VariableRef {
    /// Parse a complete token, delimiters included.
    pub fn parse(token: &[u8], offset: u64) -> Result<Self> {
        let inner = token
            .strip_prefix(VARIABLE_PREFIX)
            .and_then(|t| t.strip_suffix(&[VARIABLE_SUFFIX]))
            .unwrap_or(token);
        if !token.starts_with(VARIABLE_PREFIX)
            || token.last() != Some(&VARIABLE_SUFFIX)
            || !VARIABLE_NAME.is_match(inner)
        {
            return Err(Error::new(ErrorKind::InvalidVariableName)
                .with_subject(format!("'{}'", String::from_utf8_lossy(inner))));
        }

        // the regex guarantees ASCII
        let name = String::from_utf8_lossy(inner).into_owned();
        let processor = name
            .split_once(PROCESSOR_SEPARATOR)
            .map(|(p, v)| (p.to_string(), v.to_string()));
        Ok(Self {
            full_name: String::from_utf8_lossy(token).into_owned(),
            name,
            processor,
            offset,
        })
    }

    pub fn is_processor_variable(&self) -> bool {
        self.processor.is_some()
    }

    pub fn processor_name(&self) -> Option<&str> {
        self.processor.as_ref().map(|(p, _)| p.as_str())
    }

    pub fn processor_variable(&self) -> Option<&str> {
        self.processor.as_ref().map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Display for VariableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}'", self.full_name)
    }
}

/// Outcome of one [`VariableScanner::scan`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// The first `n` bytes of the chunk are plain text and may be emitted as-is.
    Text(usize),
    /// `n` bytes were absorbed into a token in progress; feed more input.
    Pending(usize),
    /// Buffered bytes turned out not to start a token. `literal` must be
    /// emitted before anything else; `consumed` bytes of the chunk were used.
    Rejected { consumed: usize, literal: Vec<u8> },
    /// A complete token ended after `consumed` bytes of the chunk.
    Token {
        consumed: usize,
        reference: VariableRef,
    },
}

/// Restartable scanner for variable tokens.
#[derive(Debug, Clone)]
pub struct VariableScanner {
    pending: Vec<u8>,
    max_length: usize,
    /// Stream offset of the next byte to be fed.
    position: u64,
}

impl VariableScanner {
    pub fn new(max_length: usize) -> Self {
        Self {
            pending: Vec::with_capacity(max_length),
            max_length,
            position: 0,
        }
    }

    /// Bytes of a token in progress.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget any token in progress and restart offsets at zero.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.position = 0;
    }

    /// Hand back the bytes of an unfinished token at end of input.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Scan the next chunk of input. `chunk` must not be empty.
    pub fn scan(&mut self, chunk: &[u8]) -> Result<Scan> {
        debug_assert!(!chunk.is_empty());

        if self.pending.is_empty() {
            match memchr(VARIABLE_PREFIX[0], chunk) {
                None => {
                    self.position += chunk.len() as u64;
                    return Ok(Scan::Text(chunk.len()));
                }
                Some(i) if i > 0 => {
                    self.position += i as u64;
                    return Ok(Scan::Text(i));
                }
                Some(_) => {}
            }
        }

        let mut consumed = 0;
        while consumed < chunk.len() {
            if self.pending.len() < VARIABLE_PREFIX.len() {
                self.pending.push(chunk[consumed]);
                consumed += 1;
                if !VARIABLE_PREFIX.starts_with(&self.pending) {
                    self.position += consumed as u64;
                    let literal = self.reject();
                    return Ok(Scan::Rejected { consumed, literal });
                }
                continue;
            }

            let room = self.max_length.saturating_sub(self.pending.len());
            let window = &chunk[consumed..chunk.len().min(consumed + room)];
            match memchr(VARIABLE_SUFFIX, window) {
                Some(i) => {
                    self.pending.extend_from_slice(&window[..=i]);
                    consumed += i + 1;
                    self.position += consumed as u64;
                    let token = std::mem::take(&mut self.pending);
                    let offset = self.position - token.len() as u64;
                    let reference = VariableRef::parse(&token, offset)?;
                    return Ok(Scan::Token {
                        consumed,
                        reference,
                    });
                }
                None => {
                    self.pending.extend_from_slice(window);
                    consumed += window.len();
                    if self.pending.len() >= self.max_length {
                        self.position += consumed as u64;
                        let offset = self.position - self.pending.len() as u64;
                        self.pending.clear();
                        return Err(Error::new(ErrorKind::VariableTooLong)
                            .with_subject(format!(
                                "offset {offset}, longer than {} bytes",
                                self.max_length
                            )));
                    }
                }
            }
        }

        self.position += consumed as u64;
        Ok(Scan::Pending(consumed))
    }

    /// Drop the leading byte of a failed prefix match and keep whatever tail
    /// could still begin a token.
    fn reject(&mut self) -> Vec<u8> {
        let buffered = std::mem::take(&mut self.pending);
        let restart = memchr(VARIABLE_PREFIX[0], &buffered[1..])
            .map(|i| i + 1)
            .unwrap_or(buffered.len());
        self.pending.extend_from_slice(&buffered[restart..]);
        buffered[..restart].to_vec()
    }
}
