/*
 * macros.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Macro line scanning and classification.
//!
//! Macros are directive lines at the very top of a document:
//!
//! ```text
//! #prepend header.html
//! #define $(title) Quarterly report
//! #append footer.html
//! ```
//!
//! Scanning stops at the first line that does not start with [`MACRO_PREFIX`];
//! that offset becomes the document's raw content start.

use std::io::{Read, Seek, SeekFrom};

use memchr::memchr;

use crate::error::{Error, ErrorKind, Result};

pub const MACRO_PREFIX: &[u8] = b"#";
pub const MACRO_ARGUMENT_SEPARATOR: char = ' ';
pub const END_OF_LINE: u8 = b'\n';

pub const DEFINE: &str = "#define";
pub const PREPEND: &str = "#prepend";
pub const APPEND: &str = "#append";

/// One scanned directive line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroPosition {
    /// Tokens of the line, directive keyword first. Never empty.
    pub args: Vec<String>,
    /// Byte offset of the line in the raw file.
    pub offset: u64,
    /// Length of the line including its terminator.
    pub length: usize,
    /// 1-based line number.
    pub line: usize,
}

impl MacroPosition {
    pub fn keyword(&self) -> &str {
        &self.args[0]
    }

    /// Everything after the keyword and the first argument, joined back with single spaces.
    pub fn value(&self) -> String {
        self.args[2..].join(" ")
    }

    /// Everything after the keyword, joined back with single spaces.
    pub fn operand(&self) -> String {
        self.args[1..].join(" ")
    }

    pub fn location(&self) -> String {
        format!("line {}", self.line)
    }
}

/// Scan a single macro out of the start of `window`.
///
/// Returns `Ok(None)` when the window does not start with the macro prefix.
/// `at_eof` tells whether the window reaches the end of the file, in which
/// case the final line may go without a terminator.
pub fn scan_macro(
    window: &[u8],
    offset: u64,
    line: usize,
    at_eof: bool,
) -> Result<Option<MacroPosition>> {
    if !window.starts_with(MACRO_PREFIX) {
        return Ok(None);
    }

    let (text, length) = match memchr(END_OF_LINE, &window[MACRO_PREFIX.len()..]) {
        Some(i) => {
            let end = MACRO_PREFIX.len() + i;
            (&window[..end], end + 1)
        }
        None if at_eof => (window, window.len()),
        None => {
            return Err(Error::new(ErrorKind::UnterminatedMacro)
                .with_subject(format!("line {line}")));
        }
    };

    let text = String::from_utf8_lossy(text);
    let text = text.strip_suffix('\r').unwrap_or(&text);
    let args: Vec<String> = text
        .split(MACRO_ARGUMENT_SEPARATOR)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    Ok(Some(MacroPosition {
        args,
        offset,
        length,
        line,
    }))
}

/// Result of [`detect_macros`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedMacros {
    pub macros: Vec<MacroPosition>,
    /// Offset of the first byte after the last macro line.
    pub content_start: u64,
}

/// Scan `source` from the beginning for consecutive macro lines.
///
/// At most `max_length` bytes are held at once; a directive line that does
/// not fit is reported as unterminated.
pub fn detect_macros<R: Read + Seek>(source: &mut R, max_length: usize) -> Result<DetectedMacros> {
    let mut buffer = vec![0u8; max_length];
    let mut detected = DetectedMacros::default();
    let mut at: u64 = 0;
    let mut line = 0;

    loop {
        line += 1;
        source
            .seek(SeekFrom::Start(at))
            .map_err(|e| Error::new(ErrorKind::Seek).because(e))?;
        let (n, at_eof) = fill(source, &mut buffer)
            .map_err(|e| Error::new(ErrorKind::Read).because(e))?;

        match scan_macro(&buffer[..n], at, line, at_eof)? {
            Some(pos) => {
                tracing::trace!(keyword = %pos.keyword(), line, "detected macro");
                at += pos.length as u64;
                detected.macros.push(pos);
            }
            None => {
                detected.content_start = at;
                return Ok(detected);
            }
        }
    }
}

/// Read until `buf` is full or the source is exhausted.
///
/// Also reports whether the source ended inside the window. A window that is
/// filled exactly is followed by a one-byte read to tell the two apart.
fn fill<R: Read>(source: &mut R, buf: &mut [u8]) -> std::io::Result<(usize, bool)> {
    let mut total = 0;
    while total < buf.len() {
        match source.read(&mut buf[total..]) {
            Ok(0) => return Ok((total, true)),
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    let mut probe = [0u8; 1];
    loop {
        match source.read(&mut probe) {
            Ok(n) => return Ok((total, n == 0)),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Directive kinds the composer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Define,
    Prepend,
    Append,
}

impl Directive {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            DEFINE => Some(Directive::Define),
            PREPEND => Some(Directive::Prepend),
            APPEND => Some(Directive::Append),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Directive::Define => DEFINE,
            Directive::Prepend => PREPEND,
            Directive::Append => APPEND,
        }
    }

    /// Keyword included.
    pub fn min_args(self) -> usize {
        match self {
            Directive::Define => 3,
            Directive::Prepend | Directive::Append => 2,
        }
    }
}

/// Macro indices bucketed by directive, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedMacros {
    pub defines: Vec<usize>,
    pub prepends: Vec<usize>,
    pub appends: Vec<usize>,
}

/// Bucket `macros` by directive and check argument counts.
///
/// Unknown keywords are skipped.
pub fn classify(macros: &[MacroPosition]) -> Result<ClassifiedMacros> {
    let mut classified = ClassifiedMacros::default();
    for (i, pos) in macros.iter().enumerate() {
        let Some(directive) = pos.args.first().and_then(|k| Directive::from_keyword(k)) else {
            continue;
        };
        if pos.args.len() < directive.min_args() {
            return Err(Error::new(ErrorKind::MissingArguments)
                .with_subject(format!("{} on {}", directive.keyword(), pos.location())));
        }
        match directive {
            Directive::Define => classified.defines.push(i),
            Directive::Prepend => classified.prepends.push(i),
            Directive::Append => classified.appends.push(i),
        }
    }
    Ok(classified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_scan_macro_not_a_macro() {
        assert_eq!(scan_macro(b"hello\n", 0, 1, true).unwrap(), None);
    }

    #[test]
    fn test_scan_macro_splits_arguments() {
        let pos = scan_macro(b"#define  $(x)  hello world\nbody", 7, 2, false)
            .unwrap()
            .unwrap();
        assert_eq!(pos.args, vec!["#define", "$(x)", "hello", "world"]);
        assert_eq!(pos.offset, 7);
        assert_eq!(pos.length, 27);
        assert_eq!(pos.line, 2);
        assert_eq!(pos.value(), "hello world");
    }

    #[test]
    fn test_scan_macro_without_terminator_in_full_window() {
        let err = scan_macro(b"#define $(x) aaaaaaaa", 0, 4, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnterminatedMacro);
        assert_eq!(err.subject(), Some("line 4"));
    }

    #[test]
    fn test_scan_macro_last_line_at_eof() {
        let pos = scan_macro(b"#append footer.txt", 0, 1, true).unwrap().unwrap();
        assert_eq!(pos.args, vec!["#append", "footer.txt"]);
        assert_eq!(pos.length, 18);
    }

    #[test]
    fn test_scan_macro_strips_carriage_return() {
        let pos = scan_macro(b"#prepend a.txt\r\n", 0, 1, false).unwrap().unwrap();
        assert_eq!(pos.args, vec!["#prepend", "a.txt"]);
        assert_eq!(pos.length, 16);
    }

    #[test]
    fn test_detect_macros_content_start() {
        let mut source = Cursor::new(b"#define $(a) 1\n#prepend x.txt\nbody $(a)\n".to_vec());
        let detected = detect_macros(&mut source, 64).unwrap();
        assert_eq!(detected.macros.len(), 2);
        assert_eq!(detected.macros[1].line, 2);
        assert_eq!(detected.content_start, 30);
    }

    #[test]
    fn test_detect_macros_none() {
        let mut source = Cursor::new(b"plain text".to_vec());
        let detected = detect_macros(&mut source, 64).unwrap();
        assert!(detected.macros.is_empty());
        assert_eq!(detected.content_start, 0);
    }

    #[test]
    fn test_detect_macros_line_too_long() {
        let mut source = Cursor::new(b"#define $(a) 0123456789abcdef\nbody".to_vec());
        let err = detect_macros(&mut source, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnterminatedMacro);
    }

    #[test]
    fn test_detect_macros_last_line_fills_window() {
        let mut source = Cursor::new(b"#define $(a) 123".to_vec());
        let detected = detect_macros(&mut source, 16).unwrap();
        assert_eq!(detected.macros.len(), 1);
        assert_eq!(detected.macros[0].args, vec!["#define", "$(a)", "123"]);
        assert_eq!(detected.content_start, 16);

        let mut source = Cursor::new(b"#define $(a) 1234".to_vec());
        let err = detect_macros(&mut source, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnterminatedMacro);
    }

    #[test]
    fn test_classify_buckets_in_order() {
        let mut source = Cursor::new(
            b"#append z.txt\n#define $(a) 1\n#pragma once\n#prepend x.txt\n#append y.txt\n"
                .to_vec(),
        );
        let detected = detect_macros(&mut source, 64).unwrap();
        let classified = classify(&detected.macros).unwrap();
        assert_eq!(classified.defines, vec![1]);
        assert_eq!(classified.prepends, vec![3]);
        assert_eq!(classified.appends, vec![0, 4]);
    }

    #[test]
    fn test_classify_missing_arguments() {
        let macros = vec![scan_macro(b"#define $(a)\n", 0, 3, false).unwrap().unwrap()];
        let err = classify(&macros).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingArguments);
        assert_eq!(err.subject(), Some("#define on line 3"));

        let macros = vec![scan_macro(b"#prepend\n", 0, 1, false).unwrap().unwrap()];
        assert_eq!(
            classify(&macros).unwrap_err().kind(),
            ErrorKind::MissingArguments
        );
    }
}
