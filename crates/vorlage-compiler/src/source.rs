/*
 * source.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Byte sources for a document's own content, and the file converter hook.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A rewindable source of a document's own content.
pub trait ContentSource: Read + Send {
    /// Return to the first content byte (just after the macro lines).
    fn rewind(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Content read straight from the document file.
#[derive(Debug)]
pub struct FileSource {
    file: Option<File>,
    content_start: u64,
}

impl FileSource {
    /// Wrap `file`, positioning it at `content_start`.
    pub fn new(mut file: File, content_start: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(content_start))?;
        Ok(Self {
            file: Some(file),
            content_start,
        })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("source already closed"))
    }
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

impl ContentSource for FileSource {
    fn rewind(&mut self) -> io::Result<()> {
        let start = self.content_start;
        self.file()?.seek(SeekFrom::Start(start)).map(|_| ())
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.take();
        Ok(())
    }
}

/// Content held in memory. Converters typically return one of these.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    cursor: Cursor<Vec<u8>>,
}

impl MemorySource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            cursor: Cursor::new(bytes.into()),
        }
    }
}

impl Read for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl ContentSource for MemorySource {
    fn rewind(&mut self) -> io::Result<()> {
        self.cursor.set_position(0);
        Ok(())
    }
}

/// Transforms a document's own content before variable scanning.
///
/// The first registered converter whose [`FileConverter::should_convert`]
/// accepts a path wraps that document's content source. Macro lines are
/// detected on the raw file and are never seen by converters.
pub trait FileConverter: Send + Sync {
    fn should_convert(&self, path: &Path) -> bool;

    fn convert(&self, source: Box<dyn ContentSource>) -> io::Result<Box<dyn ContentSource>>;

    fn description(&self) -> &str {
        ""
    }
}

/// Stable identity of an opened file, used to spot the same document
/// reached through different paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileIdentity {
    Inode { device: u64, inode: u64 },
    Path(PathBuf),
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(file: &File, _path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        let meta = file.metadata()?;
        Ok(FileIdentity::Inode {
            device: meta.dev(),
            inode: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn of(file: &File, path: &Path) -> io::Result<Self> {
        file.metadata()?;
        Ok(FileIdentity::Path(std::fs::canonicalize(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_source_rewinds_to_content_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "#define $(a) 1\nbody").unwrap();

        let mut source = FileSource::new(File::open(&path).unwrap(), 15).unwrap();
        let mut text = String::new();
        source.read_to_string(&mut text).unwrap();
        assert_eq!(text, "body");

        source.rewind().unwrap();
        text.clear();
        source.read_to_string(&mut text).unwrap();
        assert_eq!(text, "body");
    }

    #[test]
    fn test_closed_file_source_fails() {
        let file = tempfile::tempfile().unwrap();
        let mut source = FileSource::new(file, 0).unwrap();
        source.close().unwrap();
        assert!(source.read(&mut [0u8; 4]).is_err());
        assert!(source.rewind().is_err());
    }

    #[test]
    fn test_identity_follows_file_not_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "x").unwrap();
        let via_dot = dir.path().join(".").join("a.txt");

        let first = FileIdentity::of(&File::open(&a).unwrap(), &a).unwrap();
        let second = FileIdentity::of(&File::open(&via_dot).unwrap(), &via_dot).unwrap();
        assert_eq!(first, second);
    }
}
