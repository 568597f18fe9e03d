/*
 * document.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Document composition.
//!
//! [`DocumentTree::compose`] opens the root document, scans its macro lines,
//! and recursively opens every `#prepend`ed and `#append`ed document. Nodes
//! live in an arena and refer to each other by [`DocumentId`]; the parent
//! link is only ever used to walk up for cycle detection.
//!
//! A file included more than once (judged by [`FileIdentity`], not by path)
//! is composed and emitted only at its first inclusion. Later inclusions are
//! recorded as aliases and produce no output.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::CompileContext;
use crate::definition::NormalDefinition;
use crate::error::{Error, ErrorKind, Result};
use crate::macros::{ClassifiedMacros, MacroPosition, classify, detect_macros};
use crate::source::{ContentSource, FileConverter, FileIdentity, FileSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(usize);

impl DocumentId {
    pub const ROOT: DocumentId = DocumentId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// One `#prepend` or `#append` edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inclusion {
    pub target: DocumentId,
    /// Only the first inclusion of a file owns (and emits) its content.
    pub owner: bool,
}

pub struct DocumentNode {
    pub path: PathBuf,
    pub identity: FileIdentity,
    pub parent: Option<DocumentId>,
    pub macros: Vec<MacroPosition>,
    pub classified: ClassifiedMacros,
    pub prepends: Vec<Inclusion>,
    pub appends: Vec<Inclusion>,
    /// Offset of the first byte after the macro lines.
    pub content_start: u64,
    pub(crate) content: Box<dyn ContentSource>,
}

impl std::fmt::Debug for DocumentNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentNode")
            .field("path", &self.path)
            .field("parent", &self.parent)
            .field("prepends", &self.prepends)
            .field("appends", &self.appends)
            .field("content_start", &self.content_start)
            .finish_non_exhaustive()
    }
}

/// Settings used while composing.
#[derive(Clone, Copy)]
pub struct ComposeOptions<'a> {
    pub macro_max_length: usize,
    pub converters: &'a [Arc<dyn FileConverter>],
}

enum Composed {
    Owned(DocumentId),
    Alias(DocumentId),
}

#[derive(Debug)]
pub struct DocumentTree {
    nodes: Vec<DocumentNode>,
    included: HashMap<FileIdentity, DocumentId>,
}

impl DocumentTree {
    /// Compose the tree rooted at `path`, registering every `#define` in `ctx`.
    pub fn compose(
        path: impl AsRef<Path>,
        ctx: &mut CompileContext,
        options: &ComposeOptions<'_>,
    ) -> Result<Self> {
        let mut tree = DocumentTree {
            nodes: Vec::new(),
            included: HashMap::new(),
        };
        let result = tree.compose_node(path.as_ref().to_path_buf(), None, ctx, options);
        if let Err(err) = result {
            // nothing was handed out yet, so release what was opened
            let _ = tree.close();
            return Err(err);
        }
        tracing::debug!(
            path = %path.as_ref().display(),
            documents = tree.nodes.len(),
            definitions = ctx.definitions.len(),
            "composed document tree"
        );
        Ok(tree)
    }

    fn compose_node(
        &mut self,
        path: PathBuf,
        parent: Option<DocumentId>,
        ctx: &mut CompileContext,
        options: &ComposeOptions<'_>,
    ) -> Result<Composed> {
        let mut file = File::open(&path).map_err(|e| Error::io(ErrorKind::Open, path.display(), e))?;
        let identity = FileIdentity::of(&file, &path)
            .map_err(|e| Error::io(ErrorKind::Identity, path.display(), e))?;

        if let Some(parent) = parent {
            self.check_ancestors(parent, &identity, &path)?;
        }
        if let Some(&existing) = self.included.get(&identity) {
            tracing::debug!(path = %path.display(), "document already included, not reading it again");
            return Ok(Composed::Alias(existing));
        }

        let detected = detect_macros(&mut file, options.macro_max_length).map_err(|e| {
            Error::new(ErrorKind::Macros)
                .with_subject(path.display().to_string())
                .because(e)
        })?;
        let classified = classify(&detected.macros).map_err(|e| {
            Error::new(ErrorKind::Macros)
                .with_subject(path.display().to_string())
                .because(e)
        })?;

        let source = FileSource::new(file, detected.content_start)
            .map_err(|e| Error::io(ErrorKind::Seek, path.display(), e))?;
        let mut content: Box<dyn ContentSource> = Box::new(source);
        if let Some(converter) = options.converters.iter().find(|c| c.should_convert(&path)) {
            tracing::debug!(path = %path.display(), converter = converter.description(), "converting document");
            content = converter
                .convert(content)
                .map_err(|e| Error::io(ErrorKind::Convert, path.display(), e))?;
        }

        let id = DocumentId(self.nodes.len());
        self.included.insert(identity.clone(), id);
        self.nodes.push(DocumentNode {
            path: path.clone(),
            identity,
            parent,
            macros: detected.macros,
            classified,
            prepends: Vec::new(),
            appends: Vec::new(),
            content_start: detected.content_start,
            content,
        });

        let node = &self.nodes[id.0];
        let defines: Vec<(String, String, String)> = node
            .classified
            .defines
            .iter()
            .map(|&i| {
                let pos = &node.macros[i];
                (pos.args[1].clone(), pos.value(), pos.location())
            })
            .collect();
        let prepends: Vec<String> = node
            .classified
            .prepends
            .iter()
            .map(|&i| node.macros[i].operand())
            .collect();
        let appends: Vec<String> = node
            .classified
            .appends
            .iter()
            .map(|&i| node.macros[i].operand())
            .collect();

        for (variable, value, location) in defines {
            NormalDefinition::new(&variable, &value)
                .and_then(|definition| ctx.definitions.insert(definition))
                .map_err(|e| {
                    Error::new(ErrorKind::Macros)
                        .with_subject(format!("{}, {location}", path.display()))
                        .because(e)
                })?;
        }

        let base = path.parent().unwrap_or(Path::new("")).to_path_buf();
        for target in prepends {
            let inclusion = self.include(&base, &target, id, ctx, options)?;
            self.nodes[id.0].prepends.push(inclusion);
        }
        for target in appends {
            let inclusion = self.include(&base, &target, id, ctx, options)?;
            self.nodes[id.0].appends.push(inclusion);
        }

        Ok(Composed::Owned(id))
    }

    fn include(
        &mut self,
        base: &Path,
        target: &str,
        parent: DocumentId,
        ctx: &mut CompileContext,
        options: &ComposeOptions<'_>,
    ) -> Result<Inclusion> {
        let path = base.join(target);
        let composed = self
            .compose_node(path.clone(), Some(parent), ctx, options)
            .map_err(|e| {
                Error::new(ErrorKind::Include)
                    .with_subject(path.display().to_string())
                    .because(e)
            })?;
        Ok(match composed {
            Composed::Owned(target) => Inclusion {
                target,
                owner: true,
            },
            Composed::Alias(target) => Inclusion {
                target,
                owner: false,
            },
        })
    }

    /// Fail if `identity` is `from` or one of its ancestors.
    fn check_ancestors(&self, from: DocumentId, identity: &FileIdentity, path: &Path) -> Result<()> {
        let mut chain = Vec::new();
        let mut found = false;
        let mut current = Some(from);
        while let Some(id) = current {
            let node = &self.nodes[id.0];
            chain.push(node.path.display().to_string());
            found |= &node.identity == identity;
            current = node.parent;
        }
        if !found {
            return Ok(());
        }
        chain.reverse();
        chain.push(path.display().to_string());
        Err(Error::new(ErrorKind::CircularInclusion).with_subject(chain.join(" -> ")))
    }

    pub fn root(&self) -> &DocumentNode {
        &self.nodes[DocumentId::ROOT.0]
    }

    pub fn node(&self, id: DocumentId) -> &DocumentNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: DocumentId) -> &mut DocumentNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (DocumentId, &DocumentNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (DocumentId(i), n))
    }

    /// Paths of every distinct document included by the root, in composition order.
    pub fn dependants(&self) -> Vec<PathBuf> {
        self.nodes.iter().skip(1).map(|n| n.path.clone()).collect()
    }

    /// Seek every document back to its content start.
    pub fn rewind(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.content
                .rewind()
                .map_err(|e| Error::io(ErrorKind::Rewind, node.path.display(), e))?;
        }
        Ok(())
    }

    /// Close every document source, returning the first failure.
    pub fn close(&mut self) -> Result<()> {
        let mut first = None;
        for node in &mut self.nodes {
            if let Err(e) = node.content.close() {
                tracing::warn!(path = %node.path.display(), error = %e, "failed to close document");
                first.get_or_insert(Error::io(ErrorKind::Close, node.path.display(), e));
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn compose(path: &Path) -> (Result<DocumentTree>, CompileContext) {
        let mut ctx = CompileContext::new(1, path, HashMap::new(), HashMap::new());
        let options = ComposeOptions {
            macro_max_length: 1024,
            converters: &[],
        };
        let tree = DocumentTree::compose(path, &mut ctx, &options);
        (tree, ctx)
    }

    #[test]
    fn test_compose_single_document() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "root.txt", "#define $(x) hi\n$(x) $(x)");
        let (tree, ctx) = compose(&root);
        let tree = tree.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root().content_start, 16);
        assert_eq!(ctx.definitions().get("$(x)").unwrap().value(), b"hi");
        assert!(tree.dependants().is_empty());
    }

    #[test]
    fn test_includes_are_relative_to_including_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("parts")).unwrap();
        write(dir.path(), "parts/header.txt", "#prepend inner.txt\nH");
        write(dir.path(), "parts/inner.txt", "I");
        let root = write(dir.path(), "root.txt", "#prepend parts/header.txt\nbody");
        let (tree, _) = compose(&root);
        let tree = tree.unwrap();
        assert_eq!(tree.len(), 3);
        let header = tree.root().prepends[0].target;
        assert!(tree.node(header).path.ends_with("parts/header.txt"));
        let inner = tree.node(header).prepends[0].target;
        assert!(tree.node(inner).path.ends_with("parts/inner.txt"));
        assert_eq!(tree.node(inner).parent, Some(header));
    }

    #[test]
    fn test_repeated_inclusion_is_an_alias() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "A");
        let root = write(dir.path(), "root.txt", "#prepend a.txt\n#append ./a.txt\nbody");
        let (tree, _) = compose(&root);
        let tree = tree.unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.root().prepends[0].owner);
        assert!(!tree.root().appends[0].owner);
        assert_eq!(tree.root().prepends[0].target, tree.root().appends[0].target);
        assert_eq!(tree.dependants().len(), 1);
    }

    #[test]
    fn test_cycle_is_rejected_with_chain() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.txt", "#append a.txt\nB");
        let a = write(dir.path(), "a.txt", "#prepend b.txt\nA");
        let (tree, _) = compose(&a);
        let err = tree.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Include);
        let cycle = err.root_cause();
        assert_eq!(cycle.kind(), ErrorKind::CircularInclusion);
        let chain = cycle.subject().unwrap();
        assert!(chain.ends_with("a.txt"));
        assert_eq!(chain.matches(" -> ").count(), 2);
    }

    #[test]
    fn test_self_inclusion_is_a_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.txt", "#append a.txt\nA");
        let (tree, _) = compose(&a);
        assert!(tree.unwrap_err().has_kind(ErrorKind::CircularInclusion));
    }

    #[test]
    fn test_duplicate_definition_across_documents() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "#define $(x) two\nA");
        let root = write(dir.path(), "root.txt", "#define $(x) one\n#prepend a.txt\nbody");
        let (tree, _) = compose(&root);
        let err = tree.unwrap_err();
        assert!(err.has_kind(ErrorKind::AlreadyDefined));
        assert_eq!(err.category(), crate::error::ErrorCategory::Structural);
    }

    #[test]
    fn test_missing_include() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "root.txt", "#append nowhere.txt\nbody");
        let (tree, _) = compose(&root);
        let err = tree.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Include);
        assert_eq!(err.cause().map(Error::kind), Some(ErrorKind::Open));
    }

    #[test]
    fn test_malformed_directive() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "root.txt", "#define $(x)\nbody");
        let (tree, _) = compose(&root);
        let err = tree.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Macros);
        assert!(err.has_kind(ErrorKind::MissingArguments));
    }
}
