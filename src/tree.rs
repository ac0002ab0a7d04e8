//! The in-memory node tree behind a mount.
//!
//! Nodes live in an arena and are addressed by inode number: the root is inode 1 and every
//! other node gets the next free number when it is first created, so numbers are stable for the
//! lifetime of the mount.  File nodes never hold content, only their [`FileRecord`] and a
//! reference to the session that can fetch it.

use std::collections::BTreeMap;

use crate::client::{HelperClient, Result};
use crate::index::{FileRecord, MergedIndex};

pub const ROOT_INODE: u64 = 1;

/// Permission bits of directories that have no record in the index.
const SYNTHETIC_DIR_MODE: u32 = 0o755;

/// A regular file whose content stays with the helper.
#[derive(Debug)]
pub struct LazyFile<'a> {
    pub record: FileRecord,
    client: &'a HelperClient,
}

impl LazyFile<'_> {
    pub fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.client.read(&self.record.path, offset, size)
    }
}

#[derive(Debug, Default)]
pub struct Directory {
    /// The index entry for this directory, if the image has one.
    pub record: Option<FileRecord>,
    pub children: BTreeMap<String, u64>,
}

impl Directory {
    pub fn mode(&self) -> u32 {
        self.record
            .as_ref()
            .map_or(SYNTHETIC_DIR_MODE, |record| record.mode)
    }

    pub fn mtime(&self) -> i64 {
        self.record.as_ref().map_or(0, |record| record.mtime)
    }
}

#[derive(Debug)]
pub enum NodeKind<'a> {
    Directory(Directory),
    File(LazyFile<'a>),
}

#[derive(Debug)]
pub struct Node<'a> {
    pub ino: u64,
    pub parent: u64,
    pub kind: NodeKind<'a>,
}

impl Node<'_> {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(..))
    }

    /// Mode bits as recorded in the image (or synthesized for implicit directories).
    pub fn mode(&self) -> u32 {
        match &self.kind {
            NodeKind::Directory(dir) => dir.mode(),
            NodeKind::File(file) => file.record.mode,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::Directory(..) => 0,
            NodeKind::File(file) => file.record.size,
        }
    }

    pub fn mtime(&self) -> i64 {
        match &self.kind {
            NodeKind::Directory(dir) => dir.mtime(),
            NodeKind::File(file) => file.record.mtime,
        }
    }
}

#[derive(Debug)]
pub struct Tree<'a> {
    nodes: Vec<Node<'a>>,
}

impl Default for Tree<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

impl<'a> Tree<'a> {
    /// A tree holding only an empty root directory.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                ino: ROOT_INODE,
                parent: ROOT_INODE,
                kind: NodeKind::Directory(Directory::default()),
            }],
        }
    }

    /// Materializes every record of `index`, creating parent directories as needed.
    pub fn build(index: &MergedIndex, client: &'a HelperClient) -> Self {
        let mut tree = Self::new();
        for record in index.records() {
            tree.insert(record, client);
        }
        log::debug!("built tree of {} nodes", tree.len());
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, ino: u64) -> Option<&Node<'a>> {
        let idx = usize::try_from(ino.checked_sub(1)?).ok()?;
        self.nodes.get(idx)
    }

    fn get_mut(&mut self, ino: u64) -> Option<&mut Node<'a>> {
        let idx = usize::try_from(ino.checked_sub(1)?).ok()?;
        self.nodes.get_mut(idx)
    }

    fn directory(&self, ino: u64) -> Option<&Directory> {
        match &self.get(ino)?.kind {
            NodeKind::Directory(dir) => Some(dir),
            NodeKind::File(..) => None,
        }
    }

    fn directory_mut(&mut self, ino: u64) -> Option<&mut Directory> {
        match &mut self.get_mut(ino)?.kind {
            NodeKind::Directory(dir) => Some(dir),
            NodeKind::File(..) => None,
        }
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Option<&Node<'a>> {
        let ino = *self.directory(parent)?.children.get(name)?;
        self.get(ino)
    }

    fn add_node(&mut self, parent: u64, name: &str, kind: NodeKind<'a>) -> u64 {
        let ino = self.nodes.len() as u64 + 1;
        self.nodes.push(Node { ino, parent, kind });
        if let Some(dir) = self.directory_mut(parent) {
            dir.children.insert(name.to_string(), ino);
        }
        ino
    }

    /// Returns the directory at `path`, creating it and any missing parents.
    ///
    /// Calling this again for the same path returns the same inode.  Returns `None` if some
    /// component of `path` is already a file.
    pub fn mkdir_p(&mut self, path: &str) -> Option<u64> {
        let mut current = ROOT_INODE;
        for name in components(path) {
            let existing = self.directory(current)?.children.get(name).copied();
            current = match existing {
                Some(child) => child,
                None => self.add_node(current, name, NodeKind::Directory(Directory::default())),
            };
        }
        self.directory(current).map(|_| current)
    }

    fn insert(&mut self, record: &FileRecord, client: &'a HelperClient) {
        if record.is_dir {
            match self.mkdir_p(&record.path).and_then(|ino| self.directory_mut(ino)) {
                Some(dir) => dir.record = Some(record.clone()),
                None => log::debug!("not creating directory {} under a file", record.path),
            }
            return;
        }

        let (parent_path, name) = record
            .path
            .rsplit_once('/')
            .unwrap_or(("", record.path.as_str()));
        if name.is_empty() {
            return;
        }
        let Some(parent) = self.mkdir_p(parent_path) else {
            log::debug!("not creating {} under a file", record.path);
            return;
        };

        let file = NodeKind::File(LazyFile {
            record: record.clone(),
            client,
        });
        match self.lookup(parent, name).map(|node| node.ino) {
            // only reachable with a hand-made index; keep the first node
            Some(existing) => log::debug!("{} already exists as inode {existing}", record.path),
            None => {
                self.add_node(parent, name, file);
            }
        }
    }
}
