//! Read-only FUSE filesystem over a [`Tree`].
//!
//! Attribute, lookup and directory requests are answered from the tree alone.  Reads of lazy
//! files go to the helper, one `data-request` per kernel read, with nothing cached on our side.

#![forbid(unsafe_code)]

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyOpen, Request,
};
use rustix::io::Errno;
use rustix::process::{getgid, getuid};

use crate::tree::{Node, NodeKind, Tree};

// the image never changes under us
const TTL: Duration = Duration::from_secs(1_000_000);

fn file_type(node: &Node) -> FileType {
    match node.kind {
        NodeKind::Directory(..) => FileType::Directory,
        NodeKind::File(..) => FileType::RegularFile,
    }
}

fn timestamp(secs: i64) -> SystemTime {
    match u64::try_from(secs) {
        Ok(secs) => SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        Err(..) => SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()),
    }
}

#[derive(Debug)]
pub struct SkiffFs<'a> {
    tree: Tree<'a>,
    uid: u32,
    gid: u32,
}

impl<'a> SkiffFs<'a> {
    /// Serves `tree` with every node owned by the calling user.
    pub fn new(tree: Tree<'a>) -> Self {
        Self::with_owner(tree, getuid().as_raw(), getgid().as_raw())
    }

    pub fn with_owner(tree: Tree<'a>, uid: u32, gid: u32) -> Self {
        Self { tree, uid, gid }
    }

    fn nlink(&self, node: &Node) -> u32 {
        match &node.kind {
            NodeKind::Directory(dir) => {
                let subdirs = dir
                    .children
                    .values()
                    .filter(|&&ino| self.tree.get(ino).is_some_and(Node::is_dir))
                    .count();
                2 + subdirs as u32
            }
            NodeKind::File(..) => 1,
        }
    }

    fn fileattr(&self, node: &Node) -> FileAttr {
        let mtime = timestamp(node.mtime());
        let size = node.size();

        FileAttr {
            ino: node.ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: file_type(node),
            perm: (node.mode() & 0o7777) as u16,
            nlink: self.nlink(node),
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Filesystem for SkiffFs<'_> {
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, self.tree.len() as u64, 0, 4096, 255, 4096);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        log::trace!("lookup {parent} {name:?}");
        let Some(name) = name.to_str() else {
            return reply.error(Errno::NOENT.raw_os_error());
        };

        match self.tree.lookup(parent, name) {
            Some(node) => reply.entry(&TTL, &self.fileattr(node), 0),
            None => reply.error(Errno::NOENT.raw_os_error()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(node) = self.tree.get(ino) else {
            log::error!("getattr({ino}) inode does not exist");
            return reply.error(Errno::NOENT.raw_os_error());
        };
        reply.attr(&TTL, &self.fileattr(node));
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.tree.get(ino) {
            Some(node) if node.is_dir() => reply.opened(0, 0),
            Some(..) => reply.error(Errno::NOTDIR.raw_os_error()),
            None => reply.error(Errno::NOENT.raw_os_error()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        mut offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = self.tree.get(ino) else {
            log::error!("readdir({ino}) inode does not exist");
            return reply.error(Errno::NOENT.raw_os_error());
        };
        let NodeKind::Directory(dir) = &node.kind else {
            log::error!("readdir({ino}) inode is not a directory");
            return reply.error(Errno::NOTDIR.raw_os_error());
        };

        if offset == 0 {
            offset += 1;
            if reply.add(ino, offset, FileType::Directory, ".") {
                return reply.ok();
            }
        }

        if offset == 1 {
            offset += 1;
            if reply.add(node.parent, offset, FileType::Directory, "..") {
                return reply.ok();
            }
        }

        for (name, &child) in dir.children.iter().skip(offset as usize - 2) {
            let Some(child) = self.tree.get(child) else {
                continue;
            };

            offset += 1;
            if reply.add(child.ino, offset, file_type(child), name) {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        log::trace!("open({ino})");
        match self.tree.get(ino) {
            Some(node) if !node.is_dir() => reply.opened(0, 0),
            Some(..) => {
                log::error!("open({ino}) inode is a directory");
                reply.error(Errno::ISDIR.raw_os_error())
            }
            None => {
                log::error!("open({ino}) inode does not exist");
                reply.error(Errno::NOENT.raw_os_error())
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(NodeKind::File(file)) = self.tree.get(ino).map(|node| &node.kind) else {
            log::error!("read({ino}) inode is not a regular file");
            return reply.error(Errno::BADF.raw_os_error());
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };

        log::debug!("read {} at {offset}, {size} bytes", file.record.path);
        match file.read(offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => {
                log::error!("read({}, {offset}, {size}): {err}", file.record.path);
                reply.error(Errno::IO.raw_os_error());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }
}

/// Options for a read-only mount of `image`.
pub fn mount_options(image: &str, allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::RO,
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::DefaultPermissions,
        MountOption::FSName(format!("skiff:{image}")),
        MountOption::Subtype("skiff".into()),
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Mounts `fs` at `mountpoint` and serves requests until it is unmounted.
pub fn serve(fs: SkiffFs<'_>, mountpoint: &Path, options: &[MountOption]) -> std::io::Result<()> {
    fuser::mount2(fs, mountpoint, options)
}
