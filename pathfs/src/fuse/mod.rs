//! FUSE bridge and request handling
//!
//! Translates inode-addressed kernel requests into the path-addressed calls of the
//! [`Adapter`](crate::adapter::Adapter). Only operations present in the [`OperationTable`] are
//! forwarded; the rest are answered with `ENOSYS`, which is how the protocol treats an
//! operation nobody registered.
//!
//! Main components:
//! - `inode`: inode number <-> path bindings handed to the kernel.
//! - `mount`: mounting the bridge through rfuse3 sessions.
//! - The `Filesystem` implementation for [`PathFs`] and attribute conversion helpers.
pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Errno;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyData, ReplyDirectory, ReplyDirectoryPlus,
    ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use tracing::debug;

use crate::adapter::{Adapter, DirSink};
use crate::engine::{FileAttr, FileKind, NAME_MAX, StorageEngine};
use crate::ops::{Operation, OperationTable};
use inode::{InodeTable, child_path};

const TTL: Duration = Duration::from_secs(1);

/// Upper bound on entries produced by one directory read.
const READDIR_BATCH: usize = 512;

const MAX_WRITE: u32 = 1024 * 1024;

/// Filesystem served to the kernel: an adapter, the operations it registers and the inode
/// bindings for the paths the kernel has seen.
pub struct PathFs<E> {
    adapter: Adapter<E>,
    table: OperationTable,
    inodes: InodeTable,
}

impl<E: StorageEngine> PathFs<E> {
    pub fn new(adapter: Adapter<E>, table: OperationTable) -> Self {
        Self {
            adapter,
            table,
            inodes: InodeTable::new(),
        }
    }

    pub fn adapter(&self) -> &Adapter<E> {
        &self.adapter
    }

    pub fn table(&self) -> OperationTable {
        self.table
    }

    fn dispatch(&self, op: Operation) -> FuseResult<()> {
        if self.table.handles(op) {
            Ok(())
        } else {
            debug!(op = %op, "declined unregistered operation");
            Err(libc::ENOSYS.into())
        }
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let parent = self.path_of(parent)?;
        let name = name.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        Ok(child_path(&parent, name))
    }

    /// Attributes of `path` as the kernel should see them, bound to the path's inode. A path
    /// the engine no longer knows loses its binding, so objects removed behind the mount's back
    /// do not pin inode numbers.
    async fn stat(&self, path: &str) -> FuseResult<rfuse3::raw::reply::FileAttr> {
        self.dispatch(Operation::Getattr)?;
        match self.adapter.getattr(path).await {
            Ok(attr) => Ok(to_fuse_attr(self.inodes.ino_of(path), &attr)),
            Err(err) => {
                if path != "/" {
                    self.inodes.remove(path);
                }
                Err(err.into())
            }
        }
    }

    async fn entry(&self, path: &str) -> FuseResult<ReplyEntry> {
        let attr = self.stat(path).await?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    /// One page of the listing of `dir`, starting after position `offset`. Each entry carries
    /// its 1-based position, so the kernel resumes exactly where this page ended. Entries whose
    /// attributes cannot be read by the time they are resolved are left out.
    async fn list(&self, dir: &str, offset: u64) -> FuseResult<Vec<Listed>> {
        self.dispatch(Operation::Readdir)?;
        let mut batch = DirBatch::new(offset, READDIR_BATCH);
        self.adapter.readdir(dir, &mut batch).await?;

        let mut listed = Vec::with_capacity(batch.names.len());
        for (offset, name) in batch.names {
            let path = if name == "." {
                dir.to_owned()
            } else {
                child_path(dir, &name)
            };
            let Ok(attr) = self.adapter.getattr(&path).await else {
                continue;
            };
            let ino = self.inodes.ino_of(&path);
            listed.push(Listed {
                offset,
                name,
                attr: to_fuse_attr(ino, &attr),
            });
        }
        Ok(listed)
    }
}

struct Listed {
    offset: i64,
    name: String,
    attr: rfuse3::raw::reply::FileAttr,
}

/// Sink collecting one page of a directory listing.
struct DirBatch {
    skip: u64,
    seen: u64,
    limit: usize,
    names: Vec<(i64, String)>,
}

impl DirBatch {
    fn new(skip: u64, limit: usize) -> Self {
        Self {
            skip,
            seen: 0,
            limit,
            names: Vec::new(),
        }
    }
}

impl DirSink for DirBatch {
    fn push(&mut self, name: &str) -> bool {
        self.seen += 1;
        if self.seen <= self.skip {
            return true;
        }
        let offset = i64::try_from(self.seen).unwrap_or(i64::MAX);
        self.names.push((offset, name.to_owned()));
        self.names.len() < self.limit
    }
}

impl<E> Filesystem for PathFs<E>
where
    E: StorageEngine + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_of(parent, name)?;
        self.entry(&path).await
    }

    // Bindings live until the path is removed, renamed over or found missing.
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let attr = if fh.is_some() && self.table.handles(Operation::Fgetattr) {
            let attr = self.adapter.fgetattr(&path).await?;
            to_fuse_attr(ino, &attr)
        } else {
            self.stat(&path).await?
        };
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    // Applied in the order chmod, chown, truncate, utimens. Ownership and timestamp updates
    // have no operation behind them.
    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        if let Some(mode) = set_attr.mode {
            self.dispatch(Operation::Chmod)?;
            self.adapter.chmod(&path, mode).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            return Err(libc::ENOSYS.into());
        }
        if let Some(size) = set_attr.size {
            self.dispatch(Operation::Truncate)?;
            self.adapter.truncate(&path, size).await?;
        }
        if set_attr.atime.is_some() && set_attr.mtime.is_some() {
            return Err(libc::ENOSYS.into());
        }
        let attr = self.stat(&path).await?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        self.dispatch(Operation::Readlink)?;
        let path = self.path_of(ino)?;
        let target = self
            .adapter
            .readlink(&path, libc::PATH_MAX as usize)
            .await?;
        Ok(ReplyData {
            data: Bytes::from(target),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        self.dispatch(Operation::Symlink)?;
        let path = self.child_of(parent, name)?;
        let target = link.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        self.adapter.symlink(target, &path).await?;
        self.entry(&path).await
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        self.dispatch(Operation::Mknod)?;
        let path = self.child_of(parent, name)?;
        self.adapter.mknod(&path, mode, u64::from(rdev)).await?;
        self.entry(&path).await
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        self.dispatch(Operation::Mkdir)?;
        let path = self.child_of(parent, name)?;
        self.adapter.mkdir(&path, mode & !umask).await?;
        self.entry(&path).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.dispatch(Operation::Unlink)?;
        let path = self.child_of(parent, name)?;
        self.adapter.unlink(&path).await?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.dispatch(Operation::Rmdir)?;
        let path = self.child_of(parent, name)?;
        self.adapter.rmdir(&path).await?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        self.dispatch(Operation::Rename)?;
        let from = self.child_of(parent, name)?;
        let to = self.child_of(new_parent, new_name)?;
        self.adapter.rename(&from, &to).await?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        self.dispatch(Operation::Link)?;
        let from = self.path_of(ino)?;
        let to = self.child_of(new_parent, new_name)?;
        self.adapter.link(&from, &to).await?;
        self.entry(&to).await
    }

    // Stateless IO: no handle is kept, fh is always 0.
    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        self.dispatch(Operation::Open)?;
        let path = self.path_of(ino)?;
        self.adapter.open(&path).await?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        self.dispatch(Operation::Read)?;
        let path = self.path_of(ino)?;
        let data = self.adapter.read(&path, size as usize, offset).await?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        self.dispatch(Operation::Write)?;
        let path = self.path_of(ino)?;
        let written = self.adapter.write(&path, data, offset).await?;
        Ok(ReplyWrite {
            written: u32::try_from(written).unwrap_or(u32::MAX),
        })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // Engines expose no capacity figures.
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: NAME_MAX as u32,
            frsize: 4096,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        self.path_of(ino)?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let dir = self.path_of(ino)?;
        let listed = self.list(&dir, offset.max(0) as u64).await?;
        let entries = listed.into_iter().map(|e| {
            Ok(DirectoryEntry {
                inode: e.attr.ino,
                kind: e.attr.kind,
                name: OsString::from(e.name),
                offset: e.offset,
            })
        });
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let dir = self.path_of(parent)?;
        let listed = self.list(&dir, offset).await?;
        let entries = listed.into_iter().map(|e| {
            Ok(DirectoryEntryPlus {
                inode: e.attr.ino,
                generation: 0,
                kind: e.attr.kind,
                name: OsString::from(e.name),
                offset: e.offset,
                attr: e.attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            })
        });
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, ino: u64, mask: u32) -> FuseResult<()> {
        self.dispatch(Operation::Access)?;
        let path = self.path_of(ino)?;
        Ok(self.adapter.access(&path, mask).await?)
    }
}

// =============== helpers ===============
fn to_fuse_kind(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::RegularFile => FuseFileType::RegularFile,
        FileKind::Directory => FuseFileType::Directory,
        FileKind::Symlink => FuseFileType::Symlink,
        FileKind::NamedPipe => FuseFileType::NamedPipe,
        FileKind::CharDevice => FuseFileType::CharDevice,
        FileKind::BlockDevice => FuseFileType::BlockDevice,
        FileKind::Socket => FuseFileType::Socket,
    }
}

fn to_fuse_attr(ino: u64, attr: &FileAttr) -> rfuse3::raw::reply::FileAttr {
    rfuse3::raw::reply::FileAttr {
        ino,
        size: attr.size,
        // 512-byte units
        blocks: attr.size.div_ceil(512),
        atime: Timestamp::from(attr.atime),
        mtime: Timestamp::from(attr.mtime),
        ctime: Timestamp::from(attr.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(attr.ctime),
        kind: to_fuse_kind(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
