//! Storage engine contract
//!
//! Responsibilities:
//! - Own every piece of persistent state: objects, data, directory entries and link counts.
//! - Answer path-addressed requests from the adapter layer with either a value or an
//!   [`EngineError`] that the adapter passes upward unchanged.
//!
//! Submodules:
//! - `dir`: engine backed by a host directory
//! - `memory`: volatile in-memory engine
pub mod dir;
pub mod memory;

use std::io;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use futures::stream::BoxStream;
use nix::errno::Errno;
use thiserror::Error;

pub use dir::DirEngine;
pub use memory::MemoryEngine;

/// Longest single path component accepted by the engines.
pub const NAME_MAX: usize = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    /// Decode the `S_IFMT` bits of a mode. A zero type means a regular file, as with mknod(2).
    pub fn from_mode(mode: u32) -> Option<Self> {
        let kind = match mode & libc::S_IFMT {
            0 | libc::S_IFREG => FileKind::RegularFile,
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFIFO => FileKind::NamedPipe,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFSOCK => FileKind::Socket,
            _ => return None,
        };
        Some(kind)
    }
}

/// Attribute record of a stored object, as reported by an engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    /// Engine-local object number. Hard links share it.
    pub ino: u64,
    pub kind: FileKind,
    pub size: u64,
    /// Permission bits (`0o7777` range).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Failure reported by a storage engine.
///
/// The named variants cover what the bundled engines produce on their own; anything the host
/// reports beyond that travels verbatim in `Os`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid argument")]
    InvalidInput,
    #[error("file name too long")]
    NameTooLong,
    #[error("{0}")]
    Os(Errno),
}

impl EngineError {
    /// Positive errno value of this failure.
    pub fn errno(self) -> i32 {
        match self {
            EngineError::NotFound => libc::ENOENT,
            EngineError::AlreadyExists => libc::EEXIST,
            EngineError::NotADirectory => libc::ENOTDIR,
            EngineError::IsADirectory => libc::EISDIR,
            EngineError::DirectoryNotEmpty => libc::ENOTEMPTY,
            EngineError::PermissionDenied => libc::EACCES,
            EngineError::InvalidInput => libc::EINVAL,
            EngineError::NameTooLong => libc::ENAMETOOLONG,
            EngineError::Os(errno) => errno as i32,
        }
    }

    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::ENOENT => EngineError::NotFound,
            libc::EEXIST => EngineError::AlreadyExists,
            libc::ENOTDIR => EngineError::NotADirectory,
            libc::EISDIR => EngineError::IsADirectory,
            libc::ENOTEMPTY => EngineError::DirectoryNotEmpty,
            libc::EACCES => EngineError::PermissionDenied,
            libc::EINVAL => EngineError::InvalidInput,
            libc::ENAMETOOLONG => EngineError::NameTooLong,
            other => EngineError::Os(Errno::from_raw(other)),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::from_errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<Errno> for EngineError {
    fn from(errno: Errno) -> Self {
        EngineError::from_errno(errno as i32)
    }
}

/// Path-addressed storage backend consumed by the adapter.
///
/// Paths are absolute and `/`-separated. Engines never follow a symlink in the final
/// component; the kernel resolves links itself through `read_symlink`.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Build the engine over its backing location. Called once per process.
    async fn init(root: &Path) -> Result<Self, EngineError>
    where
        Self: Sized;

    /// Whether `path` exists and the caller may access it with `mask` (`R_OK | W_OK | X_OK`,
    /// or `F_OK`).
    async fn check_access(&self, path: &str, mask: u32) -> bool;

    async fn get_attributes(&self, path: &str) -> Result<FileAttr, EngineError>;

    /// Lazily list the child names of a directory, without `.` and `..`. Yields nothing for a
    /// missing path or a non-directory.
    async fn list_directory(&self, path: &str) -> BoxStream<'static, String>;

    /// Create a non-directory object. `rdev` is only meaningful for device nodes.
    async fn create_object(
        &self,
        path: &str,
        mode: u32,
        rdev: Option<u64>,
    ) -> Result<(), EngineError>;

    async fn create_directory(&self, path: &str, mode: u32) -> Result<(), EngineError>;

    async fn remove_object(&self, path: &str) -> Result<(), EngineError>;

    async fn remove_directory(&self, path: &str) -> Result<(), EngineError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), EngineError>;

    async fn truncate(&self, path: &str, size: u64) -> Result<(), EngineError>;

    /// Read at most `capacity` bytes starting at `offset`. Short reads mean end of file.
    async fn read(&self, path: &str, capacity: usize, offset: u64)
    -> Result<Vec<u8>, EngineError>;

    /// Write `data` at `offset`, extending the object as needed. Returns the bytes written.
    async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, EngineError>;

    async fn create_hardlink(&self, from: &str, to: &str) -> Result<(), EngineError>;

    /// Create a symlink at `link` whose content is `target`, stored verbatim.
    async fn create_symlink(&self, target: &str, link: &str) -> Result<(), EngineError>;

    /// Return the link content truncated to `capacity` bytes.
    async fn read_symlink(&self, path: &str, capacity: usize) -> Result<Vec<u8>, EngineError>;
}
