//! Host-directory engine: every path maps onto a file below the backing root.

use std::io::SeekFrom;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{EngineError, FileAttr, FileKind, NAME_MAX, StorageEngine};

pub struct DirEngine {
    root: PathBuf,
}

impl DirEngine {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an absolute mount path below the root. `.` and `..` components are refused so a
    /// request can never leave the backing directory.
    fn host_path(&self, path: &str) -> Result<PathBuf, EngineError> {
        let mut host = self.root.clone();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            if part == "." || part == ".." {
                return Err(EngineError::PermissionDenied);
            }
            if part.len() > NAME_MAX {
                return Err(EngineError::NameTooLong);
            }
            host.push(part);
        }
        Ok(host)
    }
}

#[async_trait]
impl StorageEngine for DirEngine {
    async fn init(root: &Path) -> Result<Self, EngineError> {
        let root = fs::canonicalize(root).await?;
        if !fs::metadata(&root).await?.is_dir() {
            return Err(EngineError::NotADirectory);
        }
        debug!(root = %root.display(), "directory engine ready");
        Ok(Self { root })
    }

    async fn check_access(&self, path: &str, mask: u32) -> bool {
        let Ok(host) = self.host_path(path) else {
            return false;
        };
        let flags = AccessFlags::from_bits_truncate(mask as libc::c_int);
        nix::unistd::access(host.as_path(), flags).is_ok()
    }

    async fn get_attributes(&self, path: &str) -> Result<FileAttr, EngineError> {
        let host = self.host_path(path)?;
        let meta = fs::symlink_metadata(&host).await?;
        Ok(attr_from_metadata(&meta))
    }

    async fn list_directory(&self, path: &str) -> BoxStream<'static, String> {
        let Ok(host) = self.host_path(path) else {
            return stream::empty().boxed();
        };
        let dir = match fs::read_dir(&host).await {
            Ok(dir) => dir,
            Err(err) => {
                debug!(path, error = %err, "directory not listable");
                return stream::empty().boxed();
            }
        };
        stream::unfold(dir, |mut dir| async move {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    Some((name, dir))
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(error = %err, "directory listing cut short");
                    None
                }
            }
        })
        .boxed()
    }

    async fn create_object(
        &self,
        path: &str,
        mode: u32,
        rdev: Option<u64>,
    ) -> Result<(), EngineError> {
        let host = self.host_path(path)?;
        let perm = mode & 0o7777;
        match FileKind::from_mode(mode).ok_or(EngineError::InvalidInput)? {
            FileKind::RegularFile => {
                fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(perm)
                    .open(&host)
                    .await?;
            }
            FileKind::NamedPipe => {
                nix::unistd::mkfifo(host.as_path(), Mode::from_bits_truncate(perm))?;
            }
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Socket => {
                nix::sys::stat::mknod(
                    host.as_path(),
                    SFlag::from_bits_truncate(mode & libc::S_IFMT),
                    Mode::from_bits_truncate(perm),
                    rdev.unwrap_or(0) as libc::dev_t,
                )?;
            }
            FileKind::Directory | FileKind::Symlink => return Err(EngineError::InvalidInput),
        }
        Ok(())
    }

    async fn create_directory(&self, path: &str, mode: u32) -> Result<(), EngineError> {
        let host = self.host_path(path)?;
        fs::DirBuilder::new().mode(mode & 0o7777).create(&host).await?;
        Ok(())
    }

    async fn remove_object(&self, path: &str) -> Result<(), EngineError> {
        fs::remove_file(self.host_path(path)?).await?;
        Ok(())
    }

    async fn remove_directory(&self, path: &str) -> Result<(), EngineError> {
        let host = self.host_path(path)?;
        if host == self.root {
            return Err(EngineError::Os(nix::errno::Errno::EBUSY));
        }
        fs::remove_dir(host).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), EngineError> {
        fs::rename(self.host_path(from)?, self.host_path(to)?).await?;
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> Result<(), EngineError> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.host_path(path)?)
            .await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn read(
        &self,
        path: &str,
        capacity: usize,
        offset: u64,
    ) -> Result<Vec<u8>, EngineError> {
        let mut file = fs::File::open(self.host_path(path)?).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(capacity);
        file.take(capacity as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, EngineError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.host_path(path)?)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }

    async fn create_hardlink(&self, from: &str, to: &str) -> Result<(), EngineError> {
        fs::hard_link(self.host_path(from)?, self.host_path(to)?).await?;
        Ok(())
    }

    async fn create_symlink(&self, target: &str, link: &str) -> Result<(), EngineError> {
        fs::symlink(target, self.host_path(link)?).await?;
        Ok(())
    }

    async fn read_symlink(&self, path: &str, capacity: usize) -> Result<Vec<u8>, EngineError> {
        let mut target = fs::read_link(self.host_path(path)?)
            .await?
            .into_os_string()
            .into_vec();
        target.truncate(capacity);
        Ok(target)
    }
}

fn attr_from_metadata(meta: &std::fs::Metadata) -> FileAttr {
    let file_type = meta.file_type();
    let kind = if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_fifo() {
        FileKind::NamedPipe
    } else if file_type.is_char_device() {
        FileKind::CharDevice
    } else if file_type.is_block_device() {
        FileKind::BlockDevice
    } else if file_type.is_socket() {
        FileKind::Socket
    } else {
        FileKind::RegularFile
    };
    FileAttr {
        ino: meta.ino(),
        kind,
        size: meta.size(),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::from_nanos(nsecs.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn engine() -> (tempfile::TempDir, DirEngine) {
        let tmp = tempfile::tempdir().expect("tmp root");
        let engine = DirEngine::init(tmp.path()).await.expect("init engine");
        (tmp, engine)
    }

    #[tokio::test]
    async fn init_rejects_missing_or_file_roots() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            DirEngine::init(&tmp.path().join("missing")).await.err(),
            Some(EngineError::NotFound)
        );
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(
            DirEngine::init(&file).await.err(),
            Some(EngineError::NotADirectory)
        );
    }

    #[tokio::test]
    async fn host_path_stays_below_root() {
        let (_tmp, engine) = engine().await;
        assert_eq!(engine.host_path("/").unwrap(), engine.root());
        assert_eq!(
            engine.host_path("/a//b").unwrap(),
            engine.root().join("a").join("b")
        );
        assert_eq!(
            engine.host_path("/../etc/passwd"),
            Err(EngineError::PermissionDenied)
        );
        assert_eq!(
            engine.host_path("/a/./b"),
            Err(EngineError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn file_data_round_trips_through_host() {
        let (tmp, engine) = engine().await;
        engine
            .create_object("/f", libc::S_IFREG | 0o600, None)
            .await
            .unwrap();
        assert_eq!(engine.write("/f", b"abcdef", 0).await.unwrap(), 6);
        assert_eq!(engine.write("/f", b"XY", 2).await.unwrap(), 2);
        assert_eq!(std::fs::read(tmp.path().join("f")).unwrap(), b"abXYef");
        assert_eq!(engine.read("/f", 3, 1).await.unwrap(), b"bXY");
        assert!(engine.read("/f", 3, 64).await.unwrap().is_empty());

        let attr = engine.get_attributes("/f").await.unwrap();
        assert_eq!(attr.kind, FileKind::RegularFile);
        assert_eq!(attr.size, 6);
    }

    #[tokio::test]
    async fn namespace_operations_hit_the_host() {
        let (tmp, engine) = engine().await;
        engine.create_directory("/d", 0o755).await.unwrap();
        engine.create_object("/d/f", 0o644, None).await.unwrap();
        assert_eq!(
            engine.create_object("/d/f", 0o644, None).await,
            Err(EngineError::AlreadyExists)
        );
        assert_eq!(
            engine.remove_directory("/d").await,
            Err(EngineError::DirectoryNotEmpty)
        );

        engine.rename("/d/f", "/g").await.unwrap();
        assert!(tmp.path().join("g").is_file());
        engine.create_hardlink("/g", "/h").await.unwrap();
        assert_eq!(engine.get_attributes("/g").await.unwrap().nlink, 2);

        engine.remove_object("/g").await.unwrap();
        engine.remove_object("/h").await.unwrap();
        engine.remove_directory("/d").await.unwrap();
        let names: Vec<String> = engine.list_directory("/").await.collect().await;
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let (_tmp, engine) = engine().await;
        engine.create_symlink("/nowhere", "/l").await.unwrap();
        let attr = engine.get_attributes("/l").await.unwrap();
        assert_eq!(attr.kind, FileKind::Symlink);
        assert_eq!(engine.read_symlink("/l", 64).await.unwrap(), b"/nowhere");
        assert_eq!(engine.read_symlink("/l", 4).await.unwrap(), b"/now");
    }

    #[tokio::test]
    async fn fifos_are_created_with_mkfifo() {
        let (_tmp, engine) = engine().await;
        engine
            .create_object("/p", libc::S_IFIFO | 0o600, None)
            .await
            .unwrap();
        assert_eq!(
            engine.get_attributes("/p").await.unwrap().kind,
            FileKind::NamedPipe
        );
    }

    #[tokio::test]
    async fn truncate_resizes_host_file() {
        let (tmp, engine) = engine().await;
        engine.create_object("/f", 0o644, None).await.unwrap();
        engine.write("/f", b"0123456789", 0).await.unwrap();
        engine.truncate("/f", 3).await.unwrap();
        assert_eq!(std::fs::read(tmp.path().join("f")).unwrap(), b"012");
        assert_eq!(
            engine.truncate("/missing", 0).await,
            Err(EngineError::NotFound)
        );
    }

    #[tokio::test]
    async fn listing_streams_every_child() {
        let (_tmp, engine) = engine().await;
        for name in ["a", "b", "c"] {
            engine
                .create_object(&format!("/{name}"), 0o644, None)
                .await
                .unwrap();
        }
        let mut names: Vec<String> = engine.list_directory("/").await.collect().await;
        names.sort();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(engine.list_directory("/a").await.next().await.is_none());
    }

    #[test]
    fn negative_timestamps_land_before_epoch() {
        assert_eq!(system_time(0, 0), UNIX_EPOCH);
        assert_eq!(
            system_time(-1, 500_000_000),
            UNIX_EPOCH - Duration::from_millis(500)
        );
    }
}
