//! Operation adapter
//!
//! One translation function per protocol operation. Each function forwards its arguments to
//! exactly one storage-engine call (or a short fixed sequence), then converts the outcome into
//! an [`FsResult`]. There is no caching, retrying or recovery here: engine failures surface
//! unchanged as [`FsError::Engine`].
//!
//! Every call emits one `debug` event carrying the operation name and its arguments.
mod sink;

pub use sink::DirSink;

use std::fmt;

use futures::StreamExt;
use tracing::debug;

use crate::engine::{FileAttr, StorageEngine};
use crate::error::{FsError, FsResult};
use crate::ops::Operation;

/// Adapter over an explicitly owned storage engine.
pub struct Adapter<E> {
    engine: E,
}

impl<E: StorageEngine> Adapter<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Succeeds when `path` exists and the engine grants `mask`. A refused mask reports
    /// `NotFound`, the same as an absent path.
    pub async fn access(&self, path: &str, mask: u32) -> FsResult<()> {
        debug!(op = %Operation::Access, path, mask = %Octal(mask));
        if self.engine.get_attributes(path).await.is_err() {
            return Err(FsError::NotFound);
        }
        if !self.engine.check_access(path, mask).await {
            return Err(FsError::NotFound);
        }
        Ok(())
    }

    pub async fn getattr(&self, path: &str) -> FsResult<FileAttr> {
        debug!(op = %Operation::Getattr, path);
        self.engine
            .get_attributes(path)
            .await
            .map_err(|_| FsError::NotFound)
    }

    /// Feed `.` and then every child the engine lists, in engine order, until the listing
    /// ends or the sink reports full.
    pub async fn readdir<S>(&self, path: &str, sink: &mut S) -> FsResult<()>
    where
        S: DirSink + ?Sized,
    {
        debug!(op = %Operation::Readdir, path);
        if self.engine.get_attributes(path).await.is_err() {
            return Err(FsError::NotFound);
        }
        if !sink.push(".") {
            return Ok(());
        }
        let mut entries = self.engine.list_directory(path).await;
        while let Some(name) = entries.next().await {
            if !sink.push(&name) {
                break;
            }
        }
        Ok(())
    }

    /// Create a file or special node. A zero `rdev` means no device.
    pub async fn mknod(&self, path: &str, mode: u32, rdev: u64) -> FsResult<()> {
        debug!(op = %Operation::Mknod, path, mode = %Octal(mode), rdev);
        let rdev = (rdev != 0).then_some(rdev);
        Ok(self.engine.create_object(path, mode, rdev).await?)
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        debug!(op = %Operation::Mkdir, path, mode = %Octal(mode));
        Ok(self.engine.create_directory(path, mode).await?)
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        debug!(op = %Operation::Unlink, path);
        Ok(self.engine.remove_object(path).await?)
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        debug!(op = %Operation::Rmdir, path);
        Ok(self.engine.remove_directory(path).await?)
    }

    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        debug!(op = %Operation::Rename, from, to);
        Ok(self.engine.rename(from, to).await?)
    }

    pub async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        debug!(op = %Operation::Truncate, path, size);
        Ok(self.engine.truncate(path, size).await?)
    }

    /// Permission changes are not supported; always fails.
    pub async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        debug!(op = %Operation::Chmod, path, mode = %Octal(mode));
        Err(FsError::Unimplemented)
    }

    /// Stateless: nothing is retained between open, read, write and release.
    pub async fn open(&self, path: &str) -> FsResult<()> {
        debug!(op = %Operation::Open, path);
        Ok(())
    }

    /// Read at most `size` bytes at `offset`.
    pub async fn read(&self, path: &str, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        debug!(op = %Operation::Read, path, size, offset);
        let mut data = self.engine.read(path, size, offset).await?;
        data.truncate(size);
        Ok(data)
    }

    /// Write `data` at `offset`; the reported count never exceeds `data.len()`.
    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> FsResult<usize> {
        debug!(op = %Operation::Write, path, len = data.len(), offset);
        let written = self.engine.write(path, data, offset).await?;
        Ok(written.min(data.len()))
    }

    pub async fn link(&self, from: &str, to: &str) -> FsResult<()> {
        debug!(op = %Operation::Link, from, to);
        Ok(self.engine.create_hardlink(from, to).await?)
    }

    /// Create `link` pointing at the verbatim text `target`.
    pub async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        debug!(op = %Operation::Symlink, target, link);
        Ok(self.engine.create_symlink(target, link).await?)
    }

    /// Link content truncated to `size` bytes.
    pub async fn readlink(&self, path: &str, size: usize) -> FsResult<Vec<u8>> {
        debug!(op = %Operation::Readlink, path, size);
        let mut target = self.engine.read_symlink(path, size).await?;
        target.truncate(size);
        Ok(target)
    }

    /// Handle-based stat is not supported; always fails.
    pub async fn fgetattr(&self, path: &str) -> FsResult<FileAttr> {
        debug!(op = %Operation::Fgetattr, path);
        Err(FsError::Unimplemented)
    }
}

/// Mode and mask bits render in octal.
struct Octal(u32);

impl fmt::Display for Octal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, FileKind};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::UNIX_EPOCH;

    /// Engine answering every call with fixed values and recording what it was asked.
    struct Scripted {
        exists: bool,
        granted: bool,
        entries: Vec<String>,
        failure: Option<EngineError>,
        data: Vec<u8>,
        written: usize,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                exists: true,
                granted: true,
                entries: Vec::new(),
                failure: None,
                data: Vec::new(),
                written: 0,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: EngineError) -> Self {
            Self {
                failure: Some(err),
                ..Self::new()
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn outcome(&self) -> Result<(), EngineError> {
            self.failure.map_or(Ok(()), Err)
        }
    }

    fn attr() -> FileAttr {
        FileAttr {
            ino: 7,
            kind: FileKind::RegularFile,
            size: 42,
            perm: 0o640,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        }
    }

    #[async_trait]
    impl StorageEngine for Scripted {
        async fn init(_root: &Path) -> Result<Self, EngineError> {
            Ok(Self::new())
        }

        async fn check_access(&self, path: &str, mask: u32) -> bool {
            self.record(format!("check_access {path} {mask}"));
            self.granted
        }

        async fn get_attributes(&self, path: &str) -> Result<FileAttr, EngineError> {
            self.record(format!("get_attributes {path}"));
            if self.exists {
                Ok(attr())
            } else {
                Err(EngineError::NotFound)
            }
        }

        async fn list_directory(&self, path: &str) -> BoxStream<'static, String> {
            self.record(format!("list_directory {path}"));
            stream::iter(self.entries.clone()).boxed()
        }

        async fn create_object(
            &self,
            path: &str,
            mode: u32,
            rdev: Option<u64>,
        ) -> Result<(), EngineError> {
            self.record(format!("create_object {path} {mode:o} {rdev:?}"));
            self.outcome()
        }

        async fn create_directory(&self, path: &str, mode: u32) -> Result<(), EngineError> {
            self.record(format!("create_directory {path} {mode:o}"));
            self.outcome()
        }

        async fn remove_object(&self, path: &str) -> Result<(), EngineError> {
            self.record(format!("remove_object {path}"));
            self.outcome()
        }

        async fn remove_directory(&self, path: &str) -> Result<(), EngineError> {
            self.record(format!("remove_directory {path}"));
            self.outcome()
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), EngineError> {
            self.record(format!("rename {from} {to}"));
            self.outcome()
        }

        async fn truncate(&self, path: &str, size: u64) -> Result<(), EngineError> {
            self.record(format!("truncate {path} {size}"));
            self.outcome()
        }

        async fn read(
            &self,
            path: &str,
            capacity: usize,
            offset: u64,
        ) -> Result<Vec<u8>, EngineError> {
            self.record(format!("read {path} {capacity} {offset}"));
            self.outcome().map(|_| self.data.clone())
        }

        async fn write(
            &self,
            path: &str,
            data: &[u8],
            offset: u64,
        ) -> Result<usize, EngineError> {
            self.record(format!("write {path} {} {offset}", data.len()));
            self.outcome().map(|_| self.written)
        }

        async fn create_hardlink(&self, from: &str, to: &str) -> Result<(), EngineError> {
            self.record(format!("create_hardlink {from} {to}"));
            self.outcome()
        }

        async fn create_symlink(&self, target: &str, link: &str) -> Result<(), EngineError> {
            self.record(format!("create_symlink {target} {link}"));
            self.outcome()
        }

        async fn read_symlink(
            &self,
            path: &str,
            capacity: usize,
        ) -> Result<Vec<u8>, EngineError> {
            self.record(format!("read_symlink {path} {capacity}"));
            self.outcome().map(|_| self.data.clone())
        }
    }

    /// Sink that reports full after `limit` names.
    struct Limited {
        limit: usize,
        names: Vec<String>,
    }

    impl DirSink for Limited {
        fn push(&mut self, name: &str) -> bool {
            self.names.push(name.to_owned());
            self.names.len() < self.limit
        }
    }

    #[tokio::test]
    async fn access_checks_existence_before_permission() {
        let adapter = Adapter::new(Scripted {
            exists: false,
            ..Scripted::new()
        });
        assert_eq!(adapter.access("/a", 4).await, Err(FsError::NotFound));
        assert_eq!(adapter.engine().calls(), ["get_attributes /a"]);

        let adapter = Adapter::new(Scripted {
            granted: false,
            ..Scripted::new()
        });
        assert_eq!(adapter.access("/a", 2).await, Err(FsError::NotFound));
        assert_eq!(
            adapter.access("/a", 2).await.map_err(FsError::status),
            Err(-libc::ENOENT)
        );
        assert_eq!(
            adapter.engine().calls(),
            [
                "get_attributes /a",
                "check_access /a 2",
                "get_attributes /a",
                "check_access /a 2"
            ]
        );

        let adapter = Adapter::new(Scripted::new());
        assert_eq!(adapter.access("/a", 0).await, Ok(()));
        assert_eq!(
            adapter.engine().calls(),
            ["get_attributes /a", "check_access /a 0"]
        );
    }

    #[tokio::test]
    async fn getattr_returns_engine_record_or_not_found() {
        let adapter = Adapter::new(Scripted::new());
        assert_eq!(adapter.getattr("/f").await, Ok(attr()));

        let adapter = Adapter::new(Scripted {
            exists: false,
            ..Scripted::new()
        });
        assert_eq!(adapter.getattr("/f").await, Err(FsError::NotFound));
    }

    #[tokio::test]
    async fn readdir_emits_dot_then_engine_order() {
        let adapter = Adapter::new(Scripted {
            entries: vec!["zeta".into(), "alpha".into(), "alpha".into()],
            ..Scripted::new()
        });
        let mut names = Vec::new();
        adapter.readdir("/d", &mut names).await.unwrap();
        assert_eq!(names, [".", "zeta", "alpha", "alpha"]);
    }

    #[tokio::test]
    async fn readdir_stops_when_sink_is_full() {
        let adapter = Adapter::new(Scripted {
            entries: vec!["a".into(), "b".into(), "c".into()],
            ..Scripted::new()
        });
        let mut sink = Limited {
            limit: 2,
            names: Vec::new(),
        };
        assert_eq!(adapter.readdir("/d", &mut sink).await, Ok(()));
        assert_eq!(sink.names, [".", "a"]);

        let mut only_dot = Limited {
            limit: 1,
            names: Vec::new(),
        };
        adapter.readdir("/d", &mut only_dot).await.unwrap();
        assert_eq!(only_dot.names, ["."]);
    }

    #[tokio::test]
    async fn readdir_of_missing_directory_is_not_found() {
        let adapter = Adapter::new(Scripted {
            exists: false,
            ..Scripted::new()
        });
        let mut names = Vec::new();
        assert_eq!(
            adapter.readdir("/gone", &mut names).await,
            Err(FsError::NotFound)
        );
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn mutations_forward_arguments_verbatim() {
        let adapter = Adapter::new(Scripted::new());
        adapter.mknod("/f", 0o100644, 0).await.unwrap();
        adapter.mknod("/c", 0o020600, 0x0103).await.unwrap();
        adapter.mkdir("/d", 0o755).await.unwrap();
        adapter.unlink("/f").await.unwrap();
        adapter.rmdir("/d").await.unwrap();
        adapter.rename("/x", "/y").await.unwrap();
        adapter.truncate("/y", 9).await.unwrap();
        adapter.link("/y", "/z").await.unwrap();
        adapter.symlink("target", "/l").await.unwrap();
        assert_eq!(
            adapter.engine().calls(),
            [
                "create_object /f 100644 None",
                "create_object /c 20600 Some(259)",
                "create_directory /d 755",
                "remove_object /f",
                "remove_directory /d",
                "rename /x /y",
                "truncate /y 9",
                "create_hardlink /y /z",
                "create_symlink target /l",
            ]
        );
    }

    #[tokio::test]
    async fn engine_failures_surface_unchanged() {
        let err = EngineError::from_errno(libc::EXDEV);
        let adapter = Adapter::new(Scripted::failing(err));
        assert_eq!(adapter.rename("/a", "/b").await, Err(FsError::Engine(err)));
        assert_eq!(
            adapter.mkdir("/a", 0o755).await.map_err(FsError::status),
            Err(-libc::EXDEV)
        );
        assert_eq!(adapter.read("/a", 1, 0).await, Err(FsError::Engine(err)));
        assert_eq!(adapter.write("/a", b"x", 0).await, Err(FsError::Engine(err)));
        assert_eq!(adapter.readlink("/a", 8).await, Err(FsError::Engine(err)));
    }

    #[tokio::test]
    async fn read_never_exceeds_requested_size() {
        let adapter = Adapter::new(Scripted {
            data: b"0123456789".to_vec(),
            ..Scripted::new()
        });
        assert_eq!(adapter.read("/f", 4, 0).await.unwrap(), b"0123");
        assert_eq!(adapter.read("/f", 64, 0).await.unwrap().len(), 10);
        assert_eq!(adapter.engine().calls()[0], "read /f 4 0");
    }

    #[tokio::test]
    async fn write_never_reports_more_than_given() {
        let adapter = Adapter::new(Scripted {
            written: 100,
            ..Scripted::new()
        });
        assert_eq!(adapter.write("/f", b"abc", 5).await, Ok(3));

        let adapter = Adapter::new(Scripted {
            written: 2,
            ..Scripted::new()
        });
        assert_eq!(adapter.write("/f", b"abc", 5).await, Ok(2));
    }

    #[tokio::test]
    async fn readlink_truncates_to_capacity() {
        let adapter = Adapter::new(Scripted {
            data: b"target".to_vec(),
            ..Scripted::new()
        });
        assert_eq!(adapter.readlink("/l", 3).await.unwrap(), b"tar");
    }

    #[tokio::test]
    async fn stubs_never_reach_the_engine() {
        let adapter = Adapter::new(Scripted::new());
        assert_eq!(adapter.chmod("/f", 0o600).await, Err(FsError::Unimplemented));
        assert_eq!(adapter.fgetattr("/f").await, Err(FsError::Unimplemented));
        assert_eq!(adapter.open("/f").await, Ok(()));
        assert!(adapter.engine().calls().is_empty());
    }

    #[test]
    fn octal_pads_to_four_digits() {
        assert_eq!(Octal(0o755).to_string(), "0755");
        assert_eq!(Octal(0o4).to_string(), "0004");
        assert_eq!(Octal(0o100644).to_string(), "100644");
    }
}
