//! Volatile in-memory engine: a node table with a name map per directory.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use nix::errno::Errno;

use super::{EngineError, FileAttr, FileKind, NAME_MAX, StorageEngine};

const ROOT_INO: u64 = 1;

enum Content {
    File(Vec<u8>),
    Dir(BTreeMap<String, u64>),
    Symlink(Vec<u8>),
    Special,
}

struct Node {
    attr: FileAttr,
    content: Content,
}

impl Node {
    fn children(&self) -> Result<&BTreeMap<String, u64>, EngineError> {
        match &self.content {
            Content::Dir(children) => Ok(children),
            _ => Err(EngineError::NotADirectory),
        }
    }

    fn children_mut(&mut self) -> Result<&mut BTreeMap<String, u64>, EngineError> {
        match &mut self.content {
            Content::Dir(children) => Ok(children),
            _ => Err(EngineError::NotADirectory),
        }
    }

    fn touch(&mut self, now: SystemTime) {
        self.attr.mtime = now;
        self.attr.ctime = now;
    }
}

struct Tree {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    uid: u32,
    gid: u32,
}

impl Tree {
    fn new(uid: u32, gid: u32) -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            next_ino: ROOT_INO,
            uid,
            gid,
        };
        let root = tree.alloc(FileKind::Directory, 0o755, 0, Content::Dir(BTreeMap::new()));
        debug_assert_eq!(root, ROOT_INO);
        tree.node_mut(root).attr.nlink = 2;
        tree
    }

    fn alloc(&mut self, kind: FileKind, perm: u32, rdev: u32, content: Content) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        let now = SystemTime::now();
        let size = match &content {
            Content::Symlink(target) => target.len() as u64,
            _ => 0,
        };
        let attr = FileAttr {
            ino,
            kind,
            size,
            perm: (perm & 0o7777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev,
            atime: now,
            mtime: now,
            ctime: now,
        };
        self.nodes.insert(ino, Node { attr, content });
        ino
    }

    fn node(&self, ino: u64) -> &Node {
        &self.nodes[&ino]
    }

    fn node_mut(&mut self, ino: u64) -> &mut Node {
        self.nodes.get_mut(&ino).expect("dangling inode in directory entry")
    }

    fn resolve(&self, path: &str) -> Result<u64, EngineError> {
        let mut cur = ROOT_INO;
        for part in components(path) {
            cur = *self
                .node(cur)
                .children()?
                .get(part)
                .ok_or(EngineError::NotFound)?;
        }
        Ok(cur)
    }

    /// Resolve the parent directory of `path` and return it with the final component.
    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(u64, &'p str), EngineError> {
        let (dir, name) = split_parent(path).ok_or(EngineError::InvalidInput)?;
        if name.len() > NAME_MAX {
            return Err(EngineError::NameTooLong);
        }
        let parent = self.resolve(dir)?;
        self.node(parent).children()?;
        Ok((parent, name))
    }

    fn insert_child(
        &mut self,
        path: &str,
        kind: FileKind,
        perm: u32,
        rdev: u32,
        content: Content,
    ) -> Result<u64, EngineError> {
        let (parent, name) = self.resolve_parent(path)?;
        if self.node(parent).children()?.contains_key(name) {
            return Err(EngineError::AlreadyExists);
        }
        let ino = self.alloc(kind, perm, rdev, content);
        let now = SystemTime::now();
        let dir = self.node_mut(parent);
        dir.children_mut()?.insert(name.to_owned(), ino);
        dir.touch(now);
        Ok(ino)
    }

    /// Drop one link to `ino`; the node goes away with its last link.
    fn unlink_node(&mut self, ino: u64) {
        let node = self.node_mut(ino);
        node.attr.nlink = node.attr.nlink.saturating_sub(1);
        node.attr.ctime = SystemTime::now();
        let gone = match node.content {
            Content::Dir(_) => true,
            _ => node.attr.nlink == 0,
        };
        if gone {
            self.nodes.remove(&ino);
        }
    }

    fn detach(&mut self, parent: u64, name: &str) -> Result<u64, EngineError> {
        let now = SystemTime::now();
        let dir = self.node_mut(parent);
        let ino = dir
            .children_mut()?
            .remove(name)
            .ok_or(EngineError::NotFound)?;
        dir.touch(now);
        Ok(ino)
    }

    fn file_data_mut(&mut self, path: &str) -> Result<&mut Node, EngineError> {
        let ino = self.resolve(path)?;
        let node = self.node_mut(ino);
        match node.content {
            Content::File(_) => Ok(node),
            Content::Dir(_) => Err(EngineError::IsADirectory),
            _ => Err(EngineError::InvalidInput),
        }
    }
}

/// Largest file the tree holds; a `Vec` cannot grow past `isize::MAX` bytes.
const MAX_FILE_SIZE: u64 = isize::MAX as u64;

/// Grow or shrink `data` to `len` bytes, zero filling. Fails with `EFBIG` past
/// [`MAX_FILE_SIZE`] and with `ENOSPC` when the allocation cannot be made.
fn resize_file(data: &mut Vec<u8>, len: u64) -> Result<(), EngineError> {
    if len > MAX_FILE_SIZE {
        return Err(EngineError::Os(Errno::EFBIG));
    }
    let len = usize::try_from(len).map_err(|_| EngineError::Os(Errno::EFBIG))?;
    if let Some(extra) = len.checked_sub(data.len()) {
        data.try_reserve_exact(extra).map_err(|_| EngineError::Os(Errno::ENOSPC))?;
    }
    data.resize(len, 0);
    Ok(())
}

/// Engine keeping the whole tree in process memory.
///
/// Objects are owned by the identity given at construction; [`MemoryEngine::check_access`]
/// evaluates masks against that identity the way the kernel would for the caller.
pub struct MemoryEngine {
    tree: Mutex<Tree>,
}

impl MemoryEngine {
    /// Engine owned by the current process user.
    pub fn new() -> Self {
        Self::with_identity(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    pub fn with_identity(uid: u32, gid: u32) -> Self {
        Self {
            tree: Mutex::new(Tree::new(uid, gid)),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn init(_root: &Path) -> Result<Self, EngineError> {
        Ok(Self::new())
    }

    async fn check_access(&self, path: &str, mask: u32) -> bool {
        let tree = self.tree();
        let Ok(ino) = tree.resolve(path) else {
            return false;
        };
        permits(&tree.node(ino).attr, tree.uid, tree.gid, mask)
    }

    async fn get_attributes(&self, path: &str) -> Result<FileAttr, EngineError> {
        let tree = self.tree();
        let ino = tree.resolve(path)?;
        Ok(tree.node(ino).attr.clone())
    }

    async fn list_directory(&self, path: &str) -> BoxStream<'static, String> {
        let names: Vec<String> = {
            let tree = self.tree();
            tree.resolve(path)
                .and_then(|ino| tree.node(ino).children().map(|c| c.keys().cloned().collect()))
                .unwrap_or_default()
        };
        stream::iter(names).boxed()
    }

    async fn create_object(
        &self,
        path: &str,
        mode: u32,
        rdev: Option<u64>,
    ) -> Result<(), EngineError> {
        let kind = FileKind::from_mode(mode).ok_or(EngineError::InvalidInput)?;
        let content = match kind {
            FileKind::RegularFile => Content::File(Vec::new()),
            FileKind::NamedPipe | FileKind::Socket | FileKind::CharDevice | FileKind::BlockDevice => {
                Content::Special
            }
            FileKind::Directory | FileKind::Symlink => return Err(EngineError::InvalidInput),
        };
        let rdev = match kind {
            FileKind::CharDevice | FileKind::BlockDevice => rdev.unwrap_or(0) as u32,
            _ => 0,
        };
        self.tree().insert_child(path, kind, mode, rdev, content)?;
        Ok(())
    }

    async fn create_directory(&self, path: &str, mode: u32) -> Result<(), EngineError> {
        let mut tree = self.tree();
        let ino = tree.insert_child(
            path,
            FileKind::Directory,
            mode,
            0,
            Content::Dir(BTreeMap::new()),
        )?;
        tree.node_mut(ino).attr.nlink = 2;
        let (parent, _) = tree.resolve_parent(path)?;
        tree.node_mut(parent).attr.nlink += 1;
        Ok(())
    }

    async fn remove_object(&self, path: &str) -> Result<(), EngineError> {
        let mut tree = self.tree();
        let (parent, name) = tree.resolve_parent(path)?;
        let ino = tree.resolve(path)?;
        if matches!(tree.node(ino).content, Content::Dir(_)) {
            return Err(EngineError::IsADirectory);
        }
        tree.detach(parent, name)?;
        tree.unlink_node(ino);
        Ok(())
    }

    async fn remove_directory(&self, path: &str) -> Result<(), EngineError> {
        let mut tree = self.tree();
        let ino = tree.resolve(path)?;
        if ino == ROOT_INO {
            return Err(EngineError::Os(Errno::EBUSY));
        }
        if !tree.node(ino).children()?.is_empty() {
            return Err(EngineError::DirectoryNotEmpty);
        }
        let (parent, name) = tree.resolve_parent(path)?;
        tree.detach(parent, name)?;
        tree.unlink_node(ino);
        let dir = tree.node_mut(parent);
        dir.attr.nlink = dir.attr.nlink.saturating_sub(1);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), EngineError> {
        let mut tree = self.tree();
        let src = tree.resolve(from)?;
        let (src_parent, src_name) = tree.resolve_parent(from)?;
        let (dst_parent, dst_name) = tree.resolve_parent(to)?;
        let src_is_dir = matches!(tree.node(src).content, Content::Dir(_));

        if src_is_dir && is_within(to, from) && !is_within(from, to) {
            return Err(EngineError::InvalidInput);
        }

        if let Some(&dst) = tree.node(dst_parent).children()?.get(dst_name) {
            if dst == src {
                return Ok(());
            }
            match (&tree.node(dst).content, src_is_dir) {
                (Content::Dir(children), true) if !children.is_empty() => {
                    return Err(EngineError::DirectoryNotEmpty);
                }
                (Content::Dir(_), true) => {}
                (Content::Dir(_), false) => return Err(EngineError::IsADirectory),
                (_, true) => return Err(EngineError::NotADirectory),
                (_, false) => {}
            }
            tree.detach(dst_parent, dst_name)?;
            tree.unlink_node(dst);
            if src_is_dir {
                let dir = tree.node_mut(dst_parent);
                dir.attr.nlink = dir.attr.nlink.saturating_sub(1);
            }
        }

        tree.detach(src_parent, src_name)?;
        let now = SystemTime::now();
        let dir = tree.node_mut(dst_parent);
        dir.children_mut()?.insert(dst_name.to_owned(), src);
        dir.touch(now);
        if src_is_dir && src_parent != dst_parent {
            tree.node_mut(src_parent).attr.nlink -= 1;
            tree.node_mut(dst_parent).attr.nlink += 1;
        }
        tree.node_mut(src).attr.ctime = now;
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> Result<(), EngineError> {
        let mut tree = self.tree();
        let node = tree.file_data_mut(path)?;
        if let Content::File(data) = &mut node.content {
            resize_file(data, size)?;
        }
        node.attr.size = size;
        node.touch(SystemTime::now());
        Ok(())
    }

    async fn read(
        &self,
        path: &str,
        capacity: usize,
        offset: u64,
    ) -> Result<Vec<u8>, EngineError> {
        let mut tree = self.tree();
        let node = tree.file_data_mut(path)?;
        node.attr.atime = SystemTime::now();
        let Content::File(data) = &node.content else {
            return Err(EngineError::InvalidInput);
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(capacity).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize, EngineError> {
        let too_big = EngineError::Os(Errno::EFBIG);
        let end = offset.checked_add(data.len() as u64).ok_or(too_big)?;
        if end > MAX_FILE_SIZE {
            return Err(too_big);
        }
        let mut tree = self.tree();
        let node = tree.file_data_mut(path)?;
        if let Content::File(buf) = &mut node.content {
            if (buf.len() as u64) < end {
                resize_file(buf, end)?;
            }
            let start = offset as usize;
            buf[start..start + data.len()].copy_from_slice(data);
            node.attr.size = buf.len() as u64;
        }
        node.touch(SystemTime::now());
        Ok(data.len())
    }

    async fn create_hardlink(&self, from: &str, to: &str) -> Result<(), EngineError> {
        let mut tree = self.tree();
        let src = tree.resolve(from)?;
        if matches!(tree.node(src).content, Content::Dir(_)) {
            return Err(EngineError::Os(Errno::EPERM));
        }
        let (parent, name) = tree.resolve_parent(to)?;
        if tree.node(parent).children()?.contains_key(name) {
            return Err(EngineError::AlreadyExists);
        }
        let now = SystemTime::now();
        let dir = tree.node_mut(parent);
        dir.children_mut()?.insert(name.to_owned(), src);
        dir.touch(now);
        let node = tree.node_mut(src);
        node.attr.nlink += 1;
        node.attr.ctime = now;
        Ok(())
    }

    async fn create_symlink(&self, target: &str, link: &str) -> Result<(), EngineError> {
        self.tree().insert_child(
            link,
            FileKind::Symlink,
            0o777,
            0,
            Content::Symlink(target.as_bytes().to_vec()),
        )?;
        Ok(())
    }

    async fn read_symlink(&self, path: &str, capacity: usize) -> Result<Vec<u8>, EngineError> {
        let tree = self.tree();
        let ino = tree.resolve(path)?;
        match &tree.node(ino).content {
            Content::Symlink(target) => Ok(target[..target.len().min(capacity)].to_vec()),
            _ => Err(EngineError::InvalidInput),
        }
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}

/// Split `/a/b/c` into `/a/b` and `c`. The root has no parent.
fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    let dir = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((dir, name))
}

/// Whether `path` names `ancestor` itself or something below it.
fn is_within(path: &str, ancestor: &str) -> bool {
    let mut path_parts = components(path);
    components(ancestor).all(|part| path_parts.next() == Some(part))
}

fn permits(attr: &FileAttr, uid: u32, gid: u32, mask: u32) -> bool {
    let mask = mask & 0o7;
    if mask == 0 {
        return true;
    }
    let perm = u32::from(attr.perm);
    if uid == 0 {
        // root bypasses rw checks but still needs some execute bit on files
        return mask & (libc::X_OK as u32) == 0
            || attr.kind == FileKind::Directory
            || perm & 0o111 != 0;
    }
    let bits = if uid == attr.uid {
        perm >> 6
    } else if gid == attr.gid {
        perm >> 3
    } else {
        perm
    } & 0o7;
    bits & mask == mask
}
