//! Inode numbers handed to the kernel, bound to the paths the adapter understands.
//!
//! The kernel addresses everything by inode while the adapter is path-addressed. Numbers are
//! assigned on first sight of a path and stay stable until the path is removed. Two hard links
//! to one object get two numbers here; attribute replies still carry each path's own number.
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct Inner {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    next: u64,
}

#[derive(Debug)]
pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        let mut inodes = HashMap::new();
        paths.insert(ROOT_INO, "/".to_owned());
        inodes.insert("/".to_owned(), ROOT_INO);
        Self {
            inner: Mutex::new(Inner {
                paths,
                inodes,
                next: ROOT_INO + 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.lock().paths.get(&ino).cloned()
    }

    /// Number bound to `path`, assigning a fresh one on first use.
    pub fn ino_of(&self, path: &str) -> u64 {
        let mut inner = self.lock();
        if let Some(ino) = inner.inodes.get(path) {
            return *ino;
        }
        let ino = inner.next;
        inner.next += 1;
        inner.paths.insert(ino, path.to_owned());
        inner.inodes.insert(path.to_owned(), ino);
        ino
    }

    /// Forget `path` and everything bound below it. Descendants are only ever bound through
    /// their parent, so an unbound path has nothing below it either.
    pub fn remove(&self, path: &str) {
        let mut inner = self.lock();
        if !inner.inodes.contains_key(path) {
            return;
        }
        let doomed: Vec<String> = inner
            .inodes
            .keys()
            .filter(|p| is_within(p, path))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(ino) = inner.inodes.remove(&p) {
                inner.paths.remove(&ino);
            }
        }
    }

    /// Rebind `from` and its descendants under `to`, dropping whatever `to` held before.
    pub fn rename(&self, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.remove(to);
        let mut inner = self.lock();
        let moved: Vec<(String, u64)> = inner
            .inodes
            .iter()
            .filter(|(p, _)| is_within(p, from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let new = format!("{to}{}", &old[from.len()..]);
            inner.inodes.remove(&old);
            inner.inodes.insert(new.clone(), ino);
            inner.paths.insert(ino, new);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().paths.len()
    }
}

/// Path of `name` inside the directory at `parent`.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}
