//! inode <-> 挂载路径 映射。
//!
//! The store has no inode numbers, so the adapter hands them out on first sight of a path and
//! keeps them stable until the path is removed or renamed away.

use std::collections::HashMap;
use std::sync::Mutex;

pub const ROOT_INO: u64 = 1;

struct InodeMap {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

pub struct InodeTable {
    inner: Mutex<InodeMap>,
}

fn is_under(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.starts_with('/'))
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, "/".to_string());
        by_path.insert("/".to_string(), ROOT_INO);
        Self {
            inner: Mutex::new(InodeMap {
                by_ino,
                by_path,
                next: ROOT_INO + 1,
            }),
        }
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.by_ino.get(&ino).cloned()
    }

    /// Returns the inode of `path`, allocating one if the path is new.
    pub fn ino_of(&self, path: &str) -> u64 {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ino) = map.by_path.get(path) {
            return *ino;
        }
        let ino = map.next;
        map.next += 1;
        map.by_ino.insert(ino, path.to_string());
        map.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Drops `path` and everything below it.
    pub fn forget(&self, path: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let gone: Vec<(String, u64)> = map
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && (p.as_str() == path || is_under(p, path)))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (p, ino) in gone {
            map.by_path.remove(&p);
            map.by_ino.remove(&ino);
        }
    }

    /// Moves `from` and its descendants to `to`, keeping their inode numbers.
    pub fn rename(&self, from: &str, to: &str) {
        if from == "/" || from == to {
            return;
        }
        // 先清掉目标上旧的映射
        self.forget(to);
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let moved: Vec<(String, u64)> = map
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == from || is_under(p, from))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (old, ino) in moved {
            let new = format!("{to}{}", &old[from.len()..]);
            map.by_path.remove(&old);
            map.by_path.insert(new.clone(), ino);
            map.by_ino.insert(ino, new);
        }
    }

    pub fn len(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_allocation() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
        assert_eq!(table.ino_of("/"), ROOT_INO);
        let a = table.ino_of("/c/a");
        assert_eq!(table.ino_of("/c/a"), a);
        assert_ne!(table.ino_of("/c/b"), a);
        assert_eq!(table.path_of(a).as_deref(), Some("/c/a"));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_forget_subtree() {
        let table = InodeTable::new();
        let d = table.ino_of("/c/d");
        let f = table.ino_of("/c/d/f");
        let sibling = table.ino_of("/c/dd");
        table.forget("/c/d");
        assert!(table.path_of(d).is_none());
        assert!(table.path_of(f).is_none());
        assert_eq!(table.path_of(sibling).as_deref(), Some("/c/dd"));
        table.forget("/");
        assert!(table.path_of(sibling).is_none());
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
    }

    #[test]
    fn test_rename_keeps_inodes() {
        let table = InodeTable::new();
        let d = table.ino_of("/c/d");
        let f = table.ino_of("/c/d/f");
        let stale = table.ino_of("/c/e");
        table.rename("/c/d", "/c/e");
        assert_eq!(table.path_of(d).as_deref(), Some("/c/e"));
        assert_eq!(table.path_of(f).as_deref(), Some("/c/e/f"));
        assert!(table.path_of(stale).is_none());
        assert_eq!(table.ino_of("/c/e/f"), f);
    }
}
