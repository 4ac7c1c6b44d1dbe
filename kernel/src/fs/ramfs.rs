//! In-memory filesystem.
//!
//! Nodes live in a slab arena and reference each other by index:
//! parent, first/last child, and prev/next sibling links form the tree,
//! with `last_child` giving O(1) append. Deletion is post-order when
//! recursive and refuses non-empty directories otherwise.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::FsError;
use crate::sync::SpinLock;

use super::{DirEntry, FileSystem, NodeKind};

type NodeIdx = u32;

const ROOT: NodeIdx = 0;

struct RamNode {
    name: String,
    kind: NodeKind,
    data: Vec<u8>,
    parent: Option<NodeIdx>,
    first_child: Option<NodeIdx>,
    last_child: Option<NodeIdx>,
    prev_sibling: Option<NodeIdx>,
    next_sibling: Option<NodeIdx>,
}

impl RamNode {
    fn new(name: &str, kind: NodeKind, parent: Option<NodeIdx>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            data: Vec::new(),
            parent,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
        }
    }
}

struct Arena {
    nodes: Vec<Option<RamNode>>,
    free: Vec<NodeIdx>,
}

impl Arena {
    fn new() -> Self {
        let mut nodes = Vec::new();
        nodes.push(Some(RamNode::new("", NodeKind::Directory, None)));
        Self {
            nodes,
            free: Vec::new(),
        }
    }

    fn node(&self, idx: NodeIdx) -> &RamNode {
        self.nodes[idx as usize].as_ref().expect("live node")
    }

    fn node_mut(&mut self, idx: NodeIdx) -> &mut RamNode {
        self.nodes[idx as usize].as_mut().expect("live node")
    }

    fn alloc(&mut self, node: RamNode) -> NodeIdx {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            (self.nodes.len() - 1) as NodeIdx
        }
    }

    fn release(&mut self, idx: NodeIdx) {
        self.nodes[idx as usize] = None;
        self.free.push(idx);
    }

    /// Append `child` to `parent`'s sibling list in O(1) via last_child.
    fn attach(&mut self, parent: NodeIdx, child: NodeIdx) {
        let old_last = self.node(parent).last_child;
        {
            let c = self.node_mut(child);
            c.parent = Some(parent);
            c.prev_sibling = old_last;
            c.next_sibling = None;
        }
        match old_last {
            Some(last) => self.node_mut(last).next_sibling = Some(child),
            None => self.node_mut(parent).first_child = Some(child),
        }
        self.node_mut(parent).last_child = Some(child);
    }

    /// Unlink `child` from its parent's sibling list.
    fn detach(&mut self, child: NodeIdx) {
        let (parent, prev, next) = {
            let c = self.node(child);
            (c.parent, c.prev_sibling, c.next_sibling)
        };
        match prev {
            Some(p) => self.node_mut(p).next_sibling = next,
            None => {
                if let Some(parent) = parent {
                    self.node_mut(parent).first_child = next;
                }
            }
        }
        match next {
            Some(n) => self.node_mut(n).prev_sibling = prev,
            None => {
                if let Some(parent) = parent {
                    self.node_mut(parent).last_child = prev;
                }
            }
        }
        let c = self.node_mut(child);
        c.parent = None;
        c.prev_sibling = None;
        c.next_sibling = None;
    }

    fn find_child(&self, parent: NodeIdx, name: &str) -> Option<NodeIdx> {
        let mut cur = self.node(parent).first_child;
        while let Some(idx) = cur {
            if self.node(idx).name == name {
                return Some(idx);
            }
            cur = self.node(idx).next_sibling;
        }
        None
    }

    /// Walk `path` from the root, honoring `.` and `..`.
    fn lookup(&self, path: &str) -> Result<NodeIdx, FsError> {
        let mut cur = ROOT;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            match comp {
                "." => {}
                ".." => {
                    cur = self.node(cur).parent.unwrap_or(ROOT);
                }
                name => {
                    if self.node(cur).kind != NodeKind::Directory {
                        return Err(FsError::NotADirectory);
                    }
                    cur = self.find_child(cur, name).ok_or(FsError::NotFound)?;
                }
            }
        }
        Ok(cur)
    }

    /// Split a path into its parent node and final component.
    fn lookup_parent<'p>(&self, path: &'p str) -> Result<(NodeIdx, &'p str), FsError> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::InvalidPath);
        }
        let (dir, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => return Err(FsError::InvalidPath),
        };
        if name.is_empty() || name == "." || name == ".." {
            return Err(FsError::InvalidPath);
        }
        let parent = self.lookup(dir)?;
        if self.node(parent).kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok((parent, name))
    }

    /// Free a whole subtree, post-order, including `idx` itself. `idx`
    /// must already be detached.
    fn release_subtree(&mut self, idx: NodeIdx) -> usize {
        let mut freed = 0;
        let mut child = self.node(idx).first_child;
        while let Some(c) = child {
            let next = self.node(c).next_sibling;
            freed += self.release_subtree(c);
            child = next;
        }
        self.release(idx);
        freed + 1
    }

    fn live_nodes(&self) -> usize {
        self.nodes.iter().flatten().count()
    }
}

/// The RAM filesystem driver.
pub struct RamFs {
    inner: SpinLock<Arena>,
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(Arena::new()),
        }
    }

    /// Live node count, root included. Diagnostic.
    pub fn node_count(&self) -> usize {
        self.inner.lock().live_nodes()
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RamFs {
    fn fs_name(&self) -> &'static str {
        "ramfs"
    }

    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let arena = self.inner.lock();
        let idx = arena.lookup(path)?;
        let node = arena.node(idx);
        if node.kind != NodeKind::File {
            return Err(FsError::IsADirectory);
        }
        if offset >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - offset);
        buf[..n].copy_from_slice(&node.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, path: &str, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        let mut arena = self.inner.lock();
        let idx = arena.lookup(path)?;
        let node = arena.node_mut(idx);
        if node.kind != NodeKind::File {
            return Err(FsError::IsADirectory);
        }
        let end = offset + data.len();
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let arena = self.inner.lock();
        let idx = arena.lookup(path)?;
        if arena.node(idx).kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut out = Vec::new();
        let mut cur = arena.node(idx).first_child;
        while let Some(c) = cur {
            let node = arena.node(c);
            out.push(DirEntry {
                name: node.name.clone(),
                kind: node.kind,
                size: node.data.len(),
            });
            cur = node.next_sibling;
        }
        Ok(out)
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        let arena = self.inner.lock();
        let idx = arena.lookup(path)?;
        Ok(arena.node(idx).kind == NodeKind::Directory)
    }

    fn create_file(&self, path: &str) -> Result<(), FsError> {
        let mut arena = self.inner.lock();
        let (parent, name) = arena.lookup_parent(path)?;
        if arena.find_child(parent, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let node = arena.alloc(RamNode::new(name, NodeKind::File, Some(parent)));
        arena.attach(parent, node);
        Ok(())
    }

    fn create_dir(&self, path: &str) -> Result<(), FsError> {
        let mut arena = self.inner.lock();
        let (parent, name) = arena.lookup_parent(path)?;
        if arena.find_child(parent, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let node = arena.alloc(RamNode::new(name, NodeKind::Directory, Some(parent)));
        arena.attach(parent, node);
        Ok(())
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), FsError> {
        let mut arena = self.inner.lock();
        let idx = arena.lookup(path)?;
        if idx == ROOT {
            return Err(FsError::InvalidPath);
        }
        let node = arena.node(idx);
        if node.kind == NodeKind::Directory && node.first_child.is_some() && !recursive {
            return Err(FsError::DirectoryNotEmpty);
        }
        arena.detach(idx);
        arena.release_subtree(idx);
        Ok(())
    }

    fn size(&self, path: &str) -> Result<usize, FsError> {
        let arena = self.inner.lock();
        let idx = arena.lookup(path)?;
        let node = arena.node(idx);
        if node.kind != NodeKind::File {
            return Err(FsError::IsADirectory);
        }
        Ok(node.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read_round_trip() {
        let fs = RamFs::new();
        fs.create_dir("/t").unwrap();
        fs.create_file("/t/f").unwrap();
        assert_eq!(fs.write("/t/f", 0, b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        let n = fs.read("/t/f", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(fs.size("/t/f").unwrap(), 5);
    }

    #[test]
    fn test_write_grows_with_zero_fill() {
        let fs = RamFs::new();
        fs.create_file("/f").unwrap();
        fs.write("/f", 8, b"tail").unwrap();
        assert_eq!(fs.size("/f").unwrap(), 12);
        let mut buf = [0xFFu8; 12];
        fs.read("/f", 0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(&buf[8..], b"tail");
    }

    #[test]
    fn test_read_past_eof() {
        let fs = RamFs::new();
        fs.create_file("/f").unwrap();
        fs.write("/f", 0, b"abc").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read("/f", 10, &mut buf).unwrap(), 0);
        assert_eq!(fs.read("/f", 2, &mut buf).unwrap(), 1);
    }

    #[test]
    fn test_lookup_honors_dot_and_dotdot() {
        let fs = RamFs::new();
        fs.create_dir("/a").unwrap();
        fs.create_dir("/a/b").unwrap();
        fs.create_file("/a/b/f").unwrap();
        fs.write("/a/b/f", 0, b"x").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fs.read("/a/./b/../b/f", 0, &mut buf).unwrap(), 1);
        // `..` at root stays at root.
        assert!(fs.is_dir("/../..").unwrap());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let fs = RamFs::new();
        fs.create_file("/f").unwrap();
        assert_eq!(fs.create_file("/f"), Err(FsError::AlreadyExists));
        assert_eq!(fs.create_dir("/f"), Err(FsError::AlreadyExists));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let fs = RamFs::new();
        assert_eq!(fs.create_file("/no/such/f"), Err(FsError::NotFound));
    }

    #[test]
    fn test_delete_refuses_nonempty_without_recursive() {
        let fs = RamFs::new();
        fs.create_dir("/d").unwrap();
        fs.create_file("/d/f").unwrap();
        assert_eq!(fs.delete("/d", false), Err(FsError::DirectoryNotEmpty));
        // The tree is untouched.
        assert!(fs.size("/d/f").is_ok());
    }

    #[test]
    fn test_recursive_delete_frees_subtree() {
        let fs = RamFs::new();
        fs.create_dir("/x").unwrap();
        fs.create_dir("/x/y").unwrap();
        fs.create_file("/x/y/a").unwrap();
        fs.create_file("/x/y/b").unwrap();
        fs.create_file("/x/c").unwrap();
        let before = fs.node_count();
        assert_eq!(before, 6); // root + 5

        fs.delete("/x", true).unwrap();
        // Nothing under /x is findable, and all 5 nodes were released.
        assert_eq!(fs.size("/x/y/a"), Err(FsError::NotFound));
        assert_eq!(fs.is_dir("/x"), Err(FsError::NotFound));
        assert_eq!(fs.node_count(), 1);
    }

    #[test]
    fn test_sibling_list_stays_well_formed() {
        let fs = RamFs::new();
        for name in ["a", "b", "c", "d"] {
            fs.create_file(&alloc::format!("/{}", name)).unwrap();
        }
        // Remove from the middle; list order preserved.
        fs.delete("/b", false).unwrap();
        let names: Vec<String> = fs
            .list_dir("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["a", "c", "d"]);

        // Remove head and tail, then append: last_child is O(1) right.
        fs.delete("/a", false).unwrap();
        fs.delete("/d", false).unwrap();
        fs.create_file("/e").unwrap();
        let names: Vec<String> = fs
            .list_dir("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["c", "e"]);
    }

    #[test]
    fn test_list_dir_reports_kinds_and_sizes() {
        let fs = RamFs::new();
        fs.create_dir("/d").unwrap();
        fs.create_file("/f").unwrap();
        fs.write("/f", 0, b"12345").unwrap();
        let entries = fs.list_dir("/").unwrap();
        let d = entries.iter().find(|e| e.name == "d").unwrap();
        let f = entries.iter().find(|e| e.name == "f").unwrap();
        assert_eq!(d.kind, NodeKind::Directory);
        assert_eq!(f.kind, NodeKind::File);
        assert_eq!(f.size, 5);
    }

    #[test]
    fn test_file_operations_reject_directories() {
        let fs = RamFs::new();
        fs.create_dir("/d").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fs.read("/d", 0, &mut buf), Err(FsError::IsADirectory));
        assert_eq!(fs.write("/d", 0, b"x"), Err(FsError::IsADirectory));
        assert_eq!(fs.list_dir("/d").unwrap(), Vec::new());
        assert_eq!(fs.delete("/", false), Err(FsError::InvalidPath));
    }

    #[test]
    fn test_slab_reuses_released_slots() {
        let fs = RamFs::new();
        fs.create_file("/a").unwrap();
        let count = fs.node_count();
        fs.delete("/a", false).unwrap();
        fs.create_file("/b").unwrap();
        // The freed slot was recycled instead of growing the arena.
        assert_eq!(fs.node_count(), count);
    }
}
