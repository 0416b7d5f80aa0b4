//! The in-memory hierarchical path/value store.
//!
//! Internally a trie keyed by path segment, though only the leaf-like
//! path-to-bytes mapping is observable from the outside — interior-ness
//! is not a distinguished state. A zero-length value is treated as
//! absence: setting one deletes the node, and empty interior nodes left
//! behind by a deletion are collapsed eagerly.

use std::collections::BTreeMap;

use parking_lot::RwLock;

#[derive(Default)]
struct TrieNode {
    value: Option<Vec<u8>>,
    children: BTreeMap<String, TrieNode>,
}

/// Where a `search` should look: the implicit root, or a concrete
/// directory path (already stripped of its trailing `/`).
#[derive(Debug, Clone, Copy)]
pub enum SearchTarget<'a> {
    Root,
    Directory(&'a str),
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// The hierarchical store. Cheap to clone (an `Arc`-free `RwLock`
/// wrapper); share it behind an `Arc` across dispatch threads/tasks.
pub struct Store {
    root: RwLock<TrieNode>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(TrieNode::default()),
        }
    }

    /// Insert/replace `path`'s value, or delete it if `value` is empty.
    /// Returns the prior value, if any.
    pub fn set(&self, path: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        let segs = segments(path);
        let mut root = self.root.write();
        if value.is_empty() {
            remove_path(&mut root, &segs)
        } else {
            insert_path(&mut root, &segs, value)
        }
    }

    /// Exact lookup. `None` means absent.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        let segs = segments(path);
        let root = self.root.read();
        let mut node = &*root;
        for seg in &segs {
            node = node.children.get(*seg)?;
        }
        node.value.clone()
    }

    /// The set of immediate children of `target`. Order is unspecified
    /// but the return type is duplicate-free by construction (a
    /// `BTreeMap`'s keys are already distinct).
    pub fn search(&self, target: SearchTarget<'_>) -> Vec<String> {
        let root = self.root.read();
        let (node, prefix) = match target {
            SearchTarget::Root => (&*root, String::new()),
            SearchTarget::Directory(dir) => {
                let segs = segments(dir);
                let mut node = &*root;
                for seg in &segs {
                    match node.children.get(*seg) {
                        Some(child) => node = child,
                        None => return Vec::new(),
                    }
                }
                (node, dir.to_string())
            }
        };
        node.children
            .keys()
            .map(|k| format!("{prefix}/{k}"))
            .collect()
    }

    /// Remove `path` and every descendant. Returns the removed
    /// (path, old_value) pairs, for notification purposes. A no-op on a
    /// nonexistent subtree returns an empty vec.
    pub fn prune(&self, path: &str) -> Vec<(String, Vec<u8>)> {
        let segs = segments(path);
        let mut root = self.root.write();
        let mut removed = Vec::new();
        prune_path(&mut root, &segs, String::new(), &mut removed);
        removed
    }
}

fn insert_path(node: &mut TrieNode, segs: &[&str], value: Vec<u8>) -> Option<Vec<u8>> {
    match segs.split_first() {
        None => node.value.replace(value),
        Some((head, rest)) => {
            let child = node.children.entry((*head).to_string()).or_default();
            insert_path(child, rest, value)
        }
    }
}

fn remove_path(node: &mut TrieNode, segs: &[&str]) -> Option<Vec<u8>> {
    match segs.split_first() {
        None => node.value.take(),
        Some((head, rest)) => {
            let child = node.children.get_mut(*head)?;
            let prior = remove_path(child, rest);
            if child.value.is_none() && child.children.is_empty() {
                node.children.remove(*head);
            }
            prior
        }
    }
}

fn prune_path(
    node: &mut TrieNode,
    segs: &[&str],
    prefix: String,
    out: &mut Vec<(String, Vec<u8>)>,
) {
    match segs.split_first() {
        None => {
            collect_all(node, &prefix, out);
            node.value = None;
            node.children.clear();
        }
        Some((head, rest)) => {
            let Some(child) = node.children.get_mut(*head) else {
                return;
            };
            let child_prefix = format!("{prefix}/{head}");
            prune_path(child, rest, child_prefix, out);
            if child.value.is_none() && child.children.is_empty() {
                node.children.remove(*head);
            }
        }
    }
}

fn collect_all(node: &TrieNode, prefix: &str, out: &mut Vec<(String, Vec<u8>)>) {
    if let Some(v) = &node.value {
        out.push((prefix.to_string(), v.clone()));
    }
    for (k, child) in &node.children {
        collect_all(child, &format!("{prefix}/{k}"), out);
    }
}
