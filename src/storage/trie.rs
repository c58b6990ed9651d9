use std::collections::HashMap;

use parking_lot::RwLock;

use super::StorageBackend;
use crate::types::error::Result;

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct TrieInner {
    root: TrieNode,
    len: usize,
}

/// In-memory backend storing keys as a trie over `/`-separated segments.
/// Shares prefixes between deep paths, which keeps large trees compact.
/// State does not survive the process; interchangeable with the SQLite
/// backend behind [`StorageBackend`].
pub struct TrieBackend {
    inner: RwLock<TrieInner>,
}

impl TrieBackend {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TrieInner::default()),
        }
    }
}

impl Default for TrieBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn segments(key: &str) -> impl Iterator<Item = &str> {
    key.split('/')
}

/// Removes `key` below `node`, pruning empty branches on the way back up.
/// Returns (removed, node_is_now_empty).
fn remove(node: &mut TrieNode, parts: &[&str]) -> (bool, bool) {
    match parts.split_first() {
        None => {
            let removed = node.value.take().is_some();
            (removed, node.children.is_empty())
        }
        Some((head, rest)) => {
            let Some(child) = node.children.get_mut(*head) else {
                return (false, false);
            };
            let (removed, child_empty) = remove(child, rest);
            if removed && child_empty {
                node.children.remove(*head);
            }
            (removed, node.children.is_empty() && node.value.is_none())
        }
    }
}

fn gather(node: &TrieNode, prefix: &str, out: &mut Vec<(String, Vec<u8>)>) {
    if let Some(value) = &node.value {
        out.push((prefix.to_string(), value.clone()));
    }
    for (part, child) in &node.children {
        let path = if prefix.is_empty() {
            part.clone()
        } else {
            format!("{prefix}/{part}")
        };
        gather(child, &path, out);
    }
}

impl StorageBackend for TrieBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read();
        let mut node = &inner.root;
        for part in segments(key) {
            match node.children.get(part) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(node.value.clone())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        let mut node = &mut inner.root;
        for part in segments(key) {
            node = node.children.entry(part.to_string()).or_default();
        }
        if node.value.replace(value.to_vec()).is_none() {
            inner.len += 1;
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let parts: Vec<&str> = segments(key).collect();
        let (removed, _) = remove(&mut inner.root, &parts);
        if removed {
            inner.len -= 1;
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<()> {
        // Swapping in a fresh root both drops the data and reinitializes the
        // structure in one step.
        *self.inner.write() = TrieInner::default();
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.inner.read().len)
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items()?.into_iter().map(|(key, _)| key).collect())
    }

    fn items(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.len);
        gather(&inner.root, "", &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_prefixes_stay_independent() {
        let trie = TrieBackend::new();
        trie.put("src/cache.rs", b"a").unwrap();
        trie.put("src/cache_tests.rs", b"b").unwrap();
        trie.put("src", b"dir-entry").unwrap();

        assert_eq!(trie.len().unwrap(), 3);
        assert_eq!(trie.get("src/cache.rs").unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(trie.get("src").unwrap().as_deref(), Some(&b"dir-entry"[..]));

        assert!(trie.delete("src/cache.rs").unwrap());
        assert_eq!(trie.get("src/cache.rs").unwrap(), None);
        // Sibling and prefix entries survive the prune.
        assert_eq!(trie.get("src/cache_tests.rs").unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(trie.get("src").unwrap().as_deref(), Some(&b"dir-entry"[..]));
    }

    #[test]
    fn delete_of_missing_key_reports_false() {
        let trie = TrieBackend::new();
        trie.put("a/b", b"x").unwrap();
        assert!(!trie.delete("a").unwrap());
        assert!(!trie.delete("a/b/c").unwrap());
        assert!(!trie.delete("nope").unwrap());
        assert_eq!(trie.len().unwrap(), 1);
    }

    #[test]
    fn overwrite_does_not_grow_len() {
        let trie = TrieBackend::new();
        trie.put("k", b"1").unwrap();
        trie.put("k", b"2").unwrap();
        assert_eq!(trie.len().unwrap(), 1);
        assert_eq!(trie.get("k").unwrap().as_deref(), Some(&b"2"[..]));
    }
}
