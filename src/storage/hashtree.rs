//! Persistent extensible hash index mapping byte-string keys to 64-bit
//! values.
//!
//! The index is a radix tree of pages stored through a [`StorageManager`]:
//! directory pages fan out on the next key byte (plus one terminal slot for
//! keys that end at the current depth) and bucket pages hold up to
//! [`BUCKET_MAX`] entries. A bucket that overflows is split into a directory
//! one level deeper; the split is idempotent because it rewrites whole pages.
//! The root page location is persisted in the storage manager's root table.

use std::collections::VecDeque;

use crate::error::{GraphError, Result};
use crate::storage::manager::{StorageManager, ROOT_ID_HASH_INDEX};
use crate::util;

/// Maximum number of entries in a bucket page before it splits.
pub const BUCKET_MAX: usize = 8;

const DIR_FANOUT: usize = 256;
const DIR_TERMINAL: usize = DIR_FANOUT;
const DIR_CHILDREN: usize = DIR_FANOUT + 1;

const TAG_DIRECTORY: u8 = 0x01;
const TAG_BUCKET: u8 = 0x02;

#[derive(Debug)]
enum HashPage {
    Directory {
        depth: u16,
        children: Vec<u64>,
    },
    Bucket {
        depth: u16,
        entries: Vec<(Vec<u8>, u64)>,
    },
}

impl HashPage {
    fn encode(&self) -> Vec<u8> {
        match self {
            HashPage::Directory { depth, children } => {
                let mut buf = Vec::with_capacity(3 + DIR_CHILDREN * 8);
                buf.push(TAG_DIRECTORY);
                buf.extend_from_slice(&depth.to_le_bytes());
                for child in children {
                    buf.extend_from_slice(&child.to_le_bytes());
                }
                buf
            }
            HashPage::Bucket { depth, entries } => {
                let mut buf = Vec::with_capacity(5 + entries.len() * 16);
                buf.push(TAG_BUCKET);
                buf.extend_from_slice(&depth.to_le_bytes());
                buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                for (key, value) in entries {
                    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
                    buf.extend_from_slice(key);
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                buf
            }
        }
    }

    fn decode(buf: &[u8]) -> Result<HashPage> {
        let tag = *buf
            .first()
            .ok_or_else(|| GraphError::Corruption("empty hash index page".into()))?;
        let depth = util::read_u16_le(buf, 1)?;
        match tag {
            TAG_DIRECTORY => {
                let mut children = Vec::with_capacity(DIR_CHILDREN);
                for i in 0..DIR_CHILDREN {
                    children.push(util::read_u64_le(buf, 3 + i * 8)?);
                }
                Ok(HashPage::Directory { depth, children })
            }
            TAG_BUCKET => {
                let count = util::read_u16_le(buf, 3)? as usize;
                let mut entries = Vec::with_capacity(count);
                let mut cursor = 5usize;
                for _ in 0..count {
                    let klen = util::read_u16_le(buf, cursor)? as usize;
                    cursor += 2;
                    let key = buf
                        .get(cursor..cursor + klen)
                        .ok_or_else(|| {
                            GraphError::Corruption("hash bucket key out of bounds".into())
                        })?
                        .to_vec();
                    cursor += klen;
                    let value = util::read_u64_le(buf, cursor)?;
                    cursor += 8;
                    entries.push((key, value));
                }
                Ok(HashPage::Bucket { depth, entries })
            }
            other => Err(GraphError::Corruption(format!(
                "unknown hash index page tag {other}"
            ))),
        }
    }
}

fn child_index(key: &[u8], depth: u16) -> usize {
    match key.get(depth as usize) {
        Some(&byte) => byte as usize,
        None => DIR_TERMINAL,
    }
}

/// Handle to a persistent hash index inside one storage manager.
///
/// The handle itself only holds the root location; every operation receives
/// the storage manager it operates on.
#[derive(Debug, Clone, Copy)]
pub struct HashTree {
    root: u64,
}

impl HashTree {
    /// Loads the index from the manager's root table, creating an empty one
    /// on first use.
    pub fn load(sm: &mut dyn StorageManager) -> Result<Self> {
        let root = sm.root(ROOT_ID_HASH_INDEX)?;
        if root != 0 {
            return Ok(Self { root });
        }
        let page = HashPage::Bucket {
            depth: 0,
            entries: Vec::new(),
        };
        let root = sm.insert(&page.encode())?;
        sm.set_root(ROOT_ID_HASH_INDEX, root)?;
        Ok(Self { root })
    }

    /// Inserts or replaces `key`, returning the previous value if any.
    pub fn put(
        &mut self,
        sm: &mut dyn StorageManager,
        key: &[u8],
        value: u64,
    ) -> Result<Option<u64>> {
        let mut path: Vec<(u64, usize)> = Vec::new();
        let mut current = self.root;

        loop {
            match HashPage::decode(&sm.fetch(current)?)? {
                HashPage::Directory { depth, mut children } => {
                    let idx = child_index(key, depth);
                    let child = children[idx];
                    if child == 0 {
                        let bucket = HashPage::Bucket {
                            depth: depth + 1,
                            entries: vec![(key.to_vec(), value)],
                        };
                        children[idx] = sm.insert(&bucket.encode())?;
                        let page = HashPage::Directory { depth, children };
                        let new_loc = sm.update(current, &page.encode())?;
                        self.fix_parent(sm, &path, current, new_loc)?;
                        return Ok(None);
                    }
                    path.push((current, idx));
                    current = child;
                }
                HashPage::Bucket { depth, mut entries } => {
                    if let Some(entry) = entries.iter_mut().find(|(k, _)| k == key) {
                        let old = entry.1;
                        entry.1 = value;
                        let page = HashPage::Bucket { depth, entries };
                        let new_loc = sm.update(current, &page.encode())?;
                        self.fix_parent(sm, &path, current, new_loc)?;
                        return Ok(Some(old));
                    }

                    entries.push((key.to_vec(), value));
                    let new_loc = if entries.len() <= BUCKET_MAX {
                        let page = HashPage::Bucket { depth, entries };
                        sm.update(current, &page.encode())?
                    } else {
                        self.split_bucket(sm, current, entries, depth)?
                    };
                    self.fix_parent(sm, &path, current, new_loc)?;
                    return Ok(None);
                }
            }
        }
    }

    /// Looks up `key`, returning its value and the location of the bucket
    /// page holding it.
    pub fn get(&self, sm: &mut dyn StorageManager, key: &[u8]) -> Result<Option<(u64, u64)>> {
        let mut current = self.root;
        loop {
            match HashPage::decode(&sm.fetch(current)?)? {
                HashPage::Directory { depth, children } => {
                    let child = children[child_index(key, depth)];
                    if child == 0 {
                        return Ok(None);
                    }
                    current = child;
                }
                HashPage::Bucket { entries, .. } => {
                    return Ok(entries
                        .into_iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| (v, current)));
                }
            }
        }
    }

    /// Removes `key`, returning its previous value if it was present.
    pub fn remove(&mut self, sm: &mut dyn StorageManager, key: &[u8]) -> Result<Option<u64>> {
        let mut path: Vec<(u64, usize)> = Vec::new();
        let mut current = self.root;

        loop {
            match HashPage::decode(&sm.fetch(current)?)? {
                HashPage::Directory { depth, children } => {
                    let idx = child_index(key, depth);
                    let child = children[idx];
                    if child == 0 {
                        return Ok(None);
                    }
                    path.push((current, idx));
                    current = child;
                }
                HashPage::Bucket { depth, mut entries } => {
                    let Some(pos) = entries.iter().position(|(k, _)| k == key) else {
                        return Ok(None);
                    };
                    let (_, old) = entries.remove(pos);
                    let page = HashPage::Bucket { depth, entries };
                    let new_loc = sm.update(current, &page.encode())?;
                    self.fix_parent(sm, &path, current, new_loc)?;
                    return Ok(Some(old));
                }
            }
        }
    }

    /// Lazily iterates every `(key, value)` entry whose key starts with
    /// `prefix`, in byte order.
    pub fn prefix_iter<'a>(
        &self,
        sm: &'a mut dyn StorageManager,
        prefix: &[u8],
    ) -> HashTreeIter<'a> {
        HashTreeIter {
            sm,
            prefix: prefix.to_vec(),
            stack: vec![self.root],
            pending: VecDeque::new(),
            failed: false,
        }
    }

    fn split_bucket(
        &mut self,
        sm: &mut dyn StorageManager,
        loc: u64,
        entries: Vec<(Vec<u8>, u64)>,
        depth: u16,
    ) -> Result<u64> {
        let children = Self::distribute(sm, entries, depth)?;
        let page = HashPage::Directory { depth, children };
        sm.update(loc, &page.encode())
    }

    fn distribute(
        sm: &mut dyn StorageManager,
        entries: Vec<(Vec<u8>, u64)>,
        depth: u16,
    ) -> Result<Vec<u64>> {
        let mut groups: Vec<Vec<(Vec<u8>, u64)>> = vec![Vec::new(); DIR_CHILDREN];
        for (key, value) in entries {
            groups[child_index(&key, depth)].push((key, value));
        }

        let mut children = vec![0u64; DIR_CHILDREN];
        for (idx, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            children[idx] = if group.len() <= BUCKET_MAX || idx == DIR_TERMINAL {
                let page = HashPage::Bucket {
                    depth: depth + 1,
                    entries: group,
                };
                sm.insert(&page.encode())?
            } else {
                // All grouped keys share the prefix byte; split one level
                // deeper until the groups fit.
                let grand_children = Self::distribute(sm, group, depth + 1)?;
                let page = HashPage::Directory {
                    depth: depth + 1,
                    children: grand_children,
                };
                sm.insert(&page.encode())?
            };
        }
        Ok(children)
    }

    fn fix_parent(
        &mut self,
        sm: &mut dyn StorageManager,
        path: &[(u64, usize)],
        old_loc: u64,
        new_loc: u64,
    ) -> Result<()> {
        if old_loc == new_loc {
            return Ok(());
        }
        match path.last() {
            None => {
                self.root = new_loc;
                sm.set_root(ROOT_ID_HASH_INDEX, new_loc)?;
                Ok(())
            }
            Some(&(parent_loc, idx)) => {
                let HashPage::Directory { depth, mut children } =
                    HashPage::decode(&sm.fetch(parent_loc)?)?
                else {
                    return Err(GraphError::Corruption(
                        "hash index parent page is not a directory".into(),
                    ));
                };
                children[idx] = new_loc;
                let page = HashPage::Directory { depth, children };
                // Directory pages are fixed size, so this update stays put.
                let updated = sm.update(parent_loc, &page.encode())?;
                debug_assert_eq!(updated, parent_loc);
                Ok(())
            }
        }
    }
}

/// Lazy prefix iterator over a hash index.
pub struct HashTreeIter<'a> {
    sm: &'a mut dyn StorageManager,
    prefix: Vec<u8>,
    stack: Vec<u64>,
    pending: VecDeque<(Vec<u8>, u64)>,
    failed: bool,
}

impl Iterator for HashTreeIter<'_> {
    type Item = Result<(Vec<u8>, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            let loc = self.stack.pop()?;
            let page = match self.sm.fetch(loc).and_then(|b| HashPage::decode(&b)) {
                Ok(page) => page,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            match page {
                HashPage::Directory { depth, children } => {
                    let d = depth as usize;
                    if d < self.prefix.len() {
                        // Still inside the prefix: descend a single branch.
                        let child = children[self.prefix[d] as usize];
                        if child != 0 {
                            self.stack.push(child);
                        }
                    } else {
                        // Past the prefix: visit every branch, terminal
                        // (shortest keys) first, so push it last.
                        for idx in (0..DIR_FANOUT).rev() {
                            if children[idx] != 0 {
                                self.stack.push(children[idx]);
                            }
                        }
                        if children[DIR_TERMINAL] != 0 {
                            self.stack.push(children[DIR_TERMINAL]);
                        }
                    }
                }
                HashPage::Bucket { mut entries, .. } => {
                    entries.retain(|(k, _)| k.starts_with(&self.prefix));
                    entries.sort();
                    self.pending.extend(entries);
                }
            }
        }
    }
}
