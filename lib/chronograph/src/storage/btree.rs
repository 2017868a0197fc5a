//! A disk B+Tree over fixed-width keys and payloads, with copy-on-write
//! pages.
//!
//! A writer never modifies a page an existing root can reach: it stages a
//! shadow copy, links it into a new spine and returns the new root. Readers
//! keep working from the root they started with, which is what makes
//! snapshot isolation free of read-side locks. Pages replaced by a commit
//! are only recycled once no snapshot can reference them (the storage layer
//! tracks that).
//!
//! Range scans walk a cursor with an explicit page stack; sibling links
//! cannot stay coherent across copy-on-write roots.

use crate::storage::binary_encoder::{IndexKey, IndexPayload, KEY_LEN, PAYLOAD_LEN};
use crate::storage::error::{CorruptionError, StorageError};
use crate::storage::paging::{PageId, PagedFile, NO_PAGE, PAGE_SIZE};
use rustc_hash::FxHashSet;
use std::sync::Arc;

const NODE_HEADER_LEN: usize = 8;
const LEAF_ENTRY_LEN: usize = KEY_LEN + PAYLOAD_LEN;
const INTERNAL_ENTRY_LEN: usize = KEY_LEN + 8;

pub const LEAF_CAPACITY: usize = (PAGE_SIZE - NODE_HEADER_LEN) / LEAF_ENTRY_LEN;
pub const INTERNAL_CAPACITY: usize = (PAGE_SIZE - NODE_HEADER_LEN - 8) / INTERNAL_ENTRY_LEN;

/// Assumed average fill of a node, used by cardinality estimation only.
const ESTIMATED_FILL_NUM: u64 = 2;
const ESTIMATED_FILL_DEN: u64 = 3;

const KIND_LEAF: u8 = 0;
const KIND_INTERNAL: u8 = 1;

/// Tracks the pages a write batch staged and replaced, so that a commit can
/// defer-free the replaced ones and a rollback can recycle the staged ones.
#[derive(Default)]
pub struct WriteContext {
    staged: FxHashSet<PageId>,
    pub allocated: Vec<PageId>,
    pub freed: Vec<PageId>,
}

impl WriteContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the page to write `page`'s replacement into. A page staged
    /// earlier in the same batch is reused in place: no snapshot can see it
    /// yet.
    fn stage(&mut self, file: &PagedFile, page: PageId) -> Result<PageId, StorageError> {
        if page != NO_PAGE && self.staged.contains(&page) {
            return Ok(page);
        }
        let fresh = file.allocate()?;
        self.staged.insert(fresh);
        self.allocated.push(fresh);
        if page != NO_PAGE {
            self.freed.push(page);
        }
        Ok(fresh)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        keys: Vec<IndexKey>,
        payloads: Vec<IndexPayload>,
    },
    Internal {
        keys: Vec<IndexKey>,
        children: Vec<PageId>,
    },
}

enum InsertUpshot {
    Done(PageId),
    Split {
        left: PageId,
        separator: IndexKey,
        right: PageId,
    },
}

/// An ordered map from 28-byte keys to 24-byte payloads stored in one paged
/// file. The tree itself is stateless: every operation takes the root the
/// caller is working from.
#[derive(Clone)]
pub struct Btree {
    file: Arc<PagedFile>,
    name: &'static str,
}

impl Btree {
    pub fn new(file: Arc<PagedFile>, name: &'static str) -> Self {
        Self { file, name }
    }

    pub fn file(&self) -> &Arc<PagedFile> {
        &self.file
    }

    pub fn get(&self, root: PageId, key: &IndexKey) -> Result<Option<IndexPayload>, StorageError> {
        let mut page = root;
        loop {
            if page == NO_PAGE {
                return Ok(None);
            }
            match self.read_node(page)? {
                Node::Leaf { keys, payloads } => {
                    return Ok(keys
                        .binary_search(key)
                        .ok()
                        .map(|i| payloads[i]));
                }
                Node::Internal { keys, children } => {
                    page = children[keys.partition_point(|separator| separator <= key)];
                }
            }
        }
    }

    /// Inserts or replaces, returning the new root.
    pub fn insert(
        &self,
        root: PageId,
        key: &IndexKey,
        payload: &IndexPayload,
        ctx: &mut WriteContext,
    ) -> Result<PageId, StorageError> {
        if root == NO_PAGE {
            let page = ctx.stage(&self.file, NO_PAGE)?;
            self.write_node(
                page,
                &Node::Leaf {
                    keys: vec![*key],
                    payloads: vec![*payload],
                },
            )?;
            return Ok(page);
        }
        match self.insert_rec(root, key, payload, ctx)? {
            InsertUpshot::Done(page) => Ok(page),
            InsertUpshot::Split {
                left,
                separator,
                right,
            } => {
                let page = ctx.stage(&self.file, NO_PAGE)?;
                self.write_node(
                    page,
                    &Node::Internal {
                        keys: vec![separator],
                        children: vec![left, right],
                    },
                )?;
                Ok(page)
            }
        }
    }

    fn insert_rec(
        &self,
        page: PageId,
        key: &IndexKey,
        payload: &IndexPayload,
        ctx: &mut WriteContext,
    ) -> Result<InsertUpshot, StorageError> {
        match self.read_node(page)? {
            Node::Leaf {
                mut keys,
                mut payloads,
            } => {
                match keys.binary_search(key) {
                    Ok(i) => payloads[i] = *payload,
                    Err(i) => {
                        keys.insert(i, *key);
                        payloads.insert(i, *payload);
                    }
                }
                if keys.len() <= LEAF_CAPACITY {
                    let target = ctx.stage(&self.file, page)?;
                    self.write_node(target, &Node::Leaf { keys, payloads })?;
                    Ok(InsertUpshot::Done(target))
                } else {
                    let mid = keys.len() / 2;
                    let right_keys = keys.split_off(mid);
                    let right_payloads = payloads.split_off(mid);
                    let separator = right_keys[0];
                    let left = ctx.stage(&self.file, page)?;
                    self.write_node(left, &Node::Leaf { keys, payloads })?;
                    let right = ctx.stage(&self.file, NO_PAGE)?;
                    self.write_node(
                        right,
                        &Node::Leaf {
                            keys: right_keys,
                            payloads: right_payloads,
                        },
                    )?;
                    Ok(InsertUpshot::Split {
                        left,
                        separator,
                        right,
                    })
                }
            }
            Node::Internal {
                mut keys,
                mut children,
            } => {
                let i = keys.partition_point(|separator| separator <= key);
                match self.insert_rec(children[i], key, payload, ctx)? {
                    InsertUpshot::Done(child) => children[i] = child,
                    InsertUpshot::Split {
                        left,
                        separator,
                        right,
                    } => {
                        children[i] = left;
                        keys.insert(i, separator);
                        children.insert(i + 1, right);
                    }
                }
                if keys.len() <= INTERNAL_CAPACITY {
                    let target = ctx.stage(&self.file, page)?;
                    self.write_node(target, &Node::Internal { keys, children })?;
                    Ok(InsertUpshot::Done(target))
                } else {
                    let mid = keys.len() / 2;
                    let separator = keys[mid];
                    let right_keys = keys.split_off(mid + 1);
                    keys.pop();
                    let right_children = children.split_off(mid + 1);
                    let left = ctx.stage(&self.file, page)?;
                    self.write_node(left, &Node::Internal { keys, children })?;
                    let right = ctx.stage(&self.file, NO_PAGE)?;
                    self.write_node(
                        right,
                        &Node::Internal {
                            keys: right_keys,
                            children: right_children,
                        },
                    )?;
                    Ok(InsertUpshot::Split {
                        left,
                        separator,
                        right,
                    })
                }
            }
        }
    }

    /// Physically removes a key (pruning only). Underflowing nodes are not
    /// rebalanced: pruning rebuilds stores wholesale, a lopsided tree from
    /// scattered deletes stays correct and short-lived.
    pub fn remove(
        &self,
        root: PageId,
        key: &IndexKey,
        ctx: &mut WriteContext,
    ) -> Result<(PageId, bool), StorageError> {
        if root == NO_PAGE {
            return Ok((root, false));
        }
        let (page, removed) = self.remove_rec(root, key, ctx)?;
        Ok((page, removed))
    }

    fn remove_rec(
        &self,
        page: PageId,
        key: &IndexKey,
        ctx: &mut WriteContext,
    ) -> Result<(PageId, bool), StorageError> {
        match self.read_node(page)? {
            Node::Leaf {
                mut keys,
                mut payloads,
            } => {
                let Ok(i) = keys.binary_search(key) else {
                    return Ok((page, false));
                };
                keys.remove(i);
                payloads.remove(i);
                if keys.is_empty() {
                    ctx.freed.push(page);
                    return Ok((NO_PAGE, true));
                }
                let target = ctx.stage(&self.file, page)?;
                self.write_node(target, &Node::Leaf { keys, payloads })?;
                Ok((target, true))
            }
            Node::Internal {
                mut keys,
                mut children,
            } => {
                let i = keys.partition_point(|separator| separator <= key);
                let (child, removed) = self.remove_rec(children[i], key, ctx)?;
                if !removed {
                    return Ok((page, false));
                }
                if child == NO_PAGE {
                    children.remove(i);
                    if i == 0 {
                        if !keys.is_empty() {
                            keys.remove(0);
                        }
                    } else {
                        keys.remove(i - 1);
                    }
                    if children.len() == 1 {
                        ctx.freed.push(page);
                        return Ok((children[0], true));
                    }
                } else {
                    children[i] = child;
                }
                let target = ctx.stage(&self.file, page)?;
                self.write_node(target, &Node::Internal { keys, children })?;
                Ok((target, true))
            }
        }
    }

    /// An ordered scan of `[lower, upper)`; `None` upper scans to the end.
    pub fn scan(&self, root: PageId, lower: IndexKey, upper: Option<IndexKey>) -> RangeScan {
        RangeScan {
            tree: self.clone(),
            state: ScanState::Start { root, lower },
            upper,
            stack: Vec::new(),
            leaf_keys: Vec::new(),
            leaf_payloads: Vec::new(),
            leaf_at: 0,
        }
    }

    /// Builds a fresh tree bottom-up from an ordered entry stream and
    /// returns its root. Keys must be strictly increasing.
    pub fn bulk_load(
        &self,
        entries: impl IntoIterator<Item = (IndexKey, IndexPayload)>,
    ) -> Result<PageId, StorageError> {
        let mut level: Vec<(IndexKey, PageId)> = Vec::new();
        let mut keys: Vec<IndexKey> = Vec::with_capacity(LEAF_CAPACITY);
        let mut payloads: Vec<IndexPayload> = Vec::with_capacity(LEAF_CAPACITY);
        for (key, payload) in entries {
            keys.push(key);
            payloads.push(payload);
            if keys.len() == LEAF_CAPACITY {
                self.flush_leaf(&mut level, &mut keys, &mut payloads)?;
            }
        }
        if !keys.is_empty() {
            self.flush_leaf(&mut level, &mut keys, &mut payloads)?;
        }
        if level.is_empty() {
            return Ok(NO_PAGE);
        }
        while level.len() > 1 {
            let mut parents = Vec::new();
            for group in level.chunks(INTERNAL_CAPACITY + 1) {
                let page = self.file.allocate()?;
                self.write_node(
                    page,
                    &Node::Internal {
                        keys: group[1..].iter().map(|(k, _)| *k).collect(),
                        children: group.iter().map(|(_, p)| *p).collect(),
                    },
                )?;
                parents.push((group[0].0, page));
            }
            level = parents;
        }
        Ok(level[0].1)
    }

    fn flush_leaf(
        &self,
        level: &mut Vec<(IndexKey, PageId)>,
        keys: &mut Vec<IndexKey>,
        payloads: &mut Vec<IndexPayload>,
    ) -> Result<(), StorageError> {
        let page = self.file.allocate()?;
        let first = keys[0];
        self.write_node(
            page,
            &Node::Leaf {
                keys: std::mem::take(keys),
                payloads: std::mem::take(payloads),
            },
        )?;
        level.push((first, page));
        Ok(())
    }

    /// A cheap estimate of the number of entries in `[lower, upper)`. Walks
    /// the two boundary paths exactly and assumes average fill for the
    /// subtrees strictly inside the range.
    pub fn estimate_range(
        &self,
        root: PageId,
        lower: &IndexKey,
        upper: Option<&IndexKey>,
    ) -> Result<u64, StorageError> {
        if root == NO_PAGE {
            return Ok(0);
        }
        self.estimate_rec(root, lower, upper)
    }

    fn estimate_rec(
        &self,
        page: PageId,
        lower: &IndexKey,
        upper: Option<&IndexKey>,
    ) -> Result<u64, StorageError> {
        match self.read_node(page)? {
            Node::Leaf { keys, .. } => {
                let start = keys.partition_point(|k| k < lower);
                let end = upper.map_or(keys.len(), |u| keys.partition_point(|k| k < u));
                Ok((end.saturating_sub(start)) as u64)
            }
            Node::Internal { keys, children } => {
                let first = keys.partition_point(|separator| separator <= lower);
                let last = upper.map_or(children.len() - 1, |u| {
                    keys.partition_point(|separator| separator < u)
                });
                if first == last {
                    return self.estimate_rec(children[first], lower, upper);
                }
                let mut total = self.estimate_rec(children[first], lower, None)?;
                if last > first + 1 {
                    let depth = self.depth_below(children[first + 1])?;
                    total += (last - first - 1) as u64 * subtree_estimate(depth);
                }
                total += self.estimate_rec(children[last], &[0; KEY_LEN], upper)?;
                Ok(total)
            }
        }
    }

    /// Number of levels below (and including) the node: 1 for a leaf.
    fn depth_below(&self, page: PageId) -> Result<u64, StorageError> {
        match self.read_node(page)? {
            Node::Leaf { .. } => Ok(1),
            Node::Internal { children, .. } => Ok(1 + self.depth_below(children[0])?),
        }
    }

    fn read_node(&self, page: PageId) -> Result<Node, StorageError> {
        let bytes = self.file.read_page(page)?;
        let kind = bytes[0];
        let count = usize::from(u16::from_be_bytes(bytes[2..4].try_into().unwrap()));
        let stored_crc = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let used = match kind {
            KIND_LEAF => count * LEAF_ENTRY_LEN,
            KIND_INTERNAL => 8 + count * INTERNAL_ENTRY_LEN,
            _ => {
                return Err(CorruptionError::ChecksumMismatch(format!(
                    "{}: page {page} has node kind {kind}",
                    self.name
                ))
                .into())
            }
        };
        if NODE_HEADER_LEN + used > PAGE_SIZE
            || crc32fast::hash(&bytes[NODE_HEADER_LEN..NODE_HEADER_LEN + used]) != stored_crc
        {
            return Err(CorruptionError::ChecksumMismatch(format!(
                "{}: page {page}",
                self.name
            ))
            .into());
        }
        let body = &bytes[NODE_HEADER_LEN..];
        if kind == KIND_LEAF {
            let mut keys = Vec::with_capacity(count);
            let mut payloads = Vec::with_capacity(count);
            for i in 0..count {
                let at = i * LEAF_ENTRY_LEN;
                keys.push(body[at..at + KEY_LEN].try_into().unwrap());
                payloads.push(body[at + KEY_LEN..at + LEAF_ENTRY_LEN].try_into().unwrap());
            }
            Ok(Node::Leaf { keys, payloads })
        } else {
            let mut keys = Vec::with_capacity(count);
            let mut children = Vec::with_capacity(count + 1);
            children.push(u64::from_be_bytes(body[0..8].try_into().unwrap()));
            for i in 0..count {
                let at = 8 + i * INTERNAL_ENTRY_LEN;
                keys.push(body[at..at + KEY_LEN].try_into().unwrap());
                children.push(u64::from_be_bytes(
                    body[at + KEY_LEN..at + INTERNAL_ENTRY_LEN].try_into().unwrap(),
                ));
            }
            Ok(Node::Internal { keys, children })
        }
    }

    fn write_node(&self, page: PageId, node: &Node) -> Result<(), StorageError> {
        let mut bytes = [0_u8; PAGE_SIZE];
        let used = match node {
            Node::Leaf { keys, payloads } => {
                debug_assert!(keys.len() <= LEAF_CAPACITY);
                bytes[0] = KIND_LEAF;
                bytes[2..4].copy_from_slice(&u16::try_from(keys.len()).unwrap().to_be_bytes());
                for (i, (key, payload)) in keys.iter().zip(payloads).enumerate() {
                    let at = NODE_HEADER_LEN + i * LEAF_ENTRY_LEN;
                    bytes[at..at + KEY_LEN].copy_from_slice(key);
                    bytes[at + KEY_LEN..at + LEAF_ENTRY_LEN].copy_from_slice(payload);
                }
                keys.len() * LEAF_ENTRY_LEN
            }
            Node::Internal { keys, children } => {
                debug_assert!(keys.len() <= INTERNAL_CAPACITY);
                debug_assert_eq!(children.len(), keys.len() + 1);
                bytes[0] = KIND_INTERNAL;
                bytes[2..4].copy_from_slice(&u16::try_from(keys.len()).unwrap().to_be_bytes());
                bytes[NODE_HEADER_LEN..NODE_HEADER_LEN + 8]
                    .copy_from_slice(&children[0].to_be_bytes());
                for (i, (key, child)) in keys.iter().zip(&children[1..]).enumerate() {
                    let at = NODE_HEADER_LEN + 8 + i * INTERNAL_ENTRY_LEN;
                    bytes[at..at + KEY_LEN].copy_from_slice(key);
                    bytes[at + KEY_LEN..at + INTERNAL_ENTRY_LEN]
                        .copy_from_slice(&child.to_be_bytes());
                }
                8 + keys.len() * INTERNAL_ENTRY_LEN
            }
        };
        let crc = crc32fast::hash(&bytes[NODE_HEADER_LEN..NODE_HEADER_LEN + used]);
        bytes[4..8].copy_from_slice(&crc.to_be_bytes());
        self.file.write_page(page, &bytes)
    }
}

enum ScanState {
    Start { root: PageId, lower: IndexKey },
    Running,
    Finished,
}

/// An ordered, restartable cursor over a key range. Reads pages lazily;
/// dropping it releases nothing but memory.
pub struct RangeScan {
    tree: Btree,
    state: ScanState,
    upper: Option<IndexKey>,
    // (page, next child index) path from the root, leaf excluded
    stack: Vec<(PageId, usize)>,
    leaf_keys: Vec<IndexKey>,
    leaf_payloads: Vec<IndexPayload>,
    leaf_at: usize,
}

impl RangeScan {
    fn descend(&mut self, mut page: PageId, lower: &IndexKey) -> Result<bool, StorageError> {
        loop {
            match self.tree.read_node(page)? {
                Node::Leaf { keys, payloads } => {
                    self.leaf_at = keys.partition_point(|k| k < lower);
                    self.leaf_keys = keys;
                    self.leaf_payloads = payloads;
                    return Ok(true);
                }
                Node::Internal { keys, children } => {
                    let i = keys.partition_point(|separator| separator <= lower);
                    self.stack.push((page, i + 1));
                    page = children[i];
                }
            }
        }
    }

    /// Moves to the leftmost leaf of the next unvisited subtree.
    fn advance_leaf(&mut self) -> Result<bool, StorageError> {
        while let Some((page, next_child)) = self.stack.pop() {
            let Node::Internal { children, .. } = self.tree.read_node(page)? else {
                return Err(CorruptionError::msg("leaf on the cursor spine").into());
            };
            if next_child < children.len() {
                self.stack.push((page, next_child + 1));
                return self.descend_leftmost(children[next_child]);
            }
        }
        Ok(false)
    }

    fn descend_leftmost(&mut self, mut page: PageId) -> Result<bool, StorageError> {
        loop {
            match self.tree.read_node(page)? {
                Node::Leaf { keys, payloads } => {
                    self.leaf_at = 0;
                    self.leaf_keys = keys;
                    self.leaf_payloads = payloads;
                    return Ok(true);
                }
                Node::Internal { children, .. } => {
                    self.stack.push((page, 1));
                    page = children[0];
                }
            }
        }
    }

    fn step(&mut self) -> Result<Option<(IndexKey, IndexPayload)>, StorageError> {
        match std::mem::replace(&mut self.state, ScanState::Running) {
            ScanState::Start { root, lower } => {
                if root == NO_PAGE || !self.descend(root, &lower)? {
                    self.state = ScanState::Finished;
                    return Ok(None);
                }
            }
            ScanState::Running => {}
            ScanState::Finished => {
                self.state = ScanState::Finished;
                return Ok(None);
            }
        }
        loop {
            if self.leaf_at < self.leaf_keys.len() {
                let key = self.leaf_keys[self.leaf_at];
                if self.upper.is_some_and(|upper| key >= upper) {
                    self.state = ScanState::Finished;
                    return Ok(None);
                }
                let payload = self.leaf_payloads[self.leaf_at];
                self.leaf_at += 1;
                return Ok(Some((key, payload)));
            }
            if !self.advance_leaf()? {
                self.state = ScanState::Finished;
                return Ok(None);
            }
        }
    }
}

impl Iterator for RangeScan {
    type Item = Result<(IndexKey, IndexPayload), StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.state = ScanState::Finished;
                Some(Err(e))
            }
        }
    }
}

fn subtree_estimate(depth: u64) -> u64 {
    let mut total = LEAF_CAPACITY as u64 * ESTIMATED_FILL_NUM / ESTIMATED_FILL_DEN;
    for _ in 1..depth {
        total = total
            .saturating_mul(INTERNAL_CAPACITY as u64 * ESTIMATED_FILL_NUM / ESTIMATED_FILL_DEN);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> (tempfile::TempDir, Btree) {
        let dir = tempfile::tempdir().unwrap();
        let file = PagedFile::open(&dir.path().join("t.idx"), 0xbeef).unwrap();
        (dir, Btree::new(Arc::new(file), "t.idx"))
    }

    fn key(n: u64) -> IndexKey {
        let mut k = [0_u8; KEY_LEN];
        k[20..28].copy_from_slice(&n.to_be_bytes());
        k
    }

    fn payload(n: u64) -> IndexPayload {
        let mut p = [0_u8; PAYLOAD_LEN];
        p[16..24].copy_from_slice(&n.to_be_bytes());
        p
    }

    #[test]
    fn insert_get_replace() {
        let (_dir, tree) = tree();
        let mut ctx = WriteContext::new();
        let mut root = NO_PAGE;
        root = tree.insert(root, &key(1), &payload(1), &mut ctx).unwrap();
        root = tree.insert(root, &key(2), &payload(2), &mut ctx).unwrap();
        assert_eq!(tree.get(root, &key(1)).unwrap(), Some(payload(1)));
        assert_eq!(tree.get(root, &key(3)).unwrap(), None);
        root = tree.insert(root, &key(1), &payload(9), &mut ctx).unwrap();
        assert_eq!(tree.get(root, &key(1)).unwrap(), Some(payload(9)));
    }

    #[test]
    fn splits_keep_order() {
        let (_dir, tree) = tree();
        let mut ctx = WriteContext::new();
        let mut root = NO_PAGE;
        // Enough to split leaves and internals, inserted out of order.
        let n = 10_000_u64;
        for i in 0..n {
            let shuffled = (i * 7919) % n;
            root = tree
                .insert(root, &key(shuffled), &payload(shuffled), &mut ctx)
                .unwrap();
        }
        let entries: Vec<_> = tree
            .scan(root, [0; KEY_LEN], None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), n as usize);
        for (i, (k, p)) in entries.iter().enumerate() {
            assert_eq!(*k, key(i as u64));
            assert_eq!(*p, payload(i as u64));
        }
    }

    #[test]
    fn range_scan_bounds() {
        let (_dir, tree) = tree();
        let mut ctx = WriteContext::new();
        let mut root = NO_PAGE;
        for i in 0..500_u64 {
            root = tree.insert(root, &key(i), &payload(i), &mut ctx).unwrap();
        }
        let got: Vec<_> = tree
            .scan(root, key(100), Some(key(110)))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(got.len(), 10);
        assert_eq!(got[0].0, key(100));
        assert_eq!(got[9].0, key(109));
    }

    #[test]
    fn old_root_is_isolated_from_later_writes() {
        let (_dir, tree) = tree();
        let mut ctx = WriteContext::new();
        let mut root = NO_PAGE;
        for i in 0..200_u64 {
            root = tree.insert(root, &key(i), &payload(i), &mut ctx).unwrap();
        }
        let snapshot = root;
        let mut ctx2 = WriteContext::new();
        let new_root = tree.insert(snapshot, &key(1000), &payload(1000), &mut ctx2).unwrap();
        assert_eq!(tree.get(snapshot, &key(1000)).unwrap(), None);
        assert_eq!(tree.get(new_root, &key(1000)).unwrap(), Some(payload(1000)));
        assert_eq!(tree.get(new_root, &key(7)).unwrap(), Some(payload(7)));
    }

    #[test]
    fn remove_deletes_physically() {
        let (_dir, tree) = tree();
        let mut ctx = WriteContext::new();
        let mut root = NO_PAGE;
        for i in 0..300_u64 {
            root = tree.insert(root, &key(i), &payload(i), &mut ctx).unwrap();
        }
        let (new_root, removed) = tree.remove(root, &key(150), &mut ctx).unwrap();
        assert!(removed);
        assert_eq!(tree.get(new_root, &key(150)).unwrap(), None);
        assert_eq!(tree.get(new_root, &key(151)).unwrap(), Some(payload(151)));
        let (_, removed_again) = tree.remove(new_root, &key(150), &mut ctx).unwrap();
        assert!(!removed_again);
    }

    #[test]
    fn bulk_load_matches_incremental() {
        let (_dir, tree) = tree();
        let root = tree
            .bulk_load((0..5000_u64).map(|i| (key(i), payload(i))))
            .unwrap();
        assert_eq!(tree.get(root, &key(0)).unwrap(), Some(payload(0)));
        assert_eq!(tree.get(root, &key(4999)).unwrap(), Some(payload(4999)));
        let all: Vec<_> = tree
            .scan(root, [0; KEY_LEN], None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(all.len(), 5000);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn estimate_is_in_the_right_ballpark() {
        let (_dir, tree) = tree();
        let root = tree
            .bulk_load((0..20_000_u64).map(|i| (key(i), payload(i))))
            .unwrap();
        let estimate = tree
            .estimate_range(root, &key(5000), Some(&key(15_000)))
            .unwrap();
        assert!(estimate > 2_000, "estimate {estimate} too small");
        assert!(estimate < 50_000, "estimate {estimate} too large");
    }

    #[test]
    fn empty_tree_scans_empty() {
        let (_dir, tree) = tree();
        assert_eq!(tree.scan(NO_PAGE, [0; KEY_LEN], None).count(), 0);
        assert_eq!(tree.get(NO_PAGE, &key(1)).unwrap(), None);
    }
}
