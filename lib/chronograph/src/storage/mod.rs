//! Low level storage: the atom dictionary, the four quad indexes, the
//! write-ahead log and the transaction coordinator.
//!
//! One writer at a time holds the writer lock and mutates copy-on-write
//! shadow pages; readers clone the published snapshot (tree roots plus the
//! durable transaction id) and never block. Pages replaced by a commit are
//! recycled once the last snapshot that could reach them is gone.

use crate::storage::atoms::{AtomId, AtomKind, AtomStore};
use crate::storage::binary_encoder::{
    encode_payload, prefix_bounds, scan_prefix, EncodedQuad, IndexKey, QuadEncoding, KEY_LEN,
};
use crate::storage::btree::{Btree, RangeScan, WriteContext};
pub use crate::storage::error::{CorruptionError, StorageError};
use crate::storage::paging::{PageId, PagedFile};
use crate::storage::wal::{Wal, WalOp, WalOpKind, WalRecord};
use crate::temporal::{Interval, TemporalFilter, Timestamp};
use oxrdf::vocab::xsd;
use oxrdf::{BlankNode, GraphNameRef, Literal, NamedNode, QuadRef, Term, TermRef};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

pub mod atoms;
pub mod binary_encoder;
mod btree;
mod error;
mod paging;
mod wal;

const STORE_MAGIC: u64 = 0x6368_726f_6e6f_5331; // "chronoS1"
const FORMAT_VERSION: u32 = 1;

const GSPO_MAGIC: u64 = 0x6368_7269_6478_0001;
const GPOS_MAGIC: u64 = 0x6368_7269_6478_0002;
const GOSP_MAGIC: u64 = 0x6368_7269_6478_0003;
const TGSPO_MAGIC: u64 = 0x6368_7269_6478_0004;

/// Checkpoint after this many commits...
const CHECKPOINT_COMMITS: u64 = 64;
/// ...or once the WAL grows past this many bytes.
const CHECKPOINT_WAL_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub(crate) enum TreeId {
    Gspo,
    Gpos,
    Gosp,
    Tgspo,
}

/// The four index roots a snapshot pins.
#[derive(Debug, Clone, Copy)]
pub struct IndexRoots {
    pub gspo: PageId,
    pub gpos: PageId,
    pub gosp: PageId,
    pub tgspo: PageId,
}

pub(crate) struct Snapshot {
    pub roots: IndexRoots,
    pub durable_tx: u64,
    pub version: u64,
}

struct WriterState {
    wal: Wal,
    next_tx: u64,
    commits_since_checkpoint: u64,
}

#[derive(Default)]
struct SnapshotTracker {
    /// version → number of live readers pinned on it.
    active: BTreeMap<u64, usize>,
    /// Pages replaced when producing `version`, awaiting reclamation.
    pending: Vec<(u64, TreeId, PageId)>,
}

struct StorageInner {
    path: PathBuf,
    #[allow(dead_code)]
    lock: StoreLock,
    header: Mutex<StoreHeader>,
    atoms: AtomStore,
    gspo: Btree,
    gpos: Btree,
    gosp: Btree,
    tgspo: Btree,
    current: RwLock<Arc<Snapshot>>,
    snapshots: Mutex<SnapshotTracker>,
    writer: Mutex<WriterState>,
    read_only: AtomicBool,
}

/// Low level storage primitives.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Opens the store directory, creating it if needed, and replays the
    /// write-ahead log.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path)?;
        let lock = StoreLock::acquire(&path.join("header.page"))?;
        let (header, durable_tx) = StoreHeader::open(&path.join("header.page"))?;
        let atoms = AtomStore::open(path)?;
        let gspo = Btree::new(
            Arc::new(PagedFile::open(&path.join("idx.gspo"), GSPO_MAGIC)?),
            "idx.gspo",
        );
        let gpos = Btree::new(
            Arc::new(PagedFile::open(&path.join("idx.gpos"), GPOS_MAGIC)?),
            "idx.gpos",
        );
        let gosp = Btree::new(
            Arc::new(PagedFile::open(&path.join("idx.gosp"), GOSP_MAGIC)?),
            "idx.gosp",
        );
        let tgspo = Btree::new(
            Arc::new(PagedFile::open(&path.join("idx.tgspo"), TGSPO_MAGIC)?),
            "idx.tgspo",
        );
        let mut roots = IndexRoots {
            gspo: gspo.file().header_state().root_page,
            gpos: gpos.file().header_state().root_page,
            gosp: gosp.file().header_state().root_page,
            tgspo: tgspo.file().header_state().root_page,
        };

        let mut wal = Wal::open(&path.join("wal.log"))?;
        let mut max_tx = durable_tx;
        let mut ctx = [
            WriteContext::new(),
            WriteContext::new(),
            WriteContext::new(),
            WriteContext::new(),
        ];
        let replayed = {
            let trees = [&gspo, &gpos, &gosp, &tgspo];
            wal.replay(durable_tx, |record| {
                for op in &record.ops {
                    let quad = EncodedQuad {
                        graph: AtomId::from_word(op.graph),
                        subject: AtomId::from_word(op.subject),
                        predicate: AtomId::from_word(op.predicate),
                        object: AtomId::from_word(op.object),
                        validity: Interval {
                            start: op.valid_from,
                            end: op.valid_to,
                        },
                        tx: record.tx_id,
                    };
                    for (i, (tree, encoding)) in trees
                        .iter()
                        .zip([
                            QuadEncoding::Gspo,
                            QuadEncoding::Gpos,
                            QuadEncoding::Gosp,
                            QuadEncoding::Tgspo,
                        ])
                        .enumerate()
                    {
                        let root = match i {
                            0 => roots.gspo,
                            1 => roots.gpos,
                            2 => roots.gosp,
                            _ => roots.tgspo,
                        };
                        let key = encoding.encode_key(&quad);
                        let new_root =
                            tree.insert(root, &key, &encode_payload(&quad), &mut ctx[i])?;
                        match i {
                            0 => roots.gspo = new_root,
                            1 => roots.gpos = new_root,
                            2 => roots.gosp = new_root,
                            _ => roots.tgspo = new_root,
                        }
                    }
                }
                max_tx = max_tx.max(record.tx_id);
                Ok(())
            })?
        };

        let inner = Arc::new(StorageInner {
            path: path.to_path_buf(),
            lock,
            header: Mutex::new(header),
            atoms,
            gspo,
            gpos,
            gosp,
            tgspo,
            current: RwLock::new(Arc::new(Snapshot {
                roots,
                durable_tx: max_tx,
                version: max_tx,
            })),
            snapshots: Mutex::new(SnapshotTracker::default()),
            writer: Mutex::new(WriterState {
                wal,
                next_tx: max_tx + 1,
                commits_since_checkpoint: 0,
            }),
            read_only: AtomicBool::new(false),
        });
        let storage = Self { inner };
        if replayed > 0 {
            // The replay rebuilt state the header does not describe yet.
            let mut writer = storage.inner.writer.lock().unwrap();
            storage.checkpoint_locked(&mut writer, max_tx)?;
        }
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Takes a consistent read snapshot.
    pub fn snapshot(&self) -> StorageReader {
        let snapshot = Arc::clone(&self.inner.current.read().unwrap());
        self.inner.register_snapshot(snapshot.version);
        StorageReader {
            storage: Arc::clone(&self.inner),
            snapshot,
            registered: true,
        }
    }

    /// Acquires the writer lock and starts a batch.
    pub fn start_transaction(&self) -> Result<StorageTransaction<'_>, StorageError> {
        if self.inner.read_only.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly);
        }
        let writer = self.inner.writer.lock().unwrap();
        let current = self.inner.current.read().unwrap();
        let roots = current.roots;
        let base_version = current.version;
        drop(current);
        let tx_id = writer.next_tx;
        Ok(StorageTransaction {
            storage: &self.inner,
            outer: self,
            writer,
            roots,
            base_version,
            tx_id,
            ops: Vec::new(),
            ctx: TreeContexts::default(),
        })
    }

    /// Runs a write batch through a closure: commit on `Ok`, rollback on
    /// `Err`.
    pub fn transaction<T, E: From<StorageError>>(
        &self,
        f: impl FnOnce(&mut StorageTransaction<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut transaction = self.start_transaction()?;
        match f(&mut transaction) {
            Ok(result) => {
                transaction.commit()?;
                Ok(result)
            }
            Err(e) => {
                transaction.rollback()?;
                Err(e)
            }
        }
    }

    /// Flushes dirty pages, persists the headers and truncates the WAL.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let mut writer = self.inner.writer.lock().unwrap();
        let durable = self.inner.current.read().unwrap().durable_tx;
        self.checkpoint_locked(&mut writer, durable)
    }

    fn checkpoint_locked(
        &self,
        writer: &mut WriterState,
        durable_tx: u64,
    ) -> Result<(), StorageError> {
        let roots = self.inner.current.read().unwrap().roots;
        for (tree, root) in [
            (&self.inner.gspo, roots.gspo),
            (&self.inner.gpos, roots.gpos),
            (&self.inner.gosp, roots.gosp),
            (&self.inner.tgspo, roots.tgspo),
        ] {
            tree.file().set_root_page(root);
            tree.file().set_durable_tx(durable_tx);
            tree.file().checkpoint()?;
        }
        self.inner.atoms.flush()?;
        self.inner.header.lock().unwrap().write(durable_tx)?;
        writer.wal.truncate()?;
        writer.commits_since_checkpoint = 0;
        Ok(())
    }
}

impl StorageInner {
    fn tree(&self, id: TreeId) -> &Btree {
        match id {
            TreeId::Gspo => &self.gspo,
            TreeId::Gpos => &self.gpos,
            TreeId::Gosp => &self.gosp,
            TreeId::Tgspo => &self.tgspo,
        }
    }

    fn register_snapshot(&self, version: u64) {
        *self
            .snapshots
            .lock()
            .unwrap()
            .active
            .entry(version)
            .or_insert(0) += 1;
    }

    fn unregister_snapshot(&self, version: u64) {
        let mut tracker = self.snapshots.lock().unwrap();
        if let Some(count) = tracker.active.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                tracker.active.remove(&version);
            }
        }
        self.release_pending(&mut tracker);
    }

    /// Returns replaced pages to the free lists once every snapshot that
    /// could reference them is gone.
    fn release_pending(&self, tracker: &mut SnapshotTracker) {
        let min_active = tracker.active.keys().next().copied();
        let mut kept = Vec::new();
        for (version, tree, page) in tracker.pending.drain(..) {
            let releasable = min_active.is_none_or(|min| min >= version);
            if releasable {
                // A failed free leaks the page until the next prune, which
                // is preferable to failing a reader drop.
                let _ = self.tree(tree).file().free_page(page);
            } else {
                kept.push((version, tree, page));
            }
        }
        tracker.pending = kept;
    }

    fn poison(&self, error: &StorageError) {
        if matches!(error, StorageError::Corruption(_)) {
            self.read_only.store(true, Ordering::Release);
        }
    }

    /// Interns a term, creating atoms as needed.
    pub(crate) fn insert_term(&self, term: TermRef<'_>) -> Result<AtomId, StorageError> {
        match term {
            TermRef::NamedNode(node) => {
                self.atoms
                    .intern(AtomKind::NamedNode, node.as_str().as_bytes(), None, None)
            }
            TermRef::BlankNode(node) => {
                self.atoms
                    .intern(AtomKind::BlankNode, node.as_str().as_bytes(), None, None)
            }
            TermRef::Literal(literal) => {
                if let Some(language) = literal.language() {
                    self.atoms.intern(
                        AtomKind::Literal,
                        literal.value().as_bytes(),
                        None,
                        Some(language),
                    )
                } else {
                    let datatype = literal.datatype();
                    let datatype = if datatype == xsd::STRING {
                        None
                    } else {
                        Some(self.atoms.intern(
                            AtomKind::NamedNode,
                            datatype.as_str().as_bytes(),
                            None,
                            None,
                        )?)
                    };
                    self.atoms
                        .intern(AtomKind::Literal, literal.value().as_bytes(), datatype, None)
                }
            }
        }
    }

    /// Looks a term up without interning; `None` means it cannot occur in
    /// any stored quad.
    pub(crate) fn lookup_term(&self, term: TermRef<'_>) -> Result<Option<AtomId>, StorageError> {
        match term {
            TermRef::NamedNode(node) => {
                self.atoms
                    .lookup(AtomKind::NamedNode, node.as_str().as_bytes(), None, None)
            }
            TermRef::BlankNode(node) => {
                self.atoms
                    .lookup(AtomKind::BlankNode, node.as_str().as_bytes(), None, None)
            }
            TermRef::Literal(literal) => {
                if let Some(language) = literal.language() {
                    self.atoms.lookup(
                        AtomKind::Literal,
                        literal.value().as_bytes(),
                        None,
                        Some(language),
                    )
                } else {
                    let datatype = literal.datatype();
                    let datatype = if datatype == xsd::STRING {
                        None
                    } else {
                        match self.atoms.lookup(
                            AtomKind::NamedNode,
                            datatype.as_str().as_bytes(),
                            None,
                            None,
                        )? {
                            Some(id) => Some(id),
                            None => return Ok(None),
                        }
                    };
                    self.atoms
                        .lookup(AtomKind::Literal, literal.value().as_bytes(), datatype, None)
                }
            }
        }
    }

    pub(crate) fn lookup_graph_name(
        &self,
        graph_name: GraphNameRef<'_>,
    ) -> Result<Option<AtomId>, StorageError> {
        match graph_name {
            GraphNameRef::DefaultGraph => Ok(Some(AtomId::DEFAULT_GRAPH)),
            GraphNameRef::NamedNode(node) => self.lookup_term(node.into()),
            GraphNameRef::BlankNode(node) => self.lookup_term(node.into()),
        }
    }

    /// Decodes a stored atom back into a term.
    pub(crate) fn decode_term(&self, atom: AtomId) -> Result<Term, StorageError> {
        let record = self.atoms.resolve(atom.counter())?;
        let text = String::from_utf8(record.value).map_err(|_| {
            StorageError::from(CorruptionError::CorruptAtomIndex(
                "atom value is not UTF-8".into(),
            ))
        })?;
        Ok(match record.kind {
            AtomKind::NamedNode => NamedNode::new_unchecked(text).into(),
            AtomKind::BlankNode => BlankNode::new_unchecked(text).into(),
            AtomKind::Literal => {
                if let Some(language) = record.language {
                    Literal::new_language_tagged_literal_unchecked(text, language).into()
                } else if let Some(datatype) = record.datatype {
                    let datatype_record = self.atoms.resolve(datatype.counter())?;
                    let datatype_iri =
                        String::from_utf8(datatype_record.value).map_err(|_| {
                            StorageError::from(CorruptionError::CorruptAtomIndex(
                                "datatype IRI is not UTF-8".into(),
                            ))
                        })?;
                    Literal::new_typed_literal(text, NamedNode::new_unchecked(datatype_iri)).into()
                } else {
                    Literal::new_simple_literal(text).into()
                }
            }
            AtomKind::Local => {
                return Err(CorruptionError::CorruptAtomIndex(
                    "query-local atom id found in the dictionary".into(),
                )
                .into())
            }
        })
    }
}

/// A consistent read view: index roots plus the durable transaction id at
/// snapshot time. Dropping it releases its pin on replaced pages.
pub struct StorageReader {
    storage: Arc<StorageInner>,
    snapshot: Arc<Snapshot>,
    registered: bool,
}

impl Clone for StorageReader {
    fn clone(&self) -> Self {
        if self.registered {
            self.storage.register_snapshot(self.snapshot.version);
        }
        Self {
            storage: Arc::clone(&self.storage),
            snapshot: Arc::clone(&self.snapshot),
            registered: self.registered,
        }
    }
}

impl Drop for StorageReader {
    fn drop(&mut self) {
        if self.registered {
            self.storage.unregister_snapshot(self.snapshot.version);
        }
    }
}

impl StorageReader {
    /// The transaction id this snapshot observes; later commits are
    /// invisible.
    pub fn durable_tx(&self) -> u64 {
        self.snapshot.durable_tx
    }

    /// Index scan for a quad pattern. The index is picked from the bound
    /// positions; bound positions past the usable prefix and the temporal
    /// filter are applied to every decoded entry.
    pub fn quads_for_pattern(
        &self,
        subject: Option<AtomId>,
        predicate: Option<AtomId>,
        object: Option<AtomId>,
        graph: Option<AtomId>,
        filter: TemporalFilter,
    ) -> DecodingQuadIterator {
        let (encoding, in_order) = match (subject, predicate, object) {
            (Some(_), Some(_), _) => (
                QuadEncoding::Gspo,
                [graph, subject, predicate, object],
            ),
            (Some(_), None, Some(_)) => (QuadEncoding::Gosp, [graph, object, subject, None]),
            (Some(_), None, None) => (QuadEncoding::Gspo, [graph, subject, None, None]),
            (None, Some(_), _) => (QuadEncoding::Gpos, [graph, predicate, object, None]),
            (None, None, Some(_)) => (QuadEncoding::Gosp, [graph, object, None, None]),
            (None, None, None) => (QuadEncoding::Gspo, [graph, None, None, None]),
        };
        let prefix = scan_prefix(&in_order);
        self.scan_index(encoding, &prefix, subject, predicate, object, graph, filter)
    }

    /// Every quad in transaction-time order (TGSPO); the deterministic
    /// enumeration used by evolution scans and the pruning transfer.
    pub fn quads_in_tx_order(&self, filter: TemporalFilter) -> DecodingQuadIterator {
        self.scan_index(QuadEncoding::Tgspo, &[], None, None, None, None, filter)
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_index(
        &self,
        encoding: QuadEncoding,
        prefix: &[u8],
        subject: Option<AtomId>,
        predicate: Option<AtomId>,
        object: Option<AtomId>,
        graph: Option<AtomId>,
        filter: TemporalFilter,
    ) -> DecodingQuadIterator {
        let (tree, root) = match encoding {
            QuadEncoding::Gspo => (&self.storage.gspo, self.snapshot.roots.gspo),
            QuadEncoding::Gpos => (&self.storage.gpos, self.snapshot.roots.gpos),
            QuadEncoding::Gosp => (&self.storage.gosp, self.snapshot.roots.gosp),
            QuadEncoding::Tgspo => (&self.storage.tgspo, self.snapshot.roots.tgspo),
        };
        let (lower, upper) = prefix_bounds(prefix);
        DecodingQuadIterator {
            scan: tree.scan(root, lower, upper),
            encoding,
            reader: self.clone(),
            subject,
            predicate,
            object,
            graph,
            filter,
        }
    }

    /// Estimated number of index entries matching the pattern; drives join
    /// ordering in the planner.
    pub fn estimate_pattern(
        &self,
        subject: Option<AtomId>,
        predicate: Option<AtomId>,
        object: Option<AtomId>,
        graph: Option<AtomId>,
    ) -> Result<u64, StorageError> {
        let (tree, root, in_order) = match (subject, predicate, object) {
            (Some(_), Some(_), _) => (
                &self.storage.gspo,
                self.snapshot.roots.gspo,
                [graph, subject, predicate, object],
            ),
            (Some(_), None, Some(_)) => (
                &self.storage.gosp,
                self.snapshot.roots.gosp,
                [graph, object, subject, None],
            ),
            (Some(_), None, None) => (
                &self.storage.gspo,
                self.snapshot.roots.gspo,
                [graph, subject, None, None],
            ),
            (None, Some(_), _) => (
                &self.storage.gpos,
                self.snapshot.roots.gpos,
                [graph, predicate, object, None],
            ),
            (None, None, Some(_)) => (
                &self.storage.gosp,
                self.snapshot.roots.gosp,
                [graph, object, None, None],
            ),
            (None, None, None) => (
                &self.storage.gspo,
                self.snapshot.roots.gspo,
                [graph, None, None, None],
            ),
        };
        let prefix = scan_prefix(&in_order);
        let (lower, upper) = prefix_bounds(&prefix);
        tree.estimate_range(root, &lower, upper.as_ref())
    }

    /// The named graphs: every distinct non-default graph position with at
    /// least one quad, whatever its validity.
    pub fn named_graphs(&self) -> DecodingGraphIterator {
        DecodingGraphIterator {
            reader: self.clone(),
            after: None,
            done: false,
        }
    }

    pub fn contains_named_graph(&self, graph: AtomId) -> Result<bool, StorageError> {
        let prefix = scan_prefix(&[Some(graph)]);
        let (lower, upper) = prefix_bounds(&prefix);
        Ok(self
            .storage
            .gspo
            .scan(self.snapshot.roots.gspo, lower, upper)
            .next()
            .transpose()?
            .is_some())
    }

    pub fn len(&self, filter: TemporalFilter) -> Result<usize, StorageError> {
        let mut count = 0;
        for quad in self.quads_for_pattern(None, None, None, None, filter) {
            quad?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self
            .quads_for_pattern(None, None, None, None, TemporalFilter::All)
            .next()
            .transpose()?
            .is_none())
    }

    pub fn contains(
        &self,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
        graph: AtomId,
        filter: TemporalFilter,
    ) -> Result<bool, StorageError> {
        Ok(self
            .quads_for_pattern(
                Some(subject),
                Some(predicate),
                Some(object),
                Some(graph),
                filter,
            )
            .next()
            .transpose()?
            .is_some())
    }

    pub(crate) fn decode_term(&self, atom: AtomId) -> Result<Term, StorageError> {
        self.storage.decode_term(atom)
    }

    pub(crate) fn lookup_term(&self, term: TermRef<'_>) -> Result<Option<AtomId>, StorageError> {
        self.storage.lookup_term(term)
    }

    pub(crate) fn lookup_graph_name(
        &self,
        graph_name: GraphNameRef<'_>,
    ) -> Result<Option<AtomId>, StorageError> {
        self.storage.lookup_graph_name(graph_name)
    }

    /// Validates the cross-index invariant: every GSPO entry appears in the
    /// three other permutations with an identical payload, and all four
    /// trees hold the same number of entries.
    pub fn validate(&self) -> Result<(), StorageError> {
        let mut gspo_count = 0_u64;
        for quad in self.quads_for_pattern(None, None, None, None, TemporalFilter::All) {
            let quad = quad?;
            gspo_count += 1;
            for (tree, root, encoding) in [
                (&self.storage.gpos, self.snapshot.roots.gpos, QuadEncoding::Gpos),
                (&self.storage.gosp, self.snapshot.roots.gosp, QuadEncoding::Gosp),
                (
                    &self.storage.tgspo,
                    self.snapshot.roots.tgspo,
                    QuadEncoding::Tgspo,
                ),
            ] {
                let key = encoding.encode_key(&quad);
                if tree.get(root, &key)? != Some(encode_payload(&quad)) {
                    return Err(CorruptionError::msg(format!(
                        "quad missing or inconsistent in a secondary index: {quad:?}"
                    ))
                    .into());
                }
            }
        }
        for (tree, root) in [
            (&self.storage.gpos, self.snapshot.roots.gpos),
            (&self.storage.gosp, self.snapshot.roots.gosp),
            (&self.storage.tgspo, self.snapshot.roots.tgspo),
        ] {
            let count = tree
                .scan(root, [0; KEY_LEN], None)
                .try_fold(0_u64, |n, entry| entry.map(|_| n + 1))?;
            if count != gspo_count {
                return Err(CorruptionError::msg(format!(
                    "index sizes diverge: GSPO has {gspo_count}, a secondary has {count}"
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// A lazy quad scan decoding index entries and applying the residual
/// position and temporal filters.
pub struct DecodingQuadIterator {
    scan: RangeScan,
    encoding: QuadEncoding,
    reader: StorageReader,
    subject: Option<AtomId>,
    predicate: Option<AtomId>,
    object: Option<AtomId>,
    graph: Option<AtomId>,
    filter: TemporalFilter,
}

impl Iterator for DecodingQuadIterator {
    type Item = Result<EncodedQuad, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.scan.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.reader.storage.poison(&e);
                    return Some(Err(e));
                }
            };
            let quad = match self
                .encoding
                .decode(&entry.0, &entry.1, &self.reader.storage.atoms)
            {
                Ok(quad) => quad,
                Err(e) => {
                    self.reader.storage.poison(&e);
                    return Some(Err(e));
                }
            };
            if self.subject.is_some_and(|s| quad.subject != s)
                || self.predicate.is_some_and(|p| quad.predicate != p)
                || self.object.is_some_and(|o| quad.object != o)
                || self.graph.is_some_and(|g| quad.graph != g)
                || !self.filter.matches(&quad.validity)
            {
                continue;
            }
            return Some(Ok(quad));
        }
    }
}

/// Iterates the distinct graph positions of GSPO by re-seeking past each
/// graph prefix; the default graph is skipped.
pub struct DecodingGraphIterator {
    reader: StorageReader,
    after: Option<IndexKey>,
    done: bool,
}

impl Iterator for DecodingGraphIterator {
    type Item = Result<AtomId, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let lower = self.after.unwrap_or([0; KEY_LEN]);
            let entry = match self
                .reader
                .storage
                .gspo
                .scan(self.reader.snapshot.roots.gspo, lower, None)
                .next()?
            {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    self.reader.storage.poison(&e);
                    return Some(Err(e));
                }
            };
            // Seek just past this graph prefix next time.
            match prefix_bounds(&entry.0[..5]).1 {
                Some(upper) => self.after = Some(upper),
                None => self.done = true,
            }
            let mut counter_bytes = [0_u8; 8];
            counter_bytes[3..8].copy_from_slice(&entry.0[..5]);
            let counter = u64::from_be_bytes(counter_bytes);
            if counter == 0 {
                continue; // the default graph is not a named graph
            }
            return Some(self.reader.storage.atoms.atom_id(counter).inspect_err(|e| {
                self.done = true;
                self.reader.storage.poison(e);
            }));
        }
        None
    }
}

#[derive(Default)]
struct TreeContexts {
    gspo: WriteContext,
    gpos: WriteContext,
    gosp: WriteContext,
    tgspo: WriteContext,
}

/// A write batch holding the writer lock. All mutations go to shadow pages;
/// `commit` makes them durable and visible atomically, `rollback` recycles
/// them.
pub struct StorageTransaction<'a> {
    storage: &'a Arc<StorageInner>,
    outer: &'a Storage,
    writer: MutexGuard<'a, WriterState>,
    roots: IndexRoots,
    base_version: u64,
    tx_id: u64,
    ops: Vec<WalOp>,
    ctx: TreeContexts,
}

impl StorageTransaction<'_> {
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    /// A reader over the working roots: read-your-writes inside the batch.
    pub fn reader(&self) -> StorageReader {
        self.storage.register_snapshot(self.base_version);
        StorageReader {
            storage: Arc::clone(self.storage),
            snapshot: Arc::new(Snapshot {
                roots: self.roots,
                durable_tx: self.tx_id,
                version: self.base_version,
            }),
            registered: true,
        }
    }

    pub fn insert_term(&mut self, term: TermRef<'_>) -> Result<AtomId, StorageError> {
        self.storage.insert_term(term)
    }

    pub fn lookup_term(&self, term: TermRef<'_>) -> Result<Option<AtomId>, StorageError> {
        self.storage.lookup_term(term)
    }

    pub fn lookup_graph_name(
        &self,
        graph: GraphNameRef<'_>,
    ) -> Result<Option<AtomId>, StorageError> {
        self.storage.lookup_graph_name(graph)
    }

    pub fn insert_graph_name(&mut self, graph: GraphNameRef<'_>) -> Result<AtomId, StorageError> {
        match graph {
            GraphNameRef::DefaultGraph => Ok(AtomId::DEFAULT_GRAPH),
            GraphNameRef::NamedNode(node) => self.insert_term(node.into()),
            GraphNameRef::BlankNode(node) => self.insert_term(node.into()),
        }
    }

    /// Inserts one version. Returns `false` if the identical version was
    /// already present (idempotent re-insert).
    pub fn put_version(
        &mut self,
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
        validity: Interval,
    ) -> Result<bool, StorageError> {
        let quad = EncodedQuad {
            graph,
            subject,
            predicate,
            object,
            validity,
            tx: self.tx_id,
        };
        let gspo_key = QuadEncoding::Gspo.encode_key(&quad);
        if let Some(existing) = self.storage.gspo.get(self.roots.gspo, &gspo_key)? {
            let (existing_validity, _) = binary_encoder::decode_payload(&existing);
            if existing_validity == validity {
                return Ok(false);
            }
        }
        self.put_quad(&quad, WalOpKind::Add)?;
        Ok(true)
    }

    /// Inserts a quad valid from `now` until further notice.
    pub fn insert_current(
        &mut self,
        quad: QuadRef<'_>,
        at: Timestamp,
    ) -> Result<bool, StorageError> {
        let graph = self.insert_graph_name(quad.graph_name)?;
        let subject = self.insert_term(quad.subject.into())?;
        let predicate = self.insert_term(quad.predicate.into())?;
        let object = self.insert_term(quad.object)?;
        self.insert_current_atoms(graph, subject, predicate, object, at)
    }

    /// [`Self::insert_current`] over already-interned atoms.
    pub fn insert_current_atoms(
        &mut self,
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
        at: Timestamp,
    ) -> Result<bool, StorageError> {
        // An already-open identical statement stays untouched.
        if self
            .open_versions(graph, subject, predicate, object)?
            .is_empty()
        {
            self.put_version(graph, subject, predicate, object, Interval::since(at))
        } else {
            Ok(false)
        }
    }

    /// Logical delete: every open version of (g, s, p, o) gets its
    /// `valid_to` closed at `at`. Returns the number of closed versions.
    pub fn close_versions(
        &mut self,
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
        at: Timestamp,
    ) -> Result<u64, StorageError> {
        let mut closed = 0;
        for start in self.open_versions(graph, subject, predicate, object)? {
            let quad = EncodedQuad {
                graph,
                subject,
                predicate,
                object,
                validity: Interval { start, end: at },
                tx: self.tx_id,
            };
            self.put_quad(&quad, WalOpKind::Close)?;
            closed += 1;
        }
        Ok(closed)
    }

    /// `valid_from` of every version of (g, s, p, o) still open.
    fn open_versions(
        &self,
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
    ) -> Result<Vec<Timestamp>, StorageError> {
        let prefix = scan_prefix(&[Some(graph), Some(subject), Some(predicate), Some(object)]);
        let (lower, upper) = prefix_bounds(&prefix);
        let mut open = Vec::new();
        for entry in self.storage.gspo.scan(self.roots.gspo, lower, upper) {
            let (_, payload) = entry?;
            let (validity, _) = binary_encoder::decode_payload(&payload);
            if validity.is_current() {
                open.push(validity.start);
            }
        }
        Ok(open)
    }

    /// Writes one version into all four indexes and logs it.
    fn put_quad(&mut self, quad: &EncodedQuad, kind: WalOpKind) -> Result<(), StorageError> {
        self.roots.gspo = self.storage.gspo.insert(
            self.roots.gspo,
            &QuadEncoding::Gspo.encode_key(quad),
            &encode_payload(quad),
            &mut self.ctx.gspo,
        )?;
        self.roots.gpos = self.storage.gpos.insert(
            self.roots.gpos,
            &QuadEncoding::Gpos.encode_key(quad),
            &encode_payload(quad),
            &mut self.ctx.gpos,
        )?;
        self.roots.gosp = self.storage.gosp.insert(
            self.roots.gosp,
            &QuadEncoding::Gosp.encode_key(quad),
            &encode_payload(quad),
            &mut self.ctx.gosp,
        )?;
        self.roots.tgspo = self.storage.tgspo.insert(
            self.roots.tgspo,
            &QuadEncoding::Tgspo.encode_key(quad),
            &encode_payload(quad),
            &mut self.ctx.tgspo,
        )?;
        self.ops.push(WalOp {
            kind,
            graph: quad.graph.word(),
            subject: quad.subject.word(),
            predicate: quad.predicate.word(),
            object: quad.object.word(),
            valid_from: quad.validity.start,
            valid_to: quad.validity.end,
        });
        Ok(())
    }

    /// WAL append + fsync, then atomically publish the new roots.
    pub fn commit(mut self) -> Result<(), StorageError> {
        let writer = &mut *self.writer;
        self.storage.atoms.flush()?;
        writer.wal.append(&WalRecord {
            tx_id: self.tx_id,
            ops: std::mem::take(&mut self.ops),
        })?;
        writer.wal.sync()?;

        let version = self.tx_id;
        *self.storage.current.write().unwrap() = Arc::new(Snapshot {
            roots: self.roots,
            durable_tx: self.tx_id,
            version,
        });
        {
            let mut tracker = self.storage.snapshots.lock().unwrap();
            for (tree, ctx) in [
                (TreeId::Gspo, &mut self.ctx.gspo),
                (TreeId::Gpos, &mut self.ctx.gpos),
                (TreeId::Gosp, &mut self.ctx.gosp),
                (TreeId::Tgspo, &mut self.ctx.tgspo),
            ] {
                for page in ctx.freed.drain(..) {
                    tracker.pending.push((version, tree, page));
                }
            }
            self.storage.release_pending(&mut tracker);
        }

        writer.next_tx = self.tx_id + 1;
        writer.commits_since_checkpoint += 1;
        if writer.commits_since_checkpoint >= CHECKPOINT_COMMITS
            || writer.wal.size() >= CHECKPOINT_WAL_BYTES
        {
            self.outer.checkpoint_locked(writer, self.tx_id)?;
        }
        Ok(())
    }

    /// Discards the batch: shadow pages go straight back to the free lists,
    /// the WAL is untouched.
    pub fn rollback(mut self) -> Result<(), StorageError> {
        for (tree, ctx) in [
            (TreeId::Gspo, &mut self.ctx.gspo),
            (TreeId::Gpos, &mut self.ctx.gpos),
            (TreeId::Gosp, &mut self.ctx.gosp),
            (TreeId::Tgspo, &mut self.ctx.tgspo),
        ] {
            for page in ctx.allocated.drain(..) {
                self.storage.tree(tree).file().free_page(page)?;
            }
        }
        Ok(())
    }
}

/// Builds the four trees bottom-up from a quad stream, in key order, with
/// no random inserts. Only valid on an empty store; used by imports and by
/// the pruning transfer.
#[must_use]
pub struct StorageBulkLoader {
    storage: Storage,
}

impl Storage {
    pub fn bulk_loader(&self) -> StorageBulkLoader {
        StorageBulkLoader {
            storage: self.clone(),
        }
    }
}

impl StorageBulkLoader {
    /// Loads `(quad, validity, tx)` triples and checkpoints. The WAL is
    /// bypassed: the checkpoint makes the load durable wholesale.
    pub fn load<EI, EO: From<StorageError> + From<EI>>(
        &self,
        quads: impl IntoIterator<Item = Result<(oxrdf::Quad, Interval, u64), EI>>,
    ) -> Result<u64, EO> {
        let mut writer = self.storage.inner.writer.lock().unwrap();
        if !self.storage.snapshot().is_empty().map_err(EO::from)? {
            return Err(EO::from(StorageError::Other(
                "bulk loading requires an empty store".into(),
            )));
        }
        let inner = &self.storage.inner;
        let mut encoded = Vec::new();
        let mut max_tx = 0_u64;
        for quad in quads {
            let (quad, validity, tx) = quad.map_err(EO::from)?;
            let quad_ref = quad.as_ref();
            let graph = match quad_ref.graph_name {
                GraphNameRef::DefaultGraph => AtomId::DEFAULT_GRAPH,
                GraphNameRef::NamedNode(n) => inner.insert_term(n.into()).map_err(EO::from)?,
                GraphNameRef::BlankNode(n) => inner.insert_term(n.into()).map_err(EO::from)?,
            };
            let subject = inner
                .insert_term(quad_ref.subject.into())
                .map_err(EO::from)?;
            let predicate = inner
                .insert_term(quad_ref.predicate.into())
                .map_err(EO::from)?;
            let object = inner.insert_term(quad_ref.object).map_err(EO::from)?;
            max_tx = max_tx.max(tx);
            encoded.push(EncodedQuad {
                graph,
                subject,
                predicate,
                object,
                validity,
                tx,
            });
        }
        let loaded = encoded.len() as u64;

        let mut roots = IndexRoots {
            gspo: paging::NO_PAGE,
            gpos: paging::NO_PAGE,
            gosp: paging::NO_PAGE,
            tgspo: paging::NO_PAGE,
        };
        for (tree, encoding) in [
            (&inner.gspo, QuadEncoding::Gspo),
            (&inner.gpos, QuadEncoding::Gpos),
            (&inner.gosp, QuadEncoding::Gosp),
            (&inner.tgspo, QuadEncoding::Tgspo),
        ] {
            let mut entries: Vec<_> = encoded
                .iter()
                .map(|quad| (encoding.encode_key(quad), encode_payload(quad)))
                .collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            entries.dedup_by(|a, b| a.0 == b.0);
            let root = tree.bulk_load(entries).map_err(EO::from)?;
            match encoding {
                QuadEncoding::Gspo => roots.gspo = root,
                QuadEncoding::Gpos => roots.gpos = root,
                QuadEncoding::Gosp => roots.gosp = root,
                QuadEncoding::Tgspo => roots.tgspo = root,
            }
        }

        let durable_tx = max_tx.max(writer.next_tx);
        *inner.current.write().unwrap() = Arc::new(Snapshot {
            roots,
            durable_tx,
            version: durable_tx,
        });
        writer.next_tx = durable_tx + 1;
        self.storage
            .checkpoint_locked(&mut writer, durable_tx)
            .map_err(EO::from)?;
        Ok(loaded)
    }
}

/// The store-level header file; also the target of the exclusive OS lock.
struct StoreHeader {
    file: File,
}

const STORE_HEADER_LEN: usize = 28;

impl StoreHeader {
    fn open(path: &Path) -> Result<(Self, u64), StorageError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() == 0 {
            let mut this = Self { file };
            this.write(0)?;
            return Ok((this, 0));
        }
        let mut header = [0_u8; STORE_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if u64::from_be_bytes(header[0..8].try_into().unwrap()) != STORE_MAGIC {
            return Err(CorruptionError::BadHeader {
                file: "header.page".into(),
                reason: "bad magic number".into(),
            }
            .into());
        }
        let version = u32::from_be_bytes(header[8..12].try_into().unwrap());
        if version > FORMAT_VERSION {
            return Err(CorruptionError::BadHeader {
                file: "header.page".into(),
                reason: format!(
                    "format version {version} is newer than the supported {FORMAT_VERSION}"
                ),
            }
            .into());
        }
        if crc32fast::hash(&header[..24]) != u32::from_be_bytes(header[24..28].try_into().unwrap())
        {
            return Err(CorruptionError::BadHeader {
                file: "header.page".into(),
                reason: "header checksum mismatch".into(),
            }
            .into());
        }
        let durable_tx = u64::from_be_bytes(header[16..24].try_into().unwrap());
        Ok((Self { file }, durable_tx))
    }

    fn write(&mut self, durable_tx: u64) -> Result<(), StorageError> {
        let mut header = [0_u8; STORE_HEADER_LEN];
        header[0..8].copy_from_slice(&STORE_MAGIC.to_be_bytes());
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        header[16..24].copy_from_slice(&durable_tx.to_be_bytes());
        let crc = crc32fast::hash(&header[..24]);
        header[24..28].copy_from_slice(&crc.to_be_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Exclusive OS lock on `header.page`, preventing concurrent openers.
struct StoreLock {
    #[allow(dead_code)]
    file: File,
}

impl StoreLock {
    #[allow(unsafe_code)]
    fn acquire(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: plain syscall on an owned fd.
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
                return Err(StorageError::Other(
                    format!(
                        "the store at {} is already opened by another process",
                        path.display()
                    )
                    .into(),
                ));
            }
        }
        Ok(Self { file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal;
    use oxrdf::{GraphName, NamedNode, Quad};

    fn quad(s: &str, o: &str) -> Quad {
        Quad::new(
            NamedNode::new_unchecked(format!("http://example.com/{s}")),
            NamedNode::new_unchecked("http://example.com/p"),
            NamedNode::new_unchecked(format!("http://example.com/{o}")),
            GraphName::DefaultGraph,
        )
    }

    #[test]
    fn insert_and_scan() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::open(dir.path())?;
        let now = temporal::now();
        let mut txn = storage.start_transaction()?;
        assert!(txn.insert_current(quad("a", "b").as_ref(), now)?);
        assert!(!txn.insert_current(quad("a", "b").as_ref(), now)?);
        assert!(txn.insert_current(quad("a", "c").as_ref(), now)?);
        txn.commit()?;

        let reader = storage.snapshot();
        assert_eq!(reader.len(TemporalFilter::All)?, 2);
        reader.validate()?;
        Ok(())
    }

    #[test]
    fn snapshot_isolation() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::open(dir.path())?;
        let now = temporal::now();
        storage.transaction(|txn| txn.insert_current(quad("a", "b").as_ref(), now))?;
        let before = storage.snapshot();
        storage.transaction(|txn| txn.insert_current(quad("c", "d").as_ref(), now))?;
        assert_eq!(before.len(TemporalFilter::All)?, 1);
        assert_eq!(storage.snapshot().len(TemporalFilter::All)?, 2);
        assert!(before.durable_tx() < storage.snapshot().durable_tx());
        Ok(())
    }

    #[test]
    fn rollback_leaves_no_trace() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::open(dir.path())?;
        let now = temporal::now();
        let mut txn = storage.start_transaction()?;
        txn.insert_current(quad("a", "b").as_ref(), now)?;
        txn.rollback()?;
        assert!(storage.snapshot().is_empty()?);
        Ok(())
    }

    #[test]
    fn read_your_writes_in_batch() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::open(dir.path())?;
        let now = temporal::now();
        let mut txn = storage.start_transaction()?;
        txn.insert_current(quad("a", "b").as_ref(), now)?;
        assert_eq!(txn.reader().len(TemporalFilter::All)?, 1);
        assert_eq!(storage.snapshot().len(TemporalFilter::All)?, 0);
        txn.commit()?;
        Ok(())
    }

    #[test]
    fn logical_delete_keeps_history() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::open(dir.path())?;
        let t0 = 1_000_000;
        let t1 = 2_000_000;
        storage.transaction(|txn| txn.insert_current(quad("a", "b").as_ref(), t0))?;
        storage.transaction::<_, StorageError>(|txn| {
            let reader = txn.reader();
            let quads: Vec<_> = reader
                .quads_for_pattern(None, None, None, None, TemporalFilter::All)
                .collect::<Result<_, _>>()?;
            let q = quads[0];
            txn.close_versions(q.graph, q.subject, q.predicate, q.object, t1)?;
            Ok(())
        })?;
        let reader = storage.snapshot();
        assert_eq!(reader.len(TemporalFilter::All)?, 1);
        assert_eq!(reader.len(TemporalFilter::AsOf(t0))?, 1);
        assert_eq!(reader.len(TemporalFilter::AsOf(t1))?, 0);
        reader.validate()?;
        Ok(())
    }

    #[test]
    fn durable_across_reopen() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let now = temporal::now();
        {
            let storage = Storage::open(dir.path())?;
            storage.transaction(|txn| txn.insert_current(quad("a", "b").as_ref(), now))?;
            // No checkpoint: reopening must replay from the WAL.
        }
        {
            let storage = Storage::open(dir.path())?;
            let reader = storage.snapshot();
            assert_eq!(reader.len(TemporalFilter::All)?, 1);
            reader.validate()?;
        }
        // And a second replay of the same WAL is a no-op.
        let storage = Storage::open(dir.path())?;
        assert_eq!(storage.snapshot().len(TemporalFilter::All)?, 1);
        Ok(())
    }

    #[test]
    fn named_graph_enumeration() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::open(dir.path())?;
        let now = temporal::now();
        let g = NamedNode::new_unchecked("http://example.com/g");
        storage.transaction::<_, StorageError>(|txn| {
            txn.insert_current(quad("a", "b").as_ref(), now)?;
            let named = Quad::new(
                NamedNode::new_unchecked("http://example.com/s"),
                NamedNode::new_unchecked("http://example.com/p"),
                NamedNode::new_unchecked("http://example.com/o"),
                g.clone(),
            );
            txn.insert_current(named.as_ref(), now)?;
            Ok(())
        })?;
        let reader = storage.snapshot();
        let graphs: Vec<_> = reader.named_graphs().collect::<Result<_, _>>()?;
        assert_eq!(graphs.len(), 1);
        assert_eq!(reader.decode_term(graphs[0])?, g.into());
        Ok(())
    }
}
