//! Pruning: the only operation that physically removes history.
//!
//! The source store is scanned in transaction-time order through a
//! composable filter and a history mode into a freshly built target store,
//! which atomically replaces the source directory on success (`rename`,
//! source kept as a backup until the swap is complete). Any failure before
//! the swap leaves the source untouched and discards the target.

use crate::model::{GraphName, NamedNode};
use crate::storage::StorageError;
use crate::store::{Store, VersionedQuad};
use crate::temporal::TemporalFilter;
use rustc_hash::FxHashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What survives of each quad's history.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum HistoryMode {
    /// Only the currently-valid versions.
    FlattenToCurrent,
    /// Every version that is current or was never superseded; versions
    /// fully replaced by a newer one for the same (g, s, p, o) go away.
    #[default]
    PreserveVersions,
    /// Every version, including soft-deleted ones.
    All,
}

/// A composable quad filter: graph and predicate allow/deny lists plus an
/// arbitrary predicate. A quad survives when every configured part accepts
/// it.
#[derive(Clone, Default)]
pub struct PruneFilter {
    include_graphs: Option<Vec<GraphName>>,
    exclude_graphs: Vec<GraphName>,
    include_predicates: Option<Vec<NamedNode>>,
    exclude_predicates: Vec<NamedNode>,
    custom: Option<Arc<dyn Fn(&VersionedQuad) -> bool + Send + Sync>>,
}

impl PruneFilter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn include_graphs(mut self, graphs: impl IntoIterator<Item = GraphName>) -> Self {
        self.include_graphs = Some(graphs.into_iter().collect());
        self
    }

    #[must_use]
    pub fn exclude_graph(mut self, graph: GraphName) -> Self {
        self.exclude_graphs.push(graph);
        self
    }

    #[must_use]
    pub fn include_predicates(mut self, predicates: impl IntoIterator<Item = NamedNode>) -> Self {
        self.include_predicates = Some(predicates.into_iter().collect());
        self
    }

    #[must_use]
    pub fn exclude_predicate(mut self, predicate: NamedNode) -> Self {
        self.exclude_predicates.push(predicate);
        self
    }

    /// A user-supplied predicate, composed with the lists.
    #[must_use]
    pub fn keep_if(mut self, f: impl Fn(&VersionedQuad) -> bool + Send + Sync + 'static) -> Self {
        self.custom = Some(Arc::new(f));
        self
    }

    fn accepts(&self, quad: &VersionedQuad) -> bool {
        if let Some(included) = &self.include_graphs {
            if !included.contains(&quad.quad.graph_name) {
                return false;
            }
        }
        if self.exclude_graphs.contains(&quad.quad.graph_name) {
            return false;
        }
        if let Some(included) = &self.include_predicates {
            if !included.contains(&quad.quad.predicate) {
                return false;
            }
        }
        if self.exclude_predicates.contains(&quad.quad.predicate) {
            return false;
        }
        if let Some(custom) = &self.custom {
            if !custom(quad) {
                return false;
            }
        }
        true
    }
}

/// The output options bundle of a pruning run.
#[derive(Clone, Default)]
pub struct PruneOptions {
    pub filter: PruneFilter,
    pub history_mode: HistoryMode,
    /// Count what would happen; write nothing, swap nothing.
    pub dry_run: bool,
    /// Re-scan the target after the build and compare counts (and the
    /// checksum when one was computed).
    pub verify: bool,
    /// CRC32 over the canonical form of every kept quad.
    pub compute_checksum: bool,
    /// Appends each filtered-out quad in a canonical line-oriented form.
    pub audit_log_path: Option<PathBuf>,
}

/// What a pruning run did.
#[derive(Debug, Clone, Copy)]
pub struct PruneReport {
    pub scanned: u64,
    pub kept: u64,
    pub filtered_out: u64,
    pub checksum: Option<u32>,
    pub dry_run: bool,
}

impl Store {
    /// Rewrites the store through the filter and history mode, swapping the
    /// rewritten copy into place. Consumes the handle: the pruned store is
    /// reopened from the same path and returned.
    ///
    /// Any failure before the final swap discards the target and leaves the
    /// source untouched.
    pub fn prune(self, options: &PruneOptions) -> Result<(Store, PruneReport), StorageError> {
        let path = self.storage().path().to_path_buf();
        let reader = self.storage().snapshot();

        // Pass 1: the latest version start per key decides what
        // PreserveVersions suppresses.
        let mut latest: FxHashMap<[u64; 4], i64> = FxHashMap::default();
        if options.history_mode == HistoryMode::PreserveVersions {
            for quad in reader.quads_in_tx_order(TemporalFilter::All) {
                let quad = quad?;
                let key = [
                    quad.graph.counter(),
                    quad.subject.counter(),
                    quad.predicate.counter(),
                    quad.object.counter(),
                ];
                let entry = latest.entry(key).or_insert(quad.validity.start);
                *entry = (*entry).max(quad.validity.start);
            }
        }

        let mut audit = match &options.audit_log_path {
            Some(path) => Some(std::io::BufWriter::new(
                fs::OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };

        let mut scanned = 0_u64;
        let mut kept_count = 0_u64;
        let mut filtered_out = 0_u64;
        let mut checksum = options.compute_checksum.then_some(0_u32);
        let mut kept = Vec::new();
        for encoded in reader.quads_in_tx_order(TemporalFilter::All) {
            let encoded = encoded?;
            let quad = crate::store::decode_versioned(&reader, &encoded)?;
            scanned += 1;
            let survives = options.filter.accepts(&quad)
                && match options.history_mode {
                    HistoryMode::All => true,
                    HistoryMode::FlattenToCurrent => quad.validity.is_current(),
                    // A closed version is suppressed once a later version
                    // of the same key exists.
                    HistoryMode::PreserveVersions => {
                        let key = [
                            encoded.graph.counter(),
                            encoded.subject.counter(),
                            encoded.predicate.counter(),
                            encoded.object.counter(),
                        ];
                        quad.validity.is_current()
                            || latest
                                .get(&key)
                                .is_none_or(|newest| *newest <= quad.validity.start)
                    }
                };
            if survives {
                kept_count += 1;
                if let Some(checksum) = &mut checksum {
                    *checksum = combine_checksum(*checksum, &quad);
                }
                if !options.dry_run {
                    kept.push(quad);
                }
            } else {
                filtered_out += 1;
                if let Some(audit) = &mut audit {
                    writeln!(audit, "{}", canonical_line(&quad).trim_end())?;
                }
            }
        }
        if let Some(mut audit) = audit {
            audit.flush()?;
        }

        if options.dry_run {
            return Ok((
                self,
                PruneReport {
                    scanned,
                    kept: kept_count,
                    filtered_out,
                    checksum,
                    dry_run: true,
                },
            ));
        }

        // Build the target next to the source; refuse leftovers.
        let target_path = sibling_path(&path, ".prune-tmp");
        if target_path.exists() {
            if fs::read_dir(&target_path)?.next().is_some() {
                return Err(StorageError::Other(
                    format!(
                        "the pruning target {} already exists and is not empty",
                        target_path.display()
                    )
                    .into(),
                ));
            }
            fs::remove_dir(&target_path)?;
        }
        let build = (|| {
            let target = Store::open(&target_path)?;
            target
                .bulk_loader()
                .load_versioned(kept.iter().cloned().map(Ok))?;
            if options.verify {
                verify_target(&target, kept_count, options.compute_checksum, checksum)?;
            }
            Ok::<_, StorageError>(target)
        })();
        let target = match build {
            Ok(target) => target,
            Err(error) => {
                let _ = fs::remove_dir_all(&target_path);
                return Err(error);
            }
        };

        // Swap: close every handle, then two renames and a cleanup.
        drop(target);
        drop(reader);
        drop(self);
        let backup_path = sibling_path(&path, ".prune-backup");
        fs::rename(&path, &backup_path)?;
        if let Err(error) = fs::rename(&target_path, &path) {
            // Roll the source back into place.
            let _ = fs::rename(&backup_path, &path);
            return Err(error.into());
        }
        fs::remove_dir_all(&backup_path)?;

        let store = Store::open(&path)?;
        Ok((
            store,
            PruneReport {
                scanned,
                kept: kept_count,
                filtered_out,
                checksum,
                dry_run: false,
            },
        ))
    }
}

fn verify_target(
    target: &Store,
    expected: u64,
    with_checksum: bool,
    expected_checksum: Option<u32>,
) -> Result<(), StorageError> {
    let mut count = 0_u64;
    let mut checksum = with_checksum.then_some(0_u32);
    for quad in target.versions() {
        let quad = quad?;
        count += 1;
        if let Some(checksum) = &mut checksum {
            *checksum = combine_checksum(*checksum, &quad);
        }
    }
    if count != expected {
        return Err(StorageError::Other(
            format!("pruning verification failed: expected {expected} quads, found {count}").into(),
        ));
    }
    if let (Some(found), Some(expected)) = (checksum, expected_checksum) {
        if found != expected {
            return Err(StorageError::Other(
                format!(
                    "pruning verification failed: expected checksum {expected:#010x}, found {found:#010x}"
                )
                .into(),
            ));
        }
    }
    Ok(())
}

/// Order-insensitive combination: source and target enumerate in their own
/// transaction-time orders, so the checksum must not depend on it.
fn combine_checksum(checksum: u32, quad: &VersionedQuad) -> u32 {
    checksum.wrapping_add(crc32fast::hash(canonical_line(quad).as_bytes()))
}

/// One canonical line per version: the N-Quads form plus the temporal
/// coordinates.
fn canonical_line(quad: &VersionedQuad) -> String {
    format!(
        "{} vf={} vt={} tx={}\n",
        quad.quad, quad.validity.start, quad.validity.end, quad.tx
    )
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| "store".to_owned(), |n| n.to_string_lossy().into_owned());
    name.push_str(suffix);
    path.with_file_name(name)
}
