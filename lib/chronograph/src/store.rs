//! The public API of the store.
//!
//! A [`Store`] is a handle on one on-disk bitemporal dataset. It allows
//! quad-level reads and writes, SPARQL queries with temporal modifiers and
//! SPARQL updates, all with snapshot-isolated readers and a single durable
//! writer.
//!
//! Usage example:
//!
//! ```
//! use chronograph::model::*;
//! use chronograph::store::Store;
//! use chronograph::temporal::TemporalMode;
//!
//! let dir = tempfile::tempdir()?;
//! let store = Store::open(dir.path())?;
//!
//! let ex = NamedNode::new("http://example.com")?;
//! let quad = Quad::new(ex.clone(), ex.clone(), ex.clone(), GraphName::DefaultGraph);
//! store.insert_current(quad.as_ref())?;
//!
//! let results: Result<Vec<_>, _> = store
//!     .quads_for_pattern(None, None, None, None, TemporalMode::Current)
//!     .collect();
//! assert_eq!(results?.len(), 1);
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```

use crate::model::{
    GraphNameRef, NamedNodeRef, NamedOrBlankNode, Quad, QuadRef, SubjectRef, Term, TermRef,
};
use crate::sparql::{
    evaluate_query, Query, QueryEvaluationError, QueryOptions, QueryResults, Update,
    UpdateEvaluationError, UpdateEvaluator, UpdateOptions,
};
use crate::storage::binary_encoder::EncodedQuad;
pub use crate::storage::{CorruptionError, StorageError};
use crate::storage::{DecodingQuadIterator, Storage, StorageReader, StorageTransaction};
use crate::temporal::{self, Interval, TemporalMode, Timestamp};
use std::path::Path;

/// An on-disk bitemporal quad store.
///
/// Clones share the same underlying storage.
#[derive(Clone)]
pub struct Store {
    storage: Storage,
}

impl Store {
    /// Opens (or creates) a store at the given directory and replays its
    /// write-ahead log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            storage: Storage::open(path.as_ref())?,
        })
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Executes a SPARQL query against the current snapshot.
    pub fn query(&self, query: &Query) -> Result<QueryResults, QueryEvaluationError> {
        self.query_opt(query, QueryOptions::default())
    }

    pub fn query_opt(
        &self,
        query: &Query,
        options: QueryOptions,
    ) -> Result<QueryResults, QueryEvaluationError> {
        evaluate_query(self.storage.snapshot(), query, &options)
    }

    /// Executes a SPARQL update in a single transaction. Returns the number
    /// of logical writes performed (non-authoritative).
    pub fn update(&self, update: &Update) -> Result<u64, UpdateEvaluationError> {
        self.update_opt(update, UpdateOptions::default())
    }

    pub fn update_opt(
        &self,
        update: &Update,
        options: UpdateOptions,
    ) -> Result<u64, UpdateEvaluationError> {
        let mut transaction = self.storage.start_transaction()?;
        match UpdateEvaluator::new(&mut transaction, &options).eval_all(update) {
            Ok(affected) => {
                transaction.commit()?;
                Ok(affected)
            }
            Err(error) => {
                transaction.rollback()?;
                Err(error)
            }
        }
    }

    /// Inserts a quad valid from now on. Returns `false` if an identical
    /// statement is already current.
    pub fn insert_current(&self, quad: QuadRef<'_>) -> Result<bool, StorageError> {
        let now = temporal::now();
        self.storage
            .transaction(|txn| txn.insert_current(quad, now))
    }

    /// Inserts a quad with an explicit validity interval.
    pub fn insert_at(&self, quad: QuadRef<'_>, validity: Interval) -> Result<bool, StorageError> {
        self.storage.transaction(|txn| {
            let graph = txn.insert_graph_name(quad.graph_name)?;
            let subject = txn.insert_term(quad.subject.into())?;
            let predicate = txn.insert_term(quad.predicate.into())?;
            let object = txn.insert_term(quad.object)?;
            txn.put_version(graph, subject, predicate, object, validity)
        })
    }

    /// Logical delete: closes every currently-valid version of the quad at
    /// now. The history stays until pruning. Returns whether anything was
    /// closed.
    pub fn remove(&self, quad: QuadRef<'_>) -> Result<bool, StorageError> {
        let now = temporal::now();
        self.storage.transaction(|txn| {
            let Some(graph) = txn.lookup_graph_name(quad.graph_name)? else {
                return Ok(false);
            };
            let Some(subject) = txn.lookup_term(quad.subject.into())? else {
                return Ok(false);
            };
            let Some(predicate) = txn.lookup_term(quad.predicate.into())? else {
                return Ok(false);
            };
            let Some(object) = txn.lookup_term(quad.object)? else {
                return Ok(false);
            };
            Ok(txn.close_versions(graph, subject, predicate, object, now)? > 0)
        })
    }

    /// Runs several writes as one atomic, durable batch. The batch commits
    /// if the closure returns `Ok` and rolls back otherwise.
    pub fn transaction<T, E: From<StorageError>>(
        &self,
        f: impl FnOnce(&mut Transaction<'_, '_>) -> Result<T, E>,
    ) -> Result<T, E> {
        self.storage.transaction(|inner| {
            let mut transaction = Transaction {
                inner,
                now: temporal::now(),
            };
            f(&mut transaction)
        })
    }

    /// The quads matching a pattern under a temporal mode, with their
    /// validity intervals and transaction ids.
    pub fn quads_for_pattern(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        graph_name: Option<GraphNameRef<'_>>,
        mode: TemporalMode,
    ) -> QuadIter {
        let reader = self.storage.snapshot();
        let filter = mode.resolve(temporal::now());
        let inner = (|| {
            let subject = match subject {
                Some(subject) => match reader.lookup_term(subject.into())? {
                    Some(atom) => Some(atom),
                    None => return Ok(None),
                },
                None => None,
            };
            let predicate = match predicate {
                Some(predicate) => match reader.lookup_term(predicate.into())? {
                    Some(atom) => Some(atom),
                    None => return Ok(None),
                },
                None => None,
            };
            let object = match object {
                Some(object) => match reader.lookup_term(object)? {
                    Some(atom) => Some(atom),
                    None => return Ok(None),
                },
                None => None,
            };
            let graph = match graph_name {
                Some(graph_name) => match reader.lookup_graph_name(graph_name)? {
                    Some(atom) => Some(atom),
                    None => return Ok(None),
                },
                None => None,
            };
            Ok(Some(reader.quads_for_pattern(
                subject, predicate, object, graph, filter,
            )))
        })();
        QuadIter {
            state: match inner {
                Ok(Some(iter)) => QuadIterState::Scanning { iter },
                Ok(None) => QuadIterState::Empty,
                Err(error) => QuadIterState::Failed(Some(error)),
            },
            reader,
        }
    }

    /// Every version of every quad, in transaction-time order.
    pub fn versions(&self) -> QuadIter {
        let reader = self.storage.snapshot();
        QuadIter {
            state: QuadIterState::Scanning {
                iter: reader.quads_in_tx_order(crate::temporal::TemporalFilter::All),
            },
            reader,
        }
    }

    pub fn contains(&self, quad: QuadRef<'_>, mode: TemporalMode) -> Result<bool, StorageError> {
        let reader = self.storage.snapshot();
        let filter = mode.resolve(temporal::now());
        let Some(graph) = reader.lookup_graph_name(quad.graph_name)? else {
            return Ok(false);
        };
        let Some(subject) = reader.lookup_term(quad.subject.into())? else {
            return Ok(false);
        };
        let Some(predicate) = reader.lookup_term(quad.predicate.into())? else {
            return Ok(false);
        };
        let Some(object) = reader.lookup_term(quad.object)? else {
            return Ok(false);
        };
        reader.contains(subject, predicate, object, graph, filter)
    }

    /// The number of stored versions visible under the mode.
    pub fn len(&self, mode: TemporalMode) -> Result<usize, StorageError> {
        self.storage
            .snapshot()
            .len(mode.resolve(temporal::now()))
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.storage.snapshot().is_empty()
    }

    /// The named graphs with at least one quad, whatever its validity.
    pub fn named_graphs(&self) -> Result<Vec<NamedOrBlankNode>, StorageError> {
        let reader = self.storage.snapshot();
        let mut graphs = Vec::new();
        for atom in reader.named_graphs() {
            match reader.decode_term(atom?)? {
                Term::NamedNode(node) => graphs.push(node.into()),
                Term::BlankNode(node) => graphs.push(node.into()),
                Term::Literal(_) => {
                    // Unreachable for stored graph names.
                }
            }
        }
        Ok(graphs)
    }

    pub fn contains_named_graph<'a>(
        &self,
        graph_name: impl Into<GraphNameRef<'a>>,
    ) -> Result<bool, StorageError> {
        let reader = self.storage.snapshot();
        match reader.lookup_graph_name(graph_name.into())? {
            Some(atom) => reader.contains_named_graph(atom),
            None => Ok(false),
        }
    }

    /// Flushes every dirty page and truncates the write-ahead log.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.storage.checkpoint()
    }

    /// Validates the storage invariants (cross-index consistency).
    pub fn validate(&self) -> Result<(), StorageError> {
        self.storage.snapshot().validate()
    }

    /// A bulk loader building the indexes bottom-up; only valid on an empty
    /// store.
    pub fn bulk_loader(&self) -> BulkLoader {
        BulkLoader {
            inner: self.storage.bulk_loader(),
        }
    }
}

/// A write batch on a [`Store`]. Reads through [`Transaction::query`]
/// observe the in-progress writes.
pub struct Transaction<'a, 'b> {
    inner: &'a mut StorageTransaction<'b>,
    now: Timestamp,
}

impl Transaction<'_, '_> {
    pub fn insert_current(&mut self, quad: QuadRef<'_>) -> Result<bool, StorageError> {
        self.inner.insert_current(quad, self.now)
    }

    pub fn insert_at(&mut self, quad: QuadRef<'_>, validity: Interval) -> Result<bool, StorageError> {
        let graph = self.inner.insert_graph_name(quad.graph_name)?;
        let subject = self.inner.insert_term(quad.subject.into())?;
        let predicate = self.inner.insert_term(quad.predicate.into())?;
        let object = self.inner.insert_term(quad.object)?;
        self.inner.put_version(graph, subject, predicate, object, validity)
    }

    pub fn remove(&mut self, quad: QuadRef<'_>) -> Result<bool, StorageError> {
        let Some(graph) = self.inner.lookup_graph_name(quad.graph_name)? else {
            return Ok(false);
        };
        let Some(subject) = self.inner.lookup_term(quad.subject.into())? else {
            return Ok(false);
        };
        let Some(predicate) = self.inner.lookup_term(quad.predicate.into())? else {
            return Ok(false);
        };
        let Some(object) = self.inner.lookup_term(quad.object)? else {
            return Ok(false);
        };
        Ok(self
            .inner
            .close_versions(graph, subject, predicate, object, self.now)?
            > 0)
    }

    /// Queries the in-progress state of the batch (read-your-writes).
    pub fn query(&self, query: &Query) -> Result<QueryResults, QueryEvaluationError> {
        evaluate_query(self.inner.reader(), query, &QueryOptions::default())
    }
}

/// A quad with its validity interval and the transaction that wrote it.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct VersionedQuad {
    pub quad: Quad,
    pub validity: Interval,
    pub tx: u64,
}

enum QuadIterState {
    Scanning { iter: DecodingQuadIterator },
    Empty,
    Failed(Option<StorageError>),
}

/// An iterator over the [`VersionedQuad`]s matching a pattern.
pub struct QuadIter {
    state: QuadIterState,
    reader: StorageReader,
}

/// Decodes an index-level quad back into terms.
pub(crate) fn decode_versioned(
    reader: &StorageReader,
    quad: &EncodedQuad,
) -> Result<VersionedQuad, StorageError> {
    let subject = match reader.decode_term(quad.subject)? {
        Term::NamedNode(node) => node.into(),
        Term::BlankNode(node) => crate::model::Subject::BlankNode(node),
        Term::Literal(_) => {
            return Err(crate::storage::CorruptionError::msg("literal in subject position").into())
        }
    };
    let Term::NamedNode(predicate) = reader.decode_term(quad.predicate)? else {
        return Err(crate::storage::CorruptionError::msg("non-IRI in predicate position").into());
    };
    let object = reader.decode_term(quad.object)?;
    let graph_name = if quad.graph.is_default_graph() {
        GraphNameRef::DefaultGraph.into_owned()
    } else {
        match reader.decode_term(quad.graph)? {
            Term::NamedNode(node) => node.into(),
            Term::BlankNode(node) => node.into(),
            Term::Literal(_) => {
                return Err(
                    crate::storage::CorruptionError::msg("literal in graph position").into(),
                )
            }
        }
    };
    Ok(VersionedQuad {
        quad: Quad {
            subject,
            predicate,
            object,
            graph_name,
        },
        validity: quad.validity,
        tx: quad.tx,
    })
}

impl Iterator for QuadIter {
    type Item = Result<VersionedQuad, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            QuadIterState::Scanning { iter } => {
                let quad = match iter.next()? {
                    Ok(quad) => quad,
                    Err(error) => return Some(Err(error)),
                };
                Some(decode_versioned(&self.reader, &quad))
            }
            QuadIterState::Empty => None,
            QuadIterState::Failed(error) => error.take().map(Err),
        }
    }
}

/// Loads quads in bulk, bypassing the WAL; the closing checkpoint makes the
/// load durable.
#[must_use]
pub struct BulkLoader {
    inner: crate::storage::StorageBulkLoader,
}

impl BulkLoader {
    /// Loads quads as currently-valid statements.
    pub fn load_quads(
        &self,
        quads: impl IntoIterator<Item = Quad>,
    ) -> Result<u64, StorageError> {
        let now = temporal::now();
        self.inner.load::<StorageError, StorageError>(
            quads
                .into_iter()
                .map(|quad| Ok((quad, Interval::since(now), 1))),
        )
    }

    /// Loads fully-versioned quads, preserving validity and transaction
    /// time (the pruning transfer path).
    pub fn load_versioned(
        &self,
        quads: impl IntoIterator<Item = Result<VersionedQuad, StorageError>>,
    ) -> Result<u64, StorageError> {
        self.inner.load::<StorageError, StorageError>(
            quads
                .into_iter()
                .map(|quad| quad.map(|q| (q.quad, q.validity, q.tx))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphName, Literal, NamedNode};

    fn named(suffix: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("http://example.com/{suffix}"))
    }

    #[test]
    fn insert_query_remove_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path())?;
        let quad = Quad::new(
            named("s"),
            named("p"),
            Literal::new_simple_literal("o"),
            GraphName::DefaultGraph,
        );
        assert!(store.insert_current(quad.as_ref())?);
        assert!(!store.insert_current(quad.as_ref())?);
        assert!(store.contains(quad.as_ref(), TemporalMode::Current)?);
        assert_eq!(store.len(TemporalMode::Current)?, 1);

        assert!(store.remove(quad.as_ref())?);
        assert!(!store.remove(quad.as_ref())?);
        assert!(!store.contains(quad.as_ref(), TemporalMode::Current)?);
        // The closed version stays visible to ALL VERSIONS.
        assert!(store.contains(quad.as_ref(), TemporalMode::AllVersions)?);
        Ok(())
    }

    #[test]
    fn transaction_batches_are_atomic() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path())?;
        let a = Quad::new(named("a"), named("p"), named("b"), GraphName::DefaultGraph);
        let b = Quad::new(named("c"), named("p"), named("d"), GraphName::DefaultGraph);
        store.transaction::<_, StorageError>(|txn| {
            txn.insert_current(a.as_ref())?;
            txn.insert_current(b.as_ref())?;
            Ok(())
        })?;
        assert_eq!(store.len(TemporalMode::Current)?, 2);

        let c = Quad::new(named("e"), named("p"), named("f"), GraphName::DefaultGraph);
        let result: Result<(), StorageError> = store.transaction(|txn| {
            txn.insert_current(c.as_ref())?;
            Err(StorageError::Other("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.len(TemporalMode::Current)?, 2);
        Ok(())
    }

    #[test]
    fn versions_are_in_transaction_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path())?;
        for i in 0..5 {
            let quad = Quad::new(
                named(&format!("s{i}")),
                named("p"),
                named("o"),
                GraphName::DefaultGraph,
            );
            store.insert_current(quad.as_ref())?;
        }
        let versions: Vec<_> = store.versions().collect::<Result<_, _>>()?;
        assert_eq!(versions.len(), 5);
        assert!(versions.windows(2).all(|w| w[0].tx <= w[1].tx));
        Ok(())
    }
}
