//! The dataset a query executes against: one storage snapshot, the query's
//! dataset specification (`FROM` / `FROM NAMED`) and a side table of
//! query-local atom ids for terms that are not in the dictionary.

use crate::model::{NamedNode, Term, TermRef};
use crate::sparql::error::QueryEvaluationError;
use crate::storage::atoms::{AtomId, AtomKind};
use crate::storage::binary_encoder::EncodedQuad;
use crate::storage::{StorageError, StorageReader};
use crate::temporal::TemporalFilter;
use chronogebra::algebra::QueryDataset;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};

pub struct DatasetView {
    reader: StorageReader,
    /// `FROM`: graphs standing in for the default graph, `None` = the real
    /// default graph.
    default_graphs: Option<Vec<AtomId>>,
    /// `FROM NAMED`: the graphs `GRAPH ?g` may range over.
    named_graphs: Option<Vec<AtomId>>,
    extra_terms: RefCell<FxHashMap<u64, Term>>,
    extra_ids: RefCell<FxHashMap<Term, AtomId>>,
    next_local: Cell<u64>,
    term_cache: RefCell<FxHashMap<AtomId, Term>>,
}

impl DatasetView {
    pub fn new(
        reader: StorageReader,
        dataset: Option<&QueryDataset>,
    ) -> Result<Self, QueryEvaluationError> {
        let (default_graphs, named_graphs) = if let Some(dataset) = dataset {
            let default = if dataset.default.is_empty() {
                None
            } else {
                Some(lookup_graphs(&reader, &dataset.default)?)
            };
            let named = dataset
                .named
                .as_ref()
                .map(|named| lookup_graphs(&reader, named))
                .transpose()?;
            (default, named)
        } else {
            (None, None)
        };
        Ok(Self {
            reader,
            default_graphs,
            named_graphs,
            extra_terms: RefCell::new(FxHashMap::default()),
            extra_ids: RefCell::new(FxHashMap::default()),
            next_local: Cell::new(1),
            term_cache: RefCell::new(FxHashMap::default()),
        })
    }

    /// Encodes a term for pattern and expression use. A term absent from
    /// the dictionary gets a query-local id: it can never match a stored
    /// quad but still participates in expressions and results.
    pub fn encode_term(&self, term: TermRef<'_>) -> Result<AtomId, QueryEvaluationError> {
        if let Some(id) = self.reader.lookup_term(term)? {
            return Ok(id);
        }
        let owned: Term = term.into_owned();
        if let Some(id) = self.extra_ids.borrow().get(&owned) {
            return Ok(*id);
        }
        let counter = self.next_local.get();
        self.next_local.set(counter + 1);
        let id = AtomId::new(AtomKind::Local, counter);
        self.extra_ids.borrow_mut().insert(owned.clone(), id);
        self.extra_terms.borrow_mut().insert(counter, owned);
        Ok(id)
    }

    /// Decodes an atom back into a term, through a per-query cache.
    pub fn decode_term(&self, atom: AtomId) -> Result<Term, QueryEvaluationError> {
        if atom.is_local() {
            return self
                .extra_terms
                .borrow()
                .get(&atom.counter())
                .cloned()
                .ok_or_else(|| {
                    QueryEvaluationError::Unexpected(
                        "dangling query-local atom id".into(),
                    )
                });
        }
        if let Some(term) = self.term_cache.borrow().get(&atom) {
            return Ok(term.clone());
        }
        let term = self.reader.decode_term(atom)?;
        self.term_cache.borrow_mut().insert(atom, term.clone());
        Ok(term)
    }

    /// Pattern scan under a temporal filter.
    ///
    /// `None` as the graph ranges over the named graphs, `Some(None)` is
    /// the default graph (or its `FROM` stand-ins), `Some(Some(g))` one
    /// specific graph.
    pub fn quads_for_pattern(
        &self,
        subject: Option<AtomId>,
        predicate: Option<AtomId>,
        object: Option<AtomId>,
        graph: Option<Option<AtomId>>,
        temporal: TemporalFilter,
    ) -> Box<dyn Iterator<Item = Result<EncodedQuad, StorageError>>> {
        // A query-local id in a bound position cannot match anything.
        if subject.is_some_and(AtomId::is_local)
            || predicate.is_some_and(AtomId::is_local)
            || object.is_some_and(AtomId::is_local)
            || graph.flatten().is_some_and(AtomId::is_local)
        {
            return Box::new(std::iter::empty());
        }
        match graph {
            Some(Some(g)) => Box::new(self.reader.quads_for_pattern(
                subject,
                predicate,
                object,
                Some(g),
                temporal,
            )),
            Some(None) => match &self.default_graphs {
                None => Box::new(self.reader.quads_for_pattern(
                    subject,
                    predicate,
                    object,
                    Some(AtomId::DEFAULT_GRAPH),
                    temporal,
                )),
                Some(graphs) => {
                    let scans: Vec<_> = graphs
                        .iter()
                        .map(|g| {
                            self.reader.quads_for_pattern(
                                subject,
                                predicate,
                                object,
                                Some(*g),
                                temporal,
                            )
                        })
                        .collect();
                    // The default graph of the query is the merge: quads
                    // resurface with the default graph position.
                    Box::new(scans.into_iter().flatten().map(|quad| {
                        let mut quad = quad?;
                        quad.graph = AtomId::DEFAULT_GRAPH;
                        Ok(quad)
                    }))
                }
            },
            None => match &self.named_graphs {
                None => Box::new(
                    self.reader
                        .quads_for_pattern(subject, predicate, object, None, temporal)
                        .filter(|quad| {
                            quad.as_ref()
                                .map_or(true, |q| !q.graph.is_default_graph())
                        }),
                ),
                Some(graphs) => {
                    let scans: Vec<_> = graphs
                        .iter()
                        .map(|g| {
                            self.reader.quads_for_pattern(
                                subject,
                                predicate,
                                object,
                                Some(*g),
                                temporal,
                            )
                        })
                        .collect();
                    Box::new(scans.into_iter().flatten())
                }
            },
        }
    }

    /// Estimated matching entries, for join ordering. Query-local constants
    /// match nothing.
    pub fn estimate_pattern(
        &self,
        subject: Option<AtomId>,
        predicate: Option<AtomId>,
        object: Option<AtomId>,
        graph: Option<Option<AtomId>>,
    ) -> u64 {
        if subject.is_some_and(AtomId::is_local)
            || predicate.is_some_and(AtomId::is_local)
            || object.is_some_and(AtomId::is_local)
            || graph.flatten().is_some_and(AtomId::is_local)
        {
            return 0;
        }
        let graph = match graph {
            Some(Some(g)) => Some(g),
            Some(None) => Some(AtomId::DEFAULT_GRAPH),
            None => None,
        };
        self.reader
            .estimate_pattern(subject, predicate, object, graph)
            .unwrap_or(u64::MAX)
    }
}

fn lookup_graphs(
    reader: &StorageReader,
    graphs: &[NamedNode],
) -> Result<Vec<AtomId>, QueryEvaluationError> {
    let mut ids = Vec::with_capacity(graphs.len());
    for graph in graphs {
        if let Some(id) = reader.lookup_term(graph.as_ref().into())? {
            ids.push(id);
        }
    }
    Ok(ids)
}
