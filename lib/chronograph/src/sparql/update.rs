//! SPARQL Update evaluation.
//!
//! Every update runs inside one write batch: the caller commits on success
//! and rolls back on any error, so an update is all-or-nothing. `WHERE`
//! clauses are materialized against the batch's own state before any
//! template mutates it, which also gives read-your-writes between the
//! operations of one request.

use crate::loader;
use crate::model::{BlankNode, GraphName, NamedNode, Quad, QuadRef, Subject, Term, Variable};
use crate::sparql::error::UpdateEvaluationError;
use crate::sparql::{evaluate_pattern_solutions, UpdateOptions};
use crate::storage::atoms::AtomId;
use crate::storage::{StorageError, StorageTransaction};
use crate::temporal::{self, TemporalFilter, Timestamp};
use chronogebra::algebra::GraphTarget;
use chronogebra::term::{GraphNamePattern, GroundQuadPattern, NamedNodePattern, QuadPattern,
    TermPattern};
use chronogebra::{GraphUpdateOperation, Update};
use rustc_hash::FxHashMap;

pub(crate) struct UpdateEvaluator<'a, 'b> {
    transaction: &'a mut StorageTransaction<'b>,
    options: &'a UpdateOptions,
    now: Timestamp,
    affected: u64,
}

impl<'a, 'b> UpdateEvaluator<'a, 'b> {
    pub fn new(transaction: &'a mut StorageTransaction<'b>, options: &'a UpdateOptions) -> Self {
        Self {
            transaction,
            options,
            now: temporal::now(),
            affected: 0,
        }
    }

    /// Runs every operation in order; returns the number of logical writes.
    pub fn eval_all(&mut self, update: &Update) -> Result<u64, UpdateEvaluationError> {
        for operation in &update.operations {
            self.eval(operation)?;
        }
        Ok(self.affected)
    }

    fn eval(&mut self, operation: &GraphUpdateOperation) -> Result<(), UpdateEvaluationError> {
        match operation {
            GraphUpdateOperation::InsertData { data } => {
                let mut bnodes = FxHashMap::default();
                for quad in data {
                    let quad = relabel_quad(quad, &mut bnodes);
                    if self.transaction.insert_current(quad.as_ref(), self.now)? {
                        self.affected += 1;
                    }
                }
                Ok(())
            }
            GraphUpdateOperation::DeleteData { data } => {
                for quad in data {
                    let quad: Quad = quad.clone().into();
                    self.logical_delete(quad.as_ref())?;
                }
                Ok(())
            }
            GraphUpdateOperation::DeleteInsert {
                delete,
                insert,
                using,
                pattern,
            } => {
                let (variables, rows) = evaluate_pattern_solutions(
                    self.transaction.reader(),
                    pattern,
                    using.as_ref(),
                    &self.options.query_options,
                )?;
                for row in rows {
                    let bindings: FxHashMap<&Variable, &Term> = variables
                        .iter()
                        .zip(&row)
                        .filter_map(|(v, t)| Some((v, t.as_ref()?)))
                        .collect();
                    for template in delete {
                        if let Some(quad) = instantiate_ground_quad(template, &bindings) {
                            self.logical_delete(quad.as_ref())?;
                        }
                    }
                    let mut bnodes = FxHashMap::default();
                    for template in insert {
                        if let Some(quad) = instantiate_quad(template, &bindings, &mut bnodes) {
                            if self.transaction.insert_current(quad.as_ref(), self.now)? {
                                self.affected += 1;
                            }
                        }
                    }
                }
                Ok(())
            }
            GraphUpdateOperation::Load {
                silent,
                source,
                destination,
            } => match self.eval_load(source, destination) {
                Ok(()) => Ok(()),
                Err(_) if *silent => Ok(()),
                Err(error) => Err(error),
            },
            GraphUpdateOperation::Clear { silent, graph } => self.eval_clear(graph, *silent),
            GraphUpdateOperation::Create { silent, graph } => {
                if !silent && self.graph_has_content(graph)? {
                    return Err(UpdateEvaluationError::GraphAlreadyExists(graph.clone()));
                }
                Ok(())
            }
            // Graphs are implicit: DROP is CLEAR without extra bookkeeping.
            GraphUpdateOperation::Drop { silent, graph } => self.eval_clear(graph, *silent),
            GraphUpdateOperation::Copy {
                silent: _,
                source,
                destination,
            } => {
                if source == destination {
                    return Ok(());
                }
                self.clear_graph_atoms(self.resolve_graph(&destination.clone().into())?)?;
                self.copy_graph(source.clone().into(), destination.clone().into())
            }
            GraphUpdateOperation::Move {
                silent: _,
                source,
                destination,
            } => {
                if source == destination {
                    return Ok(());
                }
                self.clear_graph_atoms(self.resolve_graph(&destination.clone().into())?)?;
                self.copy_graph(source.clone().into(), destination.clone().into())?;
                self.clear_graph_atoms(self.resolve_graph(&source.clone().into())?)?;
                Ok(())
            }
            GraphUpdateOperation::Add {
                silent: _,
                source,
                destination,
            } => {
                if source == destination {
                    return Ok(());
                }
                self.copy_graph(source.clone().into(), destination.clone().into())
            }
        }
    }

    fn eval_load(
        &mut self,
        source: &NamedNode,
        destination: &GraphName,
    ) -> Result<(), UpdateEvaluationError> {
        let Some(document_loader) = &self.options.loader else {
            return Err(UpdateEvaluationError::NoDocumentLoader);
        };
        let quads = document_loader
            .load(source.as_str())
            .map_err(|error| UpdateEvaluationError::Load {
                iri: source.as_str().to_owned(),
                error,
            })?;
        for quad in loader::retarget(quads, destination) {
            if self.transaction.insert_current(quad.as_ref(), self.now)? {
                self.affected += 1;
            }
        }
        Ok(())
    }

    fn eval_clear(
        &mut self,
        target: &GraphTarget,
        silent: bool,
    ) -> Result<(), UpdateEvaluationError> {
        match target {
            GraphTarget::NamedNode(graph) => {
                let atom = self.transaction.lookup_graph_name(graph.as_ref().into())?;
                let atom = match atom {
                    Some(atom) if self.graph_atom_has_content(atom)? => atom,
                    _ if silent => return Ok(()),
                    _ => {
                        return Err(UpdateEvaluationError::GraphDoesNotExist(graph.clone()));
                    }
                };
                self.clear_graph_atoms(Some(atom))?;
                Ok(())
            }
            GraphTarget::DefaultGraph => {
                self.clear_graph_atoms(Some(AtomId::DEFAULT_GRAPH))?;
                Ok(())
            }
            GraphTarget::NamedGraphs => {
                for graph in self.named_graph_atoms()? {
                    self.clear_graph_atoms(Some(graph))?;
                }
                Ok(())
            }
            // ALL covers the named graphs and the default graph, following
            // the SPARQL 1.1 reading of `CLEAR ALL`.
            GraphTarget::AllGraphs => {
                for graph in self.named_graph_atoms()? {
                    self.clear_graph_atoms(Some(graph))?;
                }
                self.clear_graph_atoms(Some(AtomId::DEFAULT_GRAPH))?;
                Ok(())
            }
        }
    }

    /// Logically deletes every current quad of one graph.
    fn clear_graph_atoms(&mut self, graph: Option<AtomId>) -> Result<(), StorageError> {
        let Some(graph) = graph else {
            return Ok(());
        };
        let reader = self.transaction.reader();
        let current: Vec<_> = reader
            .quads_for_pattern(None, None, None, Some(graph), TemporalFilter::AsOf(self.now))
            .collect::<Result<_, _>>()?;
        for quad in current {
            self.affected += self.transaction.close_versions(
                quad.graph,
                quad.subject,
                quad.predicate,
                quad.object,
                self.now,
            )?;
        }
        Ok(())
    }

    fn copy_graph(
        &mut self,
        source: GraphName,
        destination: GraphName,
    ) -> Result<(), UpdateEvaluationError> {
        let Some(source) = self.resolve_graph(&source)? else {
            return Ok(());
        };
        let destination = match &destination {
            GraphName::DefaultGraph => AtomId::DEFAULT_GRAPH,
            GraphName::NamedNode(node) => self.transaction.insert_term(node.as_ref().into())?,
            GraphName::BlankNode(node) => self.transaction.insert_term(node.as_ref().into())?,
        };
        let reader = self.transaction.reader();
        let current: Vec<_> = reader
            .quads_for_pattern(None, None, None, Some(source), TemporalFilter::AsOf(self.now))
            .collect::<Result<Vec<_>, _>>()?;
        for quad in current {
            if self.transaction.insert_current_atoms(
                destination,
                quad.subject,
                quad.predicate,
                quad.object,
                self.now,
            )? {
                self.affected += 1;
            }
        }
        Ok(())
    }

    fn resolve_graph(&self, graph: &GraphName) -> Result<Option<AtomId>, StorageError> {
        match graph {
            GraphName::DefaultGraph => Ok(Some(AtomId::DEFAULT_GRAPH)),
            GraphName::NamedNode(node) => self.transaction.lookup_term(node.as_ref().into()),
            GraphName::BlankNode(node) => self.transaction.lookup_term(node.as_ref().into()),
        }
    }

    fn graph_has_content(&self, graph: &NamedNode) -> Result<bool, StorageError> {
        match self.transaction.lookup_term(graph.as_ref().into())? {
            Some(atom) => self.graph_atom_has_content(atom),
            None => Ok(false),
        }
    }

    fn graph_atom_has_content(&self, graph: AtomId) -> Result<bool, StorageError> {
        Ok(self
            .transaction
            .reader()
            .quads_for_pattern(None, None, None, Some(graph), TemporalFilter::AsOf(self.now))
            .next()
            .transpose()?
            .is_some())
    }

    fn named_graph_atoms(&self) -> Result<Vec<AtomId>, StorageError> {
        self.transaction.reader().named_graphs().collect()
    }

    fn logical_delete(&mut self, quad: QuadRef<'_>) -> Result<(), StorageError> {
        let Some(graph) = self.transaction.lookup_graph_name(quad.graph_name)? else {
            return Ok(());
        };
        let Some(subject) = self.transaction.lookup_term(quad.subject.into())? else {
            return Ok(());
        };
        let Some(predicate) = self.transaction.lookup_term(quad.predicate.into())? else {
            return Ok(());
        };
        let Some(object) = self.transaction.lookup_term(quad.object)? else {
            return Ok(());
        };
        self.affected += self
            .transaction
            .close_versions(graph, subject, predicate, object, self.now)?;
        Ok(())
    }
}

/// Fresh blank nodes per `INSERT DATA` execution, as the update semantics
/// require.
fn relabel_quad(quad: &Quad, bnodes: &mut FxHashMap<String, BlankNode>) -> Quad {
    let mut relabel = |node: &BlankNode| {
        bnodes
            .entry(node.as_str().to_owned())
            .or_insert_with(BlankNode::default)
            .clone()
    };
    Quad {
        subject: match &quad.subject {
            Subject::BlankNode(node) => relabel(node).into(),
            subject => subject.clone(),
        },
        predicate: quad.predicate.clone(),
        object: match &quad.object {
            Term::BlankNode(node) => relabel(node).clone().into(),
            object => object.clone(),
        },
        graph_name: match &quad.graph_name {
            GraphName::BlankNode(node) => relabel(node).into(),
            graph_name => graph_name.clone(),
        },
    }
}

fn instantiate_ground_quad(
    template: &GroundQuadPattern,
    bindings: &FxHashMap<&Variable, &Term>,
) -> Option<Quad> {
    let subject = match instantiate_term(&template.subject, bindings)? {
        Term::NamedNode(node) => Subject::NamedNode(node),
        // Blank nodes are not allowed in DELETE templates.
        _ => return None,
    };
    let predicate = instantiate_named(&template.predicate, bindings)?;
    let object = instantiate_term(&template.object, bindings)?;
    let graph_name = instantiate_graph(&template.graph_name, bindings)?;
    Some(Quad {
        subject,
        predicate,
        object,
        graph_name,
    })
}

fn instantiate_quad(
    template: &QuadPattern,
    bindings: &FxHashMap<&Variable, &Term>,
    bnodes: &mut FxHashMap<String, BlankNode>,
) -> Option<Quad> {
    let subject = match &template.subject {
        TermPattern::BlankNode(node) => Subject::BlankNode(
            bnodes
                .entry(node.as_str().to_owned())
                .or_insert_with(BlankNode::default)
                .clone(),
        ),
        term => match instantiate_term(term, bindings)? {
            Term::NamedNode(node) => Subject::NamedNode(node),
            Term::BlankNode(node) => Subject::BlankNode(node),
            Term::Literal(_) => return None,
        },
    };
    let predicate = instantiate_named(&template.predicate, bindings)?;
    let object = match &template.object {
        TermPattern::BlankNode(node) => bnodes
            .entry(node.as_str().to_owned())
            .or_insert_with(BlankNode::default)
            .clone()
            .into(),
        term => instantiate_term(term, bindings)?,
    };
    let graph_name = instantiate_graph(&template.graph_name, bindings)?;
    Some(Quad {
        subject,
        predicate,
        object,
        graph_name,
    })
}

fn instantiate_term(
    term: &TermPattern,
    bindings: &FxHashMap<&Variable, &Term>,
) -> Option<Term> {
    match term {
        TermPattern::NamedNode(node) => Some(node.clone().into()),
        TermPattern::Literal(literal) => Some(literal.clone().into()),
        TermPattern::Variable(v) => bindings.get(v).map(|t| (*t).clone()),
        TermPattern::BlankNode(_) | TermPattern::QuotedTriple(_) => None,
    }
}

fn instantiate_named(
    pattern: &NamedNodePattern,
    bindings: &FxHashMap<&Variable, &Term>,
) -> Option<NamedNode> {
    match pattern {
        NamedNodePattern::NamedNode(node) => Some(node.clone()),
        NamedNodePattern::Variable(v) => match bindings.get(v) {
            Some(Term::NamedNode(node)) => Some(node.clone()),
            _ => None,
        },
    }
}

fn instantiate_graph(
    pattern: &GraphNamePattern,
    bindings: &FxHashMap<&Variable, &Term>,
) -> Option<GraphName> {
    match pattern {
        GraphNamePattern::NamedNode(node) => Some(node.clone().into()),
        GraphNamePattern::DefaultGraph => Some(GraphName::DefaultGraph),
        GraphNamePattern::Variable(v) => match bindings.get(v) {
            Some(Term::NamedNode(node)) => Some(node.clone().into()),
            Some(Term::BlankNode(node)) => Some(node.clone().into()),
            _ => None,
        },
    }
}
