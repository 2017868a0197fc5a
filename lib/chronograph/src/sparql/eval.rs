//! The pull-based plan evaluator.
//!
//! [`SimpleEvaluator::eval_plan`] dispatches on the closed [`PlanNode`] sum
//! and returns a boxed lazy iterator of solution tuples; operators compose
//! by wrapping each other's iterators. Expression evaluation follows the
//! SPARQL error-as-unbound convention: `None` is an evaluation error,
//! absorbed by `FILTER` and `BIND` and propagated everywhere else.

use crate::model::{BlankNode, Literal, NamedNode, Subject, Term, Triple, Variable};
use crate::sparql::dataset::DatasetView;
use crate::sparql::error::QueryEvaluationError;
use crate::sparql::expression::{
    add, boolean_term, compatible_string_pair, divide, double_term, effective_boolean_value,
    float_term, integer_term, multiply, numeric_pair, numeric_term, numeric_value, order_cmp,
    plain_literal, string_literal, string_value, subtract, value_equals, value_partial_cmp,
    Numeric,
};
use crate::sparql::model::{QuerySolutionIter, QueryTripleIter};
use crate::sparql::plan::{
    CastKind, Comparator, EncodedTuple, JoinStrategy, PatternValue, PlanAggregation,
    PlanAggregationFunction, PlanExpression, PlanNode, PlanPropertyPath, TripleTemplate,
    TripleTemplateValue,
};
use crate::sparql::service::ServiceHandlerRegistry;
use crate::storage::atoms::AtomId;
use crate::temporal::{self, TemporalFilter};
use oxrdf::vocab::{rdf, xsd};
use oxsdatatypes::{Boolean, Decimal, Double, Float, Integer};
use regex::RegexBuilder;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::Cell;
use std::cmp::Ordering;
use std::iter::once;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type EncodedTuplesIterator =
    Box<dyn Iterator<Item = Result<EncodedTuple, QueryEvaluationError>>>;
type PathPairsIterator = Box<dyn Iterator<Item = Result<(AtomId, AtomId), QueryEvaluationError>>>;

/// Everything an execution shares: the dataset view, the service registry
/// and the resource budgets.
pub struct EvalContext {
    pub dataset: Rc<DatasetView>,
    pub services: Rc<ServiceHandlerRegistry>,
    pub path_budget: usize,
    pub deadline: Option<(Instant, Duration)>,
    steps: Cell<usize>,
}

impl EvalContext {
    pub fn new(
        dataset: Rc<DatasetView>,
        services: Rc<ServiceHandlerRegistry>,
        path_budget: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            dataset,
            services,
            path_budget,
            deadline: timeout.map(|t| (Instant::now() + t, t)),
            steps: Cell::new(0),
        }
    }

    fn charge_path_step(&self) -> Result<(), QueryEvaluationError> {
        let steps = self.steps.get() + 1;
        self.steps.set(steps);
        if steps > self.path_budget {
            Err(QueryEvaluationError::PathBudgetExceeded(self.path_budget))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct SimpleEvaluator {
    context: Rc<EvalContext>,
}

impl SimpleEvaluator {
    pub fn new(context: Rc<EvalContext>) -> Self {
        Self { context }
    }

    fn dataset(&self) -> &Rc<DatasetView> {
        &self.context.dataset
    }

    pub fn eval_plan(&self, node: &Rc<PlanNode>, from: EncodedTuple) -> EncodedTuplesIterator {
        match node.as_ref() {
            PlanNode::Init => Box::new(once(Ok(from))),
            PlanNode::StaticBindings { tuples } => {
                let tuples = tuples.clone();
                Box::new(
                    tuples
                        .into_iter()
                        .filter_map(move |tuple| from.combine_with(&tuple).map(Ok)),
                )
            }
            PlanNode::QuadPattern {
                child,
                subject,
                predicate,
                object,
                graph,
                temporal,
            } => {
                let eval = self.clone();
                let (subject, predicate, object, graph, temporal) =
                    (*subject, *predicate, *object, *graph, *temporal);
                Box::new(self.eval_plan(child, from).flat_map(move |tuple| {
                    match tuple {
                        Ok(tuple) => eval.eval_quad_pattern(
                            &tuple, subject, predicate, object, graph, temporal,
                        ),
                        Err(error) => Box::new(once(Err(error))),
                    }
                }))
            }
            PlanNode::PathPattern {
                child,
                subject,
                path,
                object,
                graph,
                temporal,
            } => {
                let eval = self.clone();
                let (subject, object, graph, temporal) = (*subject, *object, *graph, *temporal);
                let path = Rc::clone(path);
                Box::new(self.eval_plan(child, from).flat_map(move |tuple| {
                    match tuple {
                        Ok(tuple) => {
                            let start = get_pattern_value(subject, &tuple);
                            let end = get_pattern_value(object, &tuple);
                            let graph_spec = graph_specification(graph, &tuple);
                            let pairs =
                                eval.eval_path(&path, start, end, graph_spec, temporal);
                            let iter: EncodedTuplesIterator =
                                Box::new(pairs.filter_map(move |pair| match pair {
                                    Ok((s, o)) => {
                                        let mut new_tuple = tuple.clone();
                                        if !put_pattern_value(subject, s, &mut new_tuple)
                                            || !put_pattern_value(object, o, &mut new_tuple)
                                        {
                                            return None;
                                        }
                                        Some(Ok(new_tuple))
                                    }
                                    Err(error) => Some(Err(error)),
                                }));
                            iter
                        }
                        Err(error) => Box::new(once(Err(error))),
                    }
                }))
            }
            PlanNode::Join {
                left,
                right,
                strategy,
            } => match strategy {
                JoinStrategy::NestedLoop => {
                    let (left_values, errors) = collect_or_buffer(self.eval_plan(left, from.clone()));
                    Box::new(NestedLoopJoinIterator {
                        left: left_values,
                        right_iter: self.eval_plan(right, from),
                        buffered: errors,
                    })
                }
                JoinStrategy::Hash { keys } => {
                    let keys = Rc::clone(keys);
                    let mut buffered = Vec::new();
                    let mut table: FxHashMap<Vec<Option<AtomId>>, Vec<EncodedTuple>> =
                        FxHashMap::default();
                    for tuple in self.eval_plan(right, from.clone()) {
                        match tuple {
                            Ok(tuple) => {
                                let key = keys.iter().map(|k| tuple.get(*k)).collect();
                                table.entry(key).or_default().push(tuple);
                            }
                            Err(error) => buffered.push(Err(error)),
                        }
                    }
                    let left_iter = self.eval_plan(left, from);
                    Box::new(HashJoinIterator {
                        keys,
                        table,
                        left_iter,
                        buffered,
                        pending: Vec::new(),
                    })
                }
            },
            PlanNode::AntiJoin { left, right } => {
                let (right_values, _) = collect_or_buffer(self.eval_plan(right, from.clone()));
                Box::new(self.eval_plan(left, from).filter(move |tuple| {
                    tuple.as_ref().map_or(true, |tuple| {
                        !right_values.iter().any(|r| tuple.overlaps_compatibly(r))
                    })
                }))
            }
            PlanNode::LeftJoin {
                left,
                right,
                expression,
            } => Box::new(LeftJoinIterator {
                eval: self.clone(),
                right_plan: Rc::clone(right),
                expression: expression.clone(),
                left_iter: self.eval_plan(left, from),
                current: None,
            }),
            PlanNode::Filter { child, expression } => {
                let eval = self.clone();
                let expression = Rc::clone(expression);
                Box::new(self.eval_plan(child, from).filter(move |tuple| {
                    tuple.as_ref().map_or(true, |tuple| {
                        eval.eval_expression(&expression, tuple)
                            .and_then(|t| effective_boolean_value(&t))
                            .unwrap_or(false)
                    })
                }))
            }
            PlanNode::Union { left, right } => Box::new(
                self.eval_plan(left, from.clone())
                    .chain(self.eval_plan(right, from)),
            ),
            PlanNode::Extend {
                child,
                position,
                expression,
            } => {
                let eval = self.clone();
                let position = *position;
                let expression = Rc::clone(expression);
                Box::new(
                    self.eval_plan(child, from)
                        .filter_map(move |tuple| match tuple {
                            Ok(mut tuple) => {
                                if let Some(term) = eval.eval_expression(&expression, &tuple) {
                                    match eval.dataset().encode_term(term.as_ref()) {
                                        Ok(atom) => {
                                            if let Some(existing) = tuple.get(position) {
                                                if existing != atom {
                                                    return None;
                                                }
                                            }
                                            tuple.set(position, atom);
                                        }
                                        Err(error) => return Some(Err(error)),
                                    }
                                }
                                Some(Ok(tuple))
                            }
                            Err(error) => Some(Err(error)),
                        }),
                )
            }
            PlanNode::Sort { child, by } => {
                let eval = self.clone();
                let by = by.clone();
                let mut errors = Vec::new();
                let mut values = Vec::new();
                for tuple in self.eval_plan(child, from) {
                    match tuple {
                        Ok(tuple) => {
                            let keys: Vec<_> = by
                                .iter()
                                .map(|comparator| match comparator {
                                    Comparator::Asc(e) | Comparator::Desc(e) => {
                                        eval.eval_expression(e, &tuple)
                                    }
                                })
                                .collect();
                            values.push((keys, tuple));
                        }
                        Err(error) => errors.push(Err(error)),
                    }
                }
                values.sort_by(|(a, _), (b, _)| {
                    for (i, comparator) in by.iter().enumerate() {
                        let ordering = order_cmp(a[i].as_ref(), b[i].as_ref());
                        let ordering = match comparator {
                            Comparator::Asc(_) => ordering,
                            Comparator::Desc(_) => ordering.reverse(),
                        };
                        if ordering != Ordering::Equal {
                            return ordering;
                        }
                    }
                    Ordering::Equal
                });
                Box::new(
                    errors
                        .into_iter()
                        .chain(values.into_iter().map(|(_, tuple)| Ok(tuple))),
                )
            }
            PlanNode::HashDeduplicate { child } => {
                let mut seen = FxHashSet::default();
                Box::new(self.eval_plan(child, from).filter(move |tuple| {
                    tuple.as_ref().map_or(true, |tuple| seen.insert(tuple.clone()))
                }))
            }
            PlanNode::Skip { child, count } => Box::new(self.eval_plan(child, from).skip(*count)),
            PlanNode::Limit { child, count } => Box::new(self.eval_plan(child, from).take(*count)),
            PlanNode::Project { child, mapping } => {
                let mapping = Rc::clone(mapping);
                // A projection isolates its scope: the child starts from a
                // clean tuple and the surrounding join recombines.
                Box::new(
                    self.eval_plan(child, EncodedTuple::default())
                        .filter_map(move |tuple| match tuple {
                            Ok(tuple) => {
                                let mut new_tuple = EncodedTuple::with_capacity(mapping.len());
                                for (child_position, output_position) in mapping.iter() {
                                    if let Some(value) = tuple.get(*child_position) {
                                        new_tuple.set(*output_position, value);
                                    }
                                }
                                from.combine_with(&new_tuple).map(Ok)
                            }
                            Err(error) => Some(Err(error)),
                        }),
                )
            }
            PlanNode::Aggregate {
                child,
                key_mapping,
                aggregates,
            } => self.eval_aggregate(child, key_mapping, aggregates, from),
            PlanNode::Service {
                child,
                name,
                pattern,
                variables,
                silent,
            } => {
                let eval = self.clone();
                let name = *name;
                let pattern = Rc::clone(pattern);
                let variables = Rc::clone(variables);
                let silent = *silent;
                Box::new(self.eval_plan(child, from).flat_map(move |tuple| {
                    match tuple {
                        Ok(tuple) => {
                            eval.eval_service(&tuple, name, &pattern, &variables, silent)
                        }
                        Err(error) => Box::new(once(Err(error))),
                    }
                }))
            }
            PlanNode::ExistsFilter {
                child,
                pattern,
                negated,
            } => {
                let eval = self.clone();
                let pattern = Rc::clone(pattern);
                let negated = *negated;
                Box::new(self.eval_plan(child, from).filter(move |tuple| {
                    tuple.as_ref().map_or(true, |tuple| {
                        let found = eval
                            .eval_plan(&pattern, tuple.clone())
                            .next()
                            .is_some_and(|r| r.is_ok());
                        found != negated
                    })
                }))
            }
        }
    }

    fn eval_quad_pattern(
        &self,
        tuple: &EncodedTuple,
        subject: PatternValue,
        predicate: PatternValue,
        object: PatternValue,
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> EncodedTuplesIterator {
        let subject_value = get_pattern_value(subject, tuple);
        let predicate_value = get_pattern_value(predicate, tuple);
        let object_value = get_pattern_value(object, tuple);
        let graph_spec = graph_specification(graph, tuple);
        let tuple = tuple.clone();
        Box::new(
            self.dataset()
                .quads_for_pattern(
                    subject_value,
                    predicate_value,
                    object_value,
                    graph_spec,
                    temporal,
                )
                .filter_map(move |quad| match quad {
                    Ok(quad) => {
                        let mut new_tuple = tuple.clone();
                        if !put_pattern_value(subject, quad.subject, &mut new_tuple)
                            || !put_pattern_value(predicate, quad.predicate, &mut new_tuple)
                            || !put_pattern_value(object, quad.object, &mut new_tuple)
                            || !put_pattern_value(graph, quad.graph, &mut new_tuple)
                        {
                            return None;
                        }
                        Some(Ok(new_tuple))
                    }
                    Err(error) => Some(Err(error.into())),
                }),
        )
    }

    fn eval_aggregate(
        &self,
        child: &Rc<PlanNode>,
        key_mapping: &Rc<Vec<(usize, usize)>>,
        aggregates: &Rc<Vec<(PlanAggregation, usize)>>,
        from: EncodedTuple,
    ) -> EncodedTuplesIterator {
        let mut errors = Vec::new();
        let mut groups: FxHashMap<Vec<Option<AtomId>>, Vec<Accumulator>> = FxHashMap::default();
        for tuple in self.eval_plan(child, from) {
            let tuple = match tuple {
                Ok(tuple) => tuple,
                Err(error) => {
                    errors.push(Err(error));
                    continue;
                }
            };
            let key: Vec<_> = key_mapping
                .iter()
                .map(|(child_position, _)| tuple.get(*child_position))
                .collect();
            let accumulators = groups.entry(key).or_insert_with(|| {
                aggregates
                    .iter()
                    .map(|(aggregation, _)| Accumulator::new(aggregation))
                    .collect()
            });
            for ((aggregation, _), accumulator) in aggregates.iter().zip(accumulators) {
                let value = aggregation
                    .parameter
                    .as_ref()
                    .map(|e| self.eval_expression(e, &tuple));
                accumulator.add(value, &tuple);
            }
        }
        // Aggregates without GROUP BY always produce one group.
        if groups.is_empty() && key_mapping.is_empty() {
            groups.insert(
                Vec::new(),
                aggregates
                    .iter()
                    .map(|(aggregation, _)| Accumulator::new(aggregation))
                    .collect(),
            );
        }
        let eval = self.clone();
        let key_mapping = Rc::clone(key_mapping);
        let aggregates = Rc::clone(aggregates);
        Box::new(
            errors
                .into_iter()
                .chain(groups.into_iter().map(move |(key, accumulators)| {
                    let mut tuple = EncodedTuple::default();
                    for ((_, output_position), value) in key_mapping.iter().zip(key) {
                        if let Some(value) = value {
                            tuple.set(*output_position, value);
                        }
                    }
                    for ((_, output_position), accumulator) in
                        aggregates.iter().zip(accumulators)
                    {
                        if let Some(term) = accumulator.finish() {
                            let atom = eval.dataset().encode_term(term.as_ref())?;
                            tuple.set(*output_position, atom);
                        }
                    }
                    Ok(tuple)
                })),
        )
    }

    fn eval_service(
        &self,
        tuple: &EncodedTuple,
        name: PatternValue,
        pattern: &Rc<chronogebra::algebra::GraphPattern>,
        variables: &Rc<Vec<(Variable, usize)>>,
        silent: bool,
    ) -> EncodedTuplesIterator {
        let result = (|| {
            let endpoint_atom = get_pattern_value(name, tuple)
                .ok_or(QueryEvaluationError::UnboundService)?;
            let endpoint = match self.dataset().decode_term(endpoint_atom)? {
                Term::NamedNode(node) => node,
                term => return Err(QueryEvaluationError::InvalidServiceName(term)),
            };
            let Some(handler) = self.context.services.get(&endpoint) else {
                return Err(QueryEvaluationError::UnsupportedService(endpoint));
            };
            let solutions = handler
                .handle(endpoint, pattern)
                .map_err(QueryEvaluationError::Service)?;
            let mut tuples = Vec::with_capacity(solutions.len());
            for solution in solutions {
                let mut new_tuple = tuple.clone();
                let mut compatible = true;
                for (variable, term) in solution {
                    let Some((_, position)) =
                        variables.iter().find(|(v, _)| *v == variable)
                    else {
                        continue;
                    };
                    let atom = self.dataset().encode_term(term.as_ref())?;
                    if let Some(existing) = new_tuple.get(*position) {
                        if existing != atom {
                            compatible = false;
                            break;
                        }
                    }
                    new_tuple.set(*position, atom);
                }
                if compatible {
                    tuples.push(Ok(new_tuple));
                }
            }
            Ok(tuples)
        })();
        match result {
            Ok(tuples) => Box::new(tuples.into_iter()),
            Err(_) if silent => Box::new(std::iter::empty()),
            Err(error) => Box::new(once(Err(error))),
        }
    }

    // ---- property paths ----

    fn eval_path(
        &self,
        path: &Rc<PlanPropertyPath>,
        start: Option<AtomId>,
        end: Option<AtomId>,
        graph: Option<Option<AtomId>>,
        temporal: TemporalFilter,
    ) -> PathPairsIterator {
        match path.as_ref() {
            PlanPropertyPath::Predicate(predicate) => {
                let context = Rc::clone(&self.context);
                Box::new(
                    self.dataset()
                        .quads_for_pattern(start, Some(*predicate), end, graph, temporal)
                        .map(move |quad| {
                            context.charge_path_step()?;
                            let quad = quad?;
                            Ok((quad.subject, quad.object))
                        }),
                )
            }
            PlanPropertyPath::Inverse(inner) => Box::new(
                self.eval_path(inner, end, start, graph, temporal)
                    .map(|pair| pair.map(|(s, o)| (o, s))),
            ),
            PlanPropertyPath::Sequence(a, b) => {
                let eval = self.clone();
                let b = Rc::clone(b);
                if start.is_none() && end.is_some() {
                    // Anchor on the bound end and work backwards.
                    let a = Rc::clone(a);
                    return Box::new(
                        self.eval_path(&b, None, end, graph, temporal)
                            .flat_map(move |pair| -> PathPairsIterator {
                                match pair {
                                    Ok((middle, object)) => Box::new(
                                        eval.eval_path(&a, None, Some(middle), graph, temporal)
                                            .map(move |pair| {
                                                pair.map(|(subject, _)| (subject, object))
                                            }),
                                    ),
                                    Err(error) => Box::new(once(Err(error))),
                                }
                            }),
                    );
                }
                Box::new(self.eval_path(a, start, None, graph, temporal).flat_map(
                    move |pair| -> PathPairsIterator {
                        match pair {
                            Ok((subject, middle)) => Box::new(
                                eval.eval_path(&b, Some(middle), end, graph, temporal)
                                    .map(move |pair| pair.map(|(_, object)| (subject, object))),
                            ),
                            Err(error) => Box::new(once(Err(error))),
                        }
                    },
                ))
            }
            PlanPropertyPath::Alternative(a, b) => Box::new(
                self.eval_path(a, start, end, graph, temporal)
                    .chain(self.eval_path(b, start, end, graph, temporal)),
            ),
            PlanPropertyPath::ZeroOrOne(inner) => {
                let trivial: PathPairsIterator = match (start, end) {
                    (Some(s), Some(e)) => {
                        if s == e {
                            Box::new(once(Ok((s, s))))
                        } else {
                            Box::new(std::iter::empty())
                        }
                    }
                    (Some(s), None) => Box::new(once(Ok((s, s)))),
                    (None, Some(e)) => Box::new(once(Ok((e, e)))),
                    (None, None) => {
                        let nodes = self.graph_nodes(graph, temporal);
                        Box::new(nodes.map(|node| node.map(|n| (n, n))))
                    }
                };
                Box::new(hash_deduplicate(
                    trivial.chain(self.eval_path(inner, start, end, graph, temporal)),
                ))
            }
            PlanPropertyPath::ZeroOrMore(inner) => {
                self.eval_closure(inner, start, end, graph, temporal, true)
            }
            PlanPropertyPath::OneOrMore(inner) => {
                self.eval_closure(inner, start, end, graph, temporal, false)
            }
            PlanPropertyPath::NegatedPropertySet(predicates) => {
                let predicates = Rc::clone(predicates);
                let context = Rc::clone(&self.context);
                Box::new(
                    self.dataset()
                        .quads_for_pattern(start, None, end, graph, temporal)
                        .filter_map(move |quad| match quad {
                            Ok(quad) => {
                                if let Err(error) = context.charge_path_step() {
                                    return Some(Err(error));
                                }
                                if predicates.contains(&quad.predicate) {
                                    None
                                } else {
                                    Some(Ok((quad.subject, quad.object)))
                                }
                            }
                            Err(error) => Some(Err(error.into())),
                        }),
                )
            }
        }
    }

    /// Transitive closure by breadth-first frontier expansion with a
    /// visited set; `with_zero` additionally yields the trivial pair.
    fn eval_closure(
        &self,
        inner: &Rc<PlanPropertyPath>,
        start: Option<AtomId>,
        end: Option<AtomId>,
        graph: Option<Option<AtomId>>,
        temporal: TemporalFilter,
        with_zero: bool,
    ) -> PathPairsIterator {
        let starts: Vec<AtomId> = match (start, end) {
            (Some(s), _) => vec![s],
            (None, Some(_)) => {
                // Walk backwards from the bound end over the inverse path.
                let inverse = Rc::new(PlanPropertyPath::Inverse(Rc::clone(inner)));
                let swapped = self.eval_closure(&inverse, end, start, graph, temporal, with_zero);
                return Box::new(swapped.map(|pair| pair.map(|(a, b)| (b, a))));
            }
            (None, None) => {
                let mut nodes = Vec::new();
                for node in self.graph_nodes(graph, temporal) {
                    match node {
                        Ok(node) => nodes.push(node),
                        Err(error) => return Box::new(once(Err(error))),
                    }
                }
                nodes
            }
        };
        let mut results = Vec::new();
        for origin in starts {
            let mut visited = FxHashSet::default();
            let mut frontier = vec![origin];
            if with_zero {
                results.push(Ok((origin, origin)));
            }
            visited.insert(origin);
            while let Some(node) = frontier.pop() {
                if let Err(error) = self.context.charge_path_step() {
                    return Box::new(once(Err(error)));
                }
                for pair in self.eval_path(inner, Some(node), None, graph, temporal) {
                    match pair {
                        Ok((_, reached)) => {
                            if visited.insert(reached) {
                                results.push(Ok((origin, reached)));
                                frontier.push(reached);
                            } else if with_zero && reached == origin {
                                // Already recorded as the trivial pair.
                            } else if !with_zero
                                && reached == origin
                                && !results
                                    .iter()
                                    .any(|r| matches!(r, Ok(p) if *p == (origin, origin)))
                            {
                                // A cycle re-reaches the origin through one
                                // or more steps.
                                results.push(Ok((origin, origin)));
                            }
                        }
                        Err(error) => return Box::new(once(Err(error))),
                    }
                }
            }
        }
        let filtered = results
            .into_iter()
            .filter(move |pair| match (pair, end) {
                (Ok((_, reached)), Some(end)) => *reached == end,
                _ => true,
            });
        Box::new(filtered)
    }

    /// Every node (subject or object position) of the scoped graphs; the
    /// domain of `?x path{0} ?x`.
    fn graph_nodes(
        &self,
        graph: Option<Option<AtomId>>,
        temporal: TemporalFilter,
    ) -> Box<dyn Iterator<Item = Result<AtomId, QueryEvaluationError>>> {
        let mut nodes = FxHashSet::default();
        let mut error = None;
        for quad in self
            .dataset()
            .quads_for_pattern(None, None, None, graph, temporal)
        {
            match quad {
                Ok(quad) => {
                    nodes.insert(quad.subject);
                    nodes.insert(quad.object);
                }
                Err(e) => {
                    error = Some(e.into());
                    break;
                }
            }
        }
        Box::new(error.map(Err).into_iter().chain(nodes.into_iter().map(Ok)))
    }

    // ---- expressions ----

    pub fn eval_expression(&self, expression: &PlanExpression, tuple: &EncodedTuple) -> Option<Term> {
        match expression {
            PlanExpression::Constant(atom) => self.dataset().decode_term(*atom).ok(),
            PlanExpression::Variable(v) => {
                self.dataset().decode_term(tuple.get(*v)?).ok()
            }
            PlanExpression::Bound(v) => Some(boolean_term(tuple.contains(*v))),
            PlanExpression::Or(a, b) => {
                match self
                    .eval_expression(a, tuple)
                    .and_then(|t| effective_boolean_value(&t))
                {
                    Some(true) => Some(boolean_term(true)),
                    Some(false) => self
                        .eval_expression(b, tuple)
                        .and_then(|t| effective_boolean_value(&t))
                        .map(boolean_term),
                    None => match self
                        .eval_expression(b, tuple)
                        .and_then(|t| effective_boolean_value(&t))
                    {
                        Some(true) => Some(boolean_term(true)),
                        _ => None,
                    },
                }
            }
            PlanExpression::And(a, b) => {
                match self
                    .eval_expression(a, tuple)
                    .and_then(|t| effective_boolean_value(&t))
                {
                    Some(false) => Some(boolean_term(false)),
                    Some(true) => self
                        .eval_expression(b, tuple)
                        .and_then(|t| effective_boolean_value(&t))
                        .map(boolean_term),
                    None => match self
                        .eval_expression(b, tuple)
                        .and_then(|t| effective_boolean_value(&t))
                    {
                        Some(false) => Some(boolean_term(false)),
                        _ => None,
                    },
                }
            }
            PlanExpression::Equal(a, b) => {
                let a = self.eval_expression(a, tuple)?;
                let b = self.eval_expression(b, tuple)?;
                value_equals(&a, &b).map(boolean_term)
            }
            PlanExpression::SameTerm(a, b) => {
                let a = self.eval_expression(a, tuple)?;
                let b = self.eval_expression(b, tuple)?;
                Some(boolean_term(a == b))
            }
            PlanExpression::Greater(a, b) => self
                .cmp_terms(a, b, tuple)
                .map(|o| boolean_term(o == Ordering::Greater)),
            PlanExpression::GreaterOrEqual(a, b) => self
                .cmp_terms(a, b, tuple)
                .map(|o| boolean_term(o != Ordering::Less)),
            PlanExpression::Less(a, b) => self
                .cmp_terms(a, b, tuple)
                .map(|o| boolean_term(o == Ordering::Less)),
            PlanExpression::LessOrEqual(a, b) => self
                .cmp_terms(a, b, tuple)
                .map(|o| boolean_term(o != Ordering::Greater)),
            PlanExpression::In(a, bs) => {
                let a = self.eval_expression(a, tuple)?;
                let mut error = false;
                for b in bs {
                    match self
                        .eval_expression(b, tuple)
                        .and_then(|b| value_equals(&a, &b))
                    {
                        Some(true) => return Some(boolean_term(true)),
                        Some(false) => {}
                        None => error = true,
                    }
                }
                if error {
                    None
                } else {
                    Some(boolean_term(false))
                }
            }
            PlanExpression::Add(a, b) => add(self.numeric_operands(a, b, tuple)?),
            PlanExpression::Subtract(a, b) => subtract(self.numeric_operands(a, b, tuple)?),
            PlanExpression::Multiply(a, b) => multiply(self.numeric_operands(a, b, tuple)?),
            PlanExpression::Divide(a, b) => divide(self.numeric_operands(a, b, tuple)?),
            PlanExpression::UnaryPlus(e) => {
                let value = numeric_value(&self.eval_expression(e, tuple)?)?;
                Some(numeric_term(value))
            }
            PlanExpression::UnaryMinus(e) => {
                let value = numeric_value(&self.eval_expression(e, tuple)?)?;
                Some(match value {
                    Numeric::Integer(v) => integer_term(Integer::from(0_i64).checked_sub(v)?),
                    Numeric::Decimal(v) => {
                        crate::sparql::expression::decimal_term(
                            Decimal::from(0_i64).checked_sub(v)?,
                        )
                    }
                    Numeric::Float(v) => float_term(-v),
                    Numeric::Double(v) => double_term(-v),
                })
            }
            PlanExpression::Not(e) => {
                let value = effective_boolean_value(&self.eval_expression(e, tuple)?)?;
                Some(boolean_term(!value))
            }
            PlanExpression::If(condition, then, otherwise) => {
                let condition =
                    effective_boolean_value(&self.eval_expression(condition, tuple)?)?;
                if condition {
                    self.eval_expression(then, tuple)
                } else {
                    self.eval_expression(otherwise, tuple)
                }
            }
            PlanExpression::Coalesce(expressions) => expressions
                .iter()
                .find_map(|e| self.eval_expression(e, tuple)),
            PlanExpression::Exists(plan) => {
                let found = self
                    .eval_plan(plan, tuple.clone())
                    .next()
                    .is_some_and(|r| r.is_ok());
                Some(boolean_term(found))
            }
            PlanExpression::Str(e) => Some(
                Literal::new_simple_literal(string_value(&self.eval_expression(e, tuple)?)).into(),
            ),
            PlanExpression::Lang(e) => match self.eval_expression(e, tuple)? {
                Term::Literal(literal) => Some(
                    Literal::new_simple_literal(literal.language().unwrap_or("")).into(),
                ),
                _ => None,
            },
            PlanExpression::LangMatches(tag, range) => {
                let tag = simple_string(&self.eval_expression(tag, tuple)?)?;
                let range = simple_string(&self.eval_expression(range, tuple)?)?;
                Some(boolean_term(if range == "*" {
                    !tag.is_empty()
                } else {
                    let tag = tag.to_ascii_lowercase();
                    let range = range.to_ascii_lowercase();
                    tag == range || (tag.starts_with(&range) && tag.as_bytes().get(range.len()) == Some(&b'-'))
                }))
            }
            PlanExpression::Datatype(e) => match self.eval_expression(e, tuple)? {
                Term::Literal(literal) => Some(
                    if literal.language().is_some() {
                        NamedNode::from(rdf::LANG_STRING).into()
                    } else {
                        NamedNode::from(literal.datatype()).into()
                    },
                ),
                _ => None,
            },
            PlanExpression::Iri(e) => match self.eval_expression(e, tuple)? {
                Term::NamedNode(node) => Some(node.into()),
                Term::Literal(literal)
                    if literal.language().is_none() && literal.datatype() == xsd::STRING =>
                {
                    NamedNode::new(literal.value()).ok().map(Term::from)
                }
                _ => None,
            },
            PlanExpression::BNode(id) => match id {
                Some(id) => {
                    let label = simple_string(&self.eval_expression(id, tuple)?)?;
                    BlankNode::new(label).ok().map(Term::from)
                }
                None => Some(BlankNode::default().into()),
            },
            PlanExpression::Abs(e) => {
                Some(match numeric_value(&self.eval_expression(e, tuple)?)? {
                    Numeric::Integer(v) => integer_term(if v < Integer::from(0_i64) {
                        Integer::from(0_i64).checked_sub(v)?
                    } else {
                        v
                    }),
                    Numeric::Decimal(v) => {
                        crate::sparql::expression::decimal_term(if v < Decimal::from(0_i64) {
                            Decimal::from(0_i64).checked_sub(v)?
                        } else {
                            v
                        })
                    }
                    Numeric::Float(v) => float_term(v.abs()),
                    Numeric::Double(v) => double_term(v.abs()),
                })
            }
            PlanExpression::Ceil(e) => {
                Some(match numeric_value(&self.eval_expression(e, tuple)?)? {
                    Numeric::Integer(v) => integer_term(v),
                    Numeric::Decimal(v) => {
                        crate::sparql::expression::decimal_term(v.checked_ceil()?)
                    }
                    Numeric::Float(v) => float_term(v.ceil()),
                    Numeric::Double(v) => double_term(v.ceil()),
                })
            }
            PlanExpression::Floor(e) => {
                Some(match numeric_value(&self.eval_expression(e, tuple)?)? {
                    Numeric::Integer(v) => integer_term(v),
                    Numeric::Decimal(v) => {
                        crate::sparql::expression::decimal_term(v.checked_floor()?)
                    }
                    Numeric::Float(v) => float_term(v.floor()),
                    Numeric::Double(v) => double_term(v.floor()),
                })
            }
            PlanExpression::Round(e) => {
                Some(match numeric_value(&self.eval_expression(e, tuple)?)? {
                    Numeric::Integer(v) => integer_term(v),
                    Numeric::Decimal(v) => {
                        crate::sparql::expression::decimal_term(v.checked_round()?)
                    }
                    Numeric::Float(v) => float_term(v.round()),
                    Numeric::Double(v) => double_term(v.round()),
                })
            }
            PlanExpression::Concat(expressions) => {
                let mut result = String::new();
                let mut language: Option<Option<String>> = None;
                for e in expressions {
                    let value = self.eval_expression(e, tuple)?;
                    let (text, lang) = string_literal(&value)?;
                    match &language {
                        None => language = Some(lang.map(ToOwned::to_owned)),
                        Some(existing) => {
                            if existing.as_deref() != lang {
                                language = Some(None);
                            }
                        }
                    }
                    result.push_str(text);
                }
                Some(plain_literal(
                    result,
                    language.flatten().as_deref(),
                ))
            }
            PlanExpression::SubStr(source, starting, length) => {
                let source = self.eval_expression(source, tuple)?;
                let (text, lang) = string_literal(&source)?;
                let starting = self.integer_argument(starting, tuple)?;
                let length = match length {
                    Some(length) => Some(self.integer_argument(length, tuple)?),
                    None => None,
                };
                // XPath substring: 1-based, clamped.
                let skip = usize::try_from((starting - 1).max(0)).ok()?;
                let taken: String = match length {
                    Some(length) => {
                        let take = usize::try_from((length + (starting - 1).min(0)).max(0)).ok()?;
                        text.chars().skip(skip).take(take).collect()
                    }
                    None => text.chars().skip(skip).collect(),
                };
                Some(plain_literal(taken, lang))
            }
            PlanExpression::StrLen(e) => {
                let value = self.eval_expression(e, tuple)?;
                let (text, _) = string_literal(&value)?;
                Some(integer_term(Integer::from(
                    i64::try_from(text.chars().count()).ok()?,
                )))
            }
            PlanExpression::Replace(source, pattern, replacement, flags) => {
                let source = self.eval_expression(source, tuple)?;
                let (text, lang) = string_literal(&source)?;
                let regex = self.compile_regex(pattern, flags.as_deref(), tuple)?;
                let replacement = self.eval_expression(replacement, tuple)?;
                let replacement = simple_string(&replacement)?;
                Some(plain_literal(
                    regex.replace_all(text, replacement.as_str()).into_owned(),
                    lang,
                ))
            }
            PlanExpression::UCase(e) => {
                let value = self.eval_expression(e, tuple)?;
                let (text, lang) = string_literal(&value)?;
                Some(plain_literal(text.to_uppercase(), lang))
            }
            PlanExpression::LCase(e) => {
                let value = self.eval_expression(e, tuple)?;
                let (text, lang) = string_literal(&value)?;
                Some(plain_literal(text.to_lowercase(), lang))
            }
            PlanExpression::EncodeForUri(e) => {
                let value = self.eval_expression(e, tuple)?;
                let (text, _) = string_literal(&value)?;
                let mut result = String::with_capacity(text.len());
                for byte in text.bytes() {
                    if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
                        result.push(char::from(byte));
                    } else {
                        result.push('%');
                        result.push(char::from_digit(u32::from(byte) / 16, 16)?.to_ascii_uppercase());
                        result.push(char::from_digit(u32::from(byte) % 16, 16)?.to_ascii_uppercase());
                    }
                }
                Some(Literal::new_simple_literal(result).into())
            }
            PlanExpression::Contains(a, b) => {
                let a = self.eval_expression(a, tuple)?;
                let b = self.eval_expression(b, tuple)?;
                let (haystack, needle, _) = compatible_string_pair(&a, &b)?;
                Some(boolean_term(haystack.contains(needle)))
            }
            PlanExpression::StrStarts(a, b) => {
                let a = self.eval_expression(a, tuple)?;
                let b = self.eval_expression(b, tuple)?;
                let (haystack, needle, _) = compatible_string_pair(&a, &b)?;
                Some(boolean_term(haystack.starts_with(needle)))
            }
            PlanExpression::StrEnds(a, b) => {
                let a = self.eval_expression(a, tuple)?;
                let b = self.eval_expression(b, tuple)?;
                let (haystack, needle, _) = compatible_string_pair(&a, &b)?;
                Some(boolean_term(haystack.ends_with(needle)))
            }
            PlanExpression::StrBefore(a, b) => {
                let a = self.eval_expression(a, tuple)?;
                let b = self.eval_expression(b, tuple)?;
                let (haystack, needle, lang) = compatible_string_pair(&a, &b)?;
                Some(match haystack.find(needle) {
                    Some(position) => plain_literal(&haystack[..position], lang),
                    None => Literal::new_simple_literal("").into(),
                })
            }
            PlanExpression::StrAfter(a, b) => {
                let a = self.eval_expression(a, tuple)?;
                let b = self.eval_expression(b, tuple)?;
                let (haystack, needle, lang) = compatible_string_pair(&a, &b)?;
                Some(match haystack.find(needle) {
                    Some(position) => plain_literal(&haystack[position + needle.len()..], lang),
                    None => Literal::new_simple_literal("").into(),
                })
            }
            PlanExpression::StrLang(value, lang) => {
                let value = simple_string(&self.eval_expression(value, tuple)?)?;
                let lang = simple_string(&self.eval_expression(lang, tuple)?)?;
                Literal::new_language_tagged_literal(value, lang)
                    .ok()
                    .map(Term::from)
            }
            PlanExpression::StrDt(value, datatype) => {
                let value = simple_string(&self.eval_expression(value, tuple)?)?;
                match self.eval_expression(datatype, tuple)? {
                    Term::NamedNode(datatype) => {
                        Some(Literal::new_typed_literal(value, datatype).into())
                    }
                    _ => None,
                }
            }
            PlanExpression::IsIri(e) => Some(boolean_term(matches!(
                self.eval_expression(e, tuple)?,
                Term::NamedNode(_)
            ))),
            PlanExpression::IsBlank(e) => Some(boolean_term(matches!(
                self.eval_expression(e, tuple)?,
                Term::BlankNode(_)
            ))),
            PlanExpression::IsLiteral(e) => Some(boolean_term(matches!(
                self.eval_expression(e, tuple)?,
                Term::Literal(_)
            ))),
            PlanExpression::IsNumeric(e) => Some(boolean_term(
                numeric_value(&self.eval_expression(e, tuple)?).is_some(),
            )),
            PlanExpression::Regex(text, pattern, flags) => {
                let text = self.eval_expression(text, tuple)?;
                let (text, _) = string_literal(&text)?;
                let regex = self.compile_regex(pattern, flags.as_deref(), tuple)?;
                Some(boolean_term(regex.is_match(text)))
            }
            PlanExpression::Cast(kind, e) => self.eval_cast(*kind, e, tuple),
        }
    }

    fn cmp_terms(
        &self,
        a: &PlanExpression,
        b: &PlanExpression,
        tuple: &EncodedTuple,
    ) -> Option<Ordering> {
        let a = self.eval_expression(a, tuple)?;
        let b = self.eval_expression(b, tuple)?;
        value_partial_cmp(&a, &b)
    }

    fn numeric_operands(
        &self,
        a: &PlanExpression,
        b: &PlanExpression,
        tuple: &EncodedTuple,
    ) -> Option<crate::sparql::expression::NumericPair> {
        let a = self.eval_expression(a, tuple)?;
        let b = self.eval_expression(b, tuple)?;
        numeric_pair(&a, &b)
    }

    fn integer_argument(&self, e: &PlanExpression, tuple: &EncodedTuple) -> Option<i64> {
        match numeric_value(&self.eval_expression(e, tuple)?)? {
            Numeric::Integer(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    fn compile_regex(
        &self,
        pattern: &PlanExpression,
        flags: Option<&PlanExpression>,
        tuple: &EncodedTuple,
    ) -> Option<regex::Regex> {
        let pattern = simple_string(&self.eval_expression(pattern, tuple)?)?;
        let mut builder = RegexBuilder::new(&pattern);
        builder.size_limit(1_000_000);
        if let Some(flags) = flags {
            let flags = simple_string(&self.eval_expression(flags, tuple)?)?;
            for flag in flags.chars() {
                match flag {
                    'i' => {
                        builder.case_insensitive(true);
                    }
                    'm' => {
                        builder.multi_line(true);
                    }
                    's' => {
                        builder.dot_matches_new_line(true);
                    }
                    'x' => {
                        builder.ignore_whitespace(true);
                    }
                    'q' => (),
                    _ => return None,
                }
            }
        }
        builder.build().ok()
    }

    fn eval_cast(
        &self,
        kind: CastKind,
        e: &PlanExpression,
        tuple: &EncodedTuple,
    ) -> Option<Term> {
        let value = self.eval_expression(e, tuple)?;
        match kind {
            CastKind::String => Some(
                Literal::new_typed_literal(string_value(&value), xsd::STRING).into(),
            ),
            CastKind::Boolean => {
                if let Term::Literal(l) = &value {
                    if l.datatype() == xsd::BOOLEAN || numeric_value(&value).is_some() {
                        return effective_boolean_value(&value).map(boolean_term);
                    }
                }
                // Strings cast by lexical form, not by EBV.
                let text = simple_string(&value)?;
                text.trim()
                    .parse::<Boolean>()
                    .ok()
                    .map(|b| boolean_term(b.into()))
            }
            CastKind::Integer => Some(integer_term(match numeric_value(&value) {
                Some(Numeric::Integer(v)) => v,
                Some(Numeric::Decimal(v)) => {
                    // Truncate toward zero via the lexical form.
                    let text = v.to_string();
                    let whole = text.split('.').next()?;
                    whole.parse().ok()?
                }
                Some(Numeric::Float(v)) => {
                    Integer::from(f64::from(f32::from(v)).trunc() as i64)
                }
                Some(Numeric::Double(v)) => Integer::from(f64::from(v).trunc() as i64),
                None => match &value {
                    Term::Literal(l) if l.datatype() == xsd::BOOLEAN => {
                        Integer::from(i64::from(l.value() == "true" || l.value() == "1"))
                    }
                    _ => simple_string(&value)?.trim().parse().ok()?,
                },
            })),
            CastKind::Decimal => Some(crate::sparql::expression::decimal_term(
                match numeric_value(&value) {
                    Some(Numeric::Integer(v)) => v.into(),
                    Some(Numeric::Decimal(v)) => v,
                    Some(Numeric::Float(v)) => Decimal::try_from(v).ok()?,
                    Some(Numeric::Double(v)) => Decimal::try_from(v).ok()?,
                    None => simple_string(&value)?.trim().parse().ok()?,
                },
            )),
            CastKind::Float => Some(float_term(match numeric_value(&value) {
                Some(Numeric::Integer(v)) => v.into(),
                Some(Numeric::Decimal(v)) => v.into(),
                Some(Numeric::Float(v)) => v,
                Some(Numeric::Double(v)) => Float::from(f64::from(v) as f32),
                None => simple_string(&value)?.trim().parse().ok()?,
            })),
            CastKind::Double => Some(double_term(match numeric_value(&value) {
                Some(Numeric::Integer(v)) => v.into(),
                Some(Numeric::Decimal(v)) => v.into(),
                Some(Numeric::Float(v)) => v.into(),
                Some(Numeric::Double(v)) => v,
                None => simple_string(&value)?.trim().parse().ok()?,
            })),
            CastKind::DateTime => {
                let Term::Literal(literal) = &value else {
                    return None;
                };
                let text = if literal.datatype() == xsd::DATE_TIME
                    || literal.datatype() == xsd::DATE
                    || literal.datatype() == xsd::STRING
                {
                    literal.value()
                } else {
                    return None;
                };
                temporal::parse_timestamp(text)?;
                Some(Literal::new_typed_literal(text, xsd::DATE_TIME).into())
            }
        }
    }

    // ---- query form drivers ----

    pub fn evaluate_select(
        &self,
        plan: &Rc<PlanNode>,
        variables: Arc<[Variable]>,
    ) -> QuerySolutionIter {
        let eval = self.clone();
        let count = variables.len();
        let tuples = self.guarded(self.eval_plan(plan, EncodedTuple::default()));
        QuerySolutionIter::new(
            variables,
            tuples.map(move |tuple| {
                let tuple = tuple?;
                let mut terms = Vec::with_capacity(count);
                for position in 0..count {
                    terms.push(match tuple.get(position) {
                        Some(atom) => Some(eval.dataset().decode_term(atom)?),
                        None => None,
                    });
                }
                Ok(terms)
            }),
        )
    }

    pub fn evaluate_ask(&self, plan: &Rc<PlanNode>) -> Result<bool, QueryEvaluationError> {
        match self.eval_plan(plan, EncodedTuple::default()).next() {
            Some(Ok(_)) => Ok(true),
            Some(Err(error)) => Err(error),
            None => Ok(false),
        }
    }

    pub fn evaluate_construct(
        &self,
        plan: &Rc<PlanNode>,
        templates: Vec<TripleTemplate>,
    ) -> QueryTripleIter {
        let eval = self.clone();
        let mut emitted = FxHashSet::default();
        let tuples = self.guarded(self.eval_plan(plan, EncodedTuple::default()));
        QueryTripleIter {
            iter: Box::new(
                tuples
                    .flat_map(move |tuple| -> Vec<Result<Triple, QueryEvaluationError>> {
                        let tuple = match tuple {
                            Ok(tuple) => tuple,
                            Err(error) => return vec![Err(error)],
                        };
                        let mut bnodes: FxHashMap<usize, BlankNode> = FxHashMap::default();
                        let mut result = Vec::with_capacity(templates.len());
                        for template in &templates {
                            match eval.instantiate_triple(template, &tuple, &mut bnodes) {
                                Ok(Some(triple)) => result.push(Ok(triple)),
                                Ok(None) => {}
                                Err(error) => result.push(Err(error)),
                            }
                        }
                        result
                    })
                    .filter(move |triple| {
                        triple
                            .as_ref()
                            .map_or(true, |triple| emitted.insert(triple.clone()))
                    }),
            ),
        }
    }

    fn instantiate_triple(
        &self,
        template: &TripleTemplate,
        tuple: &EncodedTuple,
        bnodes: &mut FxHashMap<usize, BlankNode>,
    ) -> Result<Option<Triple>, QueryEvaluationError> {
        let Some(subject) = self.template_value(template.subject, tuple, bnodes)? else {
            return Ok(None);
        };
        let Some(predicate) = self.template_value(template.predicate, tuple, bnodes)? else {
            return Ok(None);
        };
        let Some(object) = self.template_value(template.object, tuple, bnodes)? else {
            return Ok(None);
        };
        let subject: Subject = match subject {
            Term::NamedNode(node) => node.into(),
            Term::BlankNode(node) => node.into(),
            Term::Literal(_) => return Ok(None),
        };
        let Term::NamedNode(predicate) = predicate else {
            return Ok(None);
        };
        Ok(Some(Triple::new(subject, predicate, object)))
    }

    fn template_value(
        &self,
        value: TripleTemplateValue,
        tuple: &EncodedTuple,
        bnodes: &mut FxHashMap<usize, BlankNode>,
    ) -> Result<Option<Term>, QueryEvaluationError> {
        Ok(match value {
            TripleTemplateValue::Constant(atom) => Some(self.dataset().decode_term(atom)?),
            TripleTemplateValue::Variable(position) => match tuple.get(position) {
                Some(atom) => Some(self.dataset().decode_term(atom)?),
                None => None,
            },
            TripleTemplateValue::BlankNode(id) => {
                Some(bnodes.entry(id).or_default().clone().into())
            }
        })
    }

    /// Describe: the concise bounded description of every resource bound in
    /// the result.
    pub fn evaluate_describe(
        &self,
        plan: &Rc<PlanNode>,
        temporal: TemporalFilter,
    ) -> QueryTripleIter {
        let mut resources = Vec::new();
        let mut seen = FxHashSet::default();
        let mut error = None;
        for tuple in self.eval_plan(plan, EncodedTuple::default()) {
            match tuple {
                Ok(tuple) => {
                    for atom in tuple.iter().flatten() {
                        let describable = matches!(
                            atom.kind(),
                            crate::storage::atoms::AtomKind::NamedNode
                                | crate::storage::atoms::AtomKind::BlankNode
                        );
                        if describable && seen.insert(atom) {
                            resources.push(atom);
                        }
                    }
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        let eval = self.clone();
        let mut emitted = FxHashSet::default();
        let iter = error
            .map(Err)
            .into_iter()
            .chain(resources.into_iter().flat_map(move |resource| {
                let mut triples = Vec::new();
                // The description ranges over the whole dataset: the
                // default graph first, then the named graphs.
                for graph in [Some(None), None] {
                    for quad in eval.dataset().quads_for_pattern(
                        Some(resource),
                        None,
                        None,
                        graph,
                        temporal,
                    ) {
                        triples.push(quad.map_err(QueryEvaluationError::from).and_then(
                            |quad| {
                                let subject = match eval.dataset().decode_term(quad.subject)? {
                                    Term::NamedNode(node) => Subject::from(node),
                                    Term::BlankNode(node) => node.into(),
                                    Term::Literal(_) => {
                                        return Err(QueryEvaluationError::Unexpected(
                                            "literal in subject position".into(),
                                        ))
                                    }
                                };
                                let Term::NamedNode(predicate) =
                                    eval.dataset().decode_term(quad.predicate)?
                                else {
                                    return Err(QueryEvaluationError::Unexpected(
                                        "non-IRI in predicate position".into(),
                                    ));
                                };
                                let object = eval.dataset().decode_term(quad.object)?;
                                Ok(Triple::new(subject, predicate, object))
                            },
                        ));
                    }
                }
                triples
            }))
            .filter(move |triple| {
                triple
                    .as_ref()
                    .map_or(true, |triple| emitted.insert(triple.clone()))
            });
        QueryTripleIter {
            iter: Box::new(iter),
        }
    }

    /// Wraps the root iterator with the deadline check, evaluated between
    /// produced solutions.
    fn guarded(&self, iter: EncodedTuplesIterator) -> EncodedTuplesIterator {
        if let Some((deadline, timeout)) = self.context.deadline {
            Box::new(DeadlineIterator {
                inner: iter,
                deadline,
                timeout,
                expired: false,
            })
        } else {
            iter
        }
    }
}

struct DeadlineIterator {
    inner: EncodedTuplesIterator,
    deadline: Instant,
    timeout: Duration,
    expired: bool,
}

impl Iterator for DeadlineIterator {
    type Item = Result<EncodedTuple, QueryEvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.expired {
            return None;
        }
        if Instant::now() > self.deadline {
            self.expired = true;
            return Some(Err(QueryEvaluationError::Timeout(self.timeout)));
        }
        self.inner.next()
    }
}

fn get_pattern_value(selector: PatternValue, tuple: &EncodedTuple) -> Option<AtomId> {
    match selector {
        PatternValue::Constant(atom) => Some(atom),
        PatternValue::Variable(v) => tuple.get(v),
    }
}

/// Binds a scanned value into the tuple; `false` signals a conflict with a
/// repeated variable inside the same pattern.
fn put_pattern_value(selector: PatternValue, value: AtomId, tuple: &mut EncodedTuple) -> bool {
    match selector {
        PatternValue::Constant(_) => true,
        PatternValue::Variable(v) => {
            if let Some(existing) = tuple.get(v) {
                existing == value
            } else {
                tuple.set(v, value);
                true
            }
        }
    }
}

/// Maps a graph pattern position onto the dataset scan convention.
fn graph_specification(
    graph: PatternValue,
    tuple: &EncodedTuple,
) -> Option<Option<AtomId>> {
    match graph {
        PatternValue::Constant(atom) => {
            if atom.is_default_graph() {
                Some(None)
            } else {
                Some(Some(atom))
            }
        }
        PatternValue::Variable(v) => match tuple.get(v) {
            Some(atom) if atom.is_default_graph() => Some(None),
            Some(atom) => Some(Some(atom)),
            None => None,
        },
    }
}

fn collect_or_buffer(
    iter: EncodedTuplesIterator,
) -> (
    Vec<EncodedTuple>,
    Vec<Result<EncodedTuple, QueryEvaluationError>>,
) {
    let mut values = Vec::new();
    let mut errors = Vec::new();
    for tuple in iter {
        match tuple {
            Ok(tuple) => values.push(tuple),
            Err(error) => errors.push(Err(error)),
        }
    }
    (values, errors)
}

fn hash_deduplicate(
    iter: impl Iterator<Item = Result<(AtomId, AtomId), QueryEvaluationError>> + 'static,
) -> impl Iterator<Item = Result<(AtomId, AtomId), QueryEvaluationError>> {
    let mut seen = FxHashSet::default();
    iter.filter(move |pair| pair.as_ref().map_or(true, |pair| seen.insert(*pair)))
}

fn simple_string(term: &Term) -> Option<String> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.language().is_none() && literal.datatype() == xsd::STRING {
        Some(literal.value().to_owned())
    } else {
        None
    }
}

struct NestedLoopJoinIterator {
    left: Vec<EncodedTuple>,
    right_iter: EncodedTuplesIterator,
    buffered: Vec<Result<EncodedTuple, QueryEvaluationError>>,
}

impl Iterator for NestedLoopJoinIterator {
    type Item = Result<EncodedTuple, QueryEvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(result) = self.buffered.pop() {
                return Some(result);
            }
            match self.right_iter.next()? {
                Ok(right_tuple) => {
                    for left_tuple in &self.left {
                        if let Some(combined) = left_tuple.combine_with(&right_tuple) {
                            self.buffered.push(Ok(combined));
                        }
                    }
                }
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

struct HashJoinIterator {
    keys: Rc<Vec<usize>>,
    table: FxHashMap<Vec<Option<AtomId>>, Vec<EncodedTuple>>,
    left_iter: EncodedTuplesIterator,
    buffered: Vec<Result<EncodedTuple, QueryEvaluationError>>,
    pending: Vec<EncodedTuple>,
}

impl Iterator for HashJoinIterator {
    type Item = Result<EncodedTuple, QueryEvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(result) = self.buffered.pop() {
                return Some(result);
            }
            if let Some(tuple) = self.pending.pop() {
                return Some(Ok(tuple));
            }
            match self.left_iter.next()? {
                Ok(left_tuple) => {
                    let key: Vec<_> = self.keys.iter().map(|k| left_tuple.get(*k)).collect();
                    if let Some(matches) = self.table.get(&key) {
                        for right_tuple in matches {
                            if let Some(combined) = left_tuple.combine_with(right_tuple) {
                                self.pending.push(combined);
                            }
                        }
                    }
                }
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

struct LeftJoinIterator {
    eval: SimpleEvaluator,
    right_plan: Rc<PlanNode>,
    expression: Option<Rc<PlanExpression>>,
    left_iter: EncodedTuplesIterator,
    current: Option<(EncodedTuplesIterator, EncodedTuple, bool)>,
}

impl Iterator for LeftJoinIterator {
    type Item = Result<EncodedTuple, QueryEvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((right_iter, _, emitted)) = &mut self.current {
                for tuple in right_iter.by_ref() {
                    match tuple {
                        Ok(tuple) => {
                            if let Some(expression) = &self.expression {
                                let keep = self
                                    .eval
                                    .eval_expression(expression, &tuple)
                                    .and_then(|t| effective_boolean_value(&t))
                                    .unwrap_or(false);
                                if !keep {
                                    continue;
                                }
                            }
                            *emitted = true;
                            return Some(Ok(tuple));
                        }
                        Err(error) => return Some(Err(error)),
                    }
                }
                let (_, left_tuple, emitted) = self.current.take().unwrap();
                if !emitted {
                    return Some(Ok(left_tuple));
                }
            }
            match self.left_iter.next()? {
                Ok(left_tuple) => {
                    let right_iter = self.eval.eval_plan(&self.right_plan, left_tuple.clone());
                    self.current = Some((right_iter, left_tuple, false));
                }
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

/// One aggregate function instance over one group.
struct Accumulator {
    function: PlanAggregationFunction,
    distinct: Option<FxHashSet<Option<Term>>>,
    /// `COUNT(DISTINCT *)` deduplicates whole solutions.
    distinct_tuples: Option<FxHashSet<EncodedTuple>>,
    count: i64,
    sum: Option<Numeric>,
    extremum: Option<Term>,
    sample: Option<Term>,
    concat: Option<String>,
    errored: bool,
}

impl Accumulator {
    fn new(aggregation: &PlanAggregation) -> Self {
        let has_parameter = aggregation.parameter.is_some();
        Self {
            function: aggregation.function.clone(),
            distinct: (aggregation.distinct && has_parameter).then(FxHashSet::default),
            distinct_tuples: (aggregation.distinct && !has_parameter).then(FxHashSet::default),
            count: 0,
            sum: Some(Numeric::Integer(Integer::from(0_i64))),
            extremum: None,
            sample: None,
            concat: None,
            errored: false,
        }
    }

    /// Feeds one solution. `value` is `None` for `COUNT(*)` and
    /// `Some(None)` when the argument expression errored.
    fn add(&mut self, value: Option<Option<Term>>, tuple: &EncodedTuple) {
        let term = match value {
            None => None,
            Some(Some(term)) => Some(term),
            Some(None) => {
                // An erroring argument is skipped by COUNT and poisons the
                // value-producing aggregates.
                self.errored = true;
                return;
            }
        };
        if let Some(seen) = &mut self.distinct {
            if !seen.insert(term.clone()) {
                return;
            }
        }
        if let Some(seen) = &mut self.distinct_tuples {
            if !seen.insert(tuple.clone()) {
                return;
            }
        }
        self.count += 1;
        if let Some(term) = term {
            match self.function {
                PlanAggregationFunction::Sum | PlanAggregationFunction::Avg => {
                    self.sum = match (self.sum, numeric_value(&term)) {
                        (Some(sum), Some(value)) => {
                            let pair = crate::sparql::expression::promote(sum, value);
                            sum_pair(pair)
                        }
                        _ => None,
                    };
                }
                PlanAggregationFunction::Min => {
                    let replace = match &self.extremum {
                        Some(current) => {
                            order_cmp(Some(&term), Some(current)) == Ordering::Less
                        }
                        None => true,
                    };
                    if replace {
                        self.extremum = Some(term);
                    }
                }
                PlanAggregationFunction::Max => {
                    let replace = match &self.extremum {
                        Some(current) => {
                            order_cmp(Some(&term), Some(current)) == Ordering::Greater
                        }
                        None => true,
                    };
                    if replace {
                        self.extremum = Some(term);
                    }
                }
                PlanAggregationFunction::Sample => {
                    if self.sample.is_none() {
                        self.sample = Some(term);
                    }
                }
                PlanAggregationFunction::GroupConcat { ref separator } => {
                    let value = string_value(&term);
                    match &mut self.concat {
                        Some(concat) => {
                            concat.push_str(separator);
                            concat.push_str(&value);
                        }
                        None => self.concat = Some(value),
                    }
                }
                PlanAggregationFunction::Count => {}
            }
        }
    }

    fn finish(self) -> Option<Term> {
        match self.function {
            // COUNT over an expression counts only the successful
            // evaluations; erroring rows were skipped as they came.
            PlanAggregationFunction::Count => Some(integer_term(Integer::from(self.count))),
            PlanAggregationFunction::Sum => {
                if self.errored {
                    return None;
                }
                self.sum.map(numeric_term)
            }
            PlanAggregationFunction::Avg => {
                if self.errored {
                    return None;
                }
                if self.count == 0 {
                    return Some(integer_term(Integer::from(0_i64)));
                }
                let sum = self.sum?;
                let pair = crate::sparql::expression::promote(
                    sum,
                    Numeric::Integer(Integer::from(self.count)),
                );
                // The XPath average of integers is a decimal.
                match divide(pair) {
                    Some(term) => Some(term),
                    None => None,
                }
            }
            PlanAggregationFunction::Min | PlanAggregationFunction::Max => {
                if self.errored {
                    return None;
                }
                self.extremum
            }
            PlanAggregationFunction::Sample => self.sample,
            PlanAggregationFunction::GroupConcat { .. } => {
                if self.errored {
                    return None;
                }
                self.concat
                    .or_else(|| Some(String::new()))
                    .map(|s| Literal::new_simple_literal(s).into())
            }
        }
    }
}

fn sum_pair(pair: crate::sparql::expression::NumericPair) -> Option<Numeric> {
    use crate::sparql::expression::NumericPair;
    Some(match pair {
        NumericPair::Integer(a, b) => Numeric::Integer(a.checked_add(b)?),
        NumericPair::Decimal(a, b) => Numeric::Decimal(a.checked_add(b)?),
        NumericPair::Float(a, b) => Numeric::Float(a + b),
        NumericPair::Double(a, b) => Numeric::Double(a + b),
    })
}
