//! Builds executable plans from the chronogebra algebra.
//!
//! Planning covers variable numbering, SPARQL-star expansion, temporal
//! clause propagation (innermost wins), conjunctive pattern reordering by
//! index cardinality estimates, filter placement right after the point
//! where the filter's variables are bound, join strategy selection and the
//! `GROUP BY` static checks.

use crate::model::Variable;
use crate::sparql::dataset::DatasetView;
use crate::sparql::error::{QueryEvaluationError, QueryPlanError};
use crate::sparql::plan::{
    CastKind, Comparator, EncodedTuple, JoinStrategy, PatternValue, PlanAggregation,
    PlanAggregationFunction, PlanExpression, PlanNode, PlanPropertyPath, TripleTemplate,
    TripleTemplateValue,
};
use crate::storage::atoms::AtomId;
use crate::temporal::{self, TemporalFilter, Timestamp};
use chronogebra::algebra::{
    AggregateExpression, AggregateFunction, Expression, Function, GraphPattern, OrderExpression,
    PropertyPathExpression, TemporalClause,
};
use chronogebra::term::{NamedNodePattern, QuotedTriplePattern, TermPattern, TriplePattern};
use oxrdf::vocab::{rdf, xsd};
use oxrdf::{Literal, NamedNode, Term};
use rustc_hash::FxHashSet;
use std::rc::Rc;

/// Sides of a join both larger than this prefer the hash strategy.
const HASH_JOIN_THRESHOLD: u64 = 512;

pub struct PlanBuilder<'a> {
    dataset: &'a DatasetView,
    variables: Vec<Variable>,
    recursion_limit: usize,
    depth: usize,
    with_optimizations: bool,
    synthetic_counter: usize,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        dataset: &'a DatasetView,
        recursion_limit: usize,
        with_optimizations: bool,
    ) -> Self {
        Self {
            dataset,
            variables: Vec::new(),
            recursion_limit,
            depth: 0,
            with_optimizations,
            synthetic_counter: 0,
        }
    }

    /// Compiles a pattern and wraps it so that output position `i` is the
    /// `i`-th projected variable.
    pub fn build_projected(
        &mut self,
        pattern: &GraphPattern,
        temporal: TemporalFilter,
    ) -> Result<(Rc<PlanNode>, Vec<Variable>), QueryEvaluationError> {
        if let GraphPattern::Group { .. } = skip_modifiers(pattern) {
            // `SELECT *` over GROUP BY arrives without a projection node.
            if !matches!(pattern, GraphPattern::Project { .. })
                && !has_projection(pattern)
            {
                return Err(QueryPlanError::SelectStarWithGroupBy.into());
            }
        }
        let plan = self.build_pattern(pattern, PatternValue::Constant(AtomId::DEFAULT_GRAPH), temporal)?;
        let mut projected = Vec::new();
        in_scope_variables(pattern, &mut projected);
        let mapping: Vec<_> = projected
            .iter()
            .enumerate()
            .map(|(i, v)| (self.encode_variable(v), i))
            .collect();
        Ok((
            Rc::new(PlanNode::Project {
                child: plan,
                mapping: Rc::new(mapping),
            }),
            projected,
        ))
    }

    /// Compiles a plain pattern without the output projection (ASK,
    /// CONSTRUCT, DESCRIBE).
    pub fn build_pattern_root(
        &mut self,
        pattern: &GraphPattern,
        temporal: TemporalFilter,
    ) -> Result<Rc<PlanNode>, QueryEvaluationError> {
        self.build_pattern(pattern, PatternValue::Constant(AtomId::DEFAULT_GRAPH), temporal)
    }

    /// Compiles a CONSTRUCT template.
    pub fn build_template(
        &mut self,
        template: &[TriplePattern],
    ) -> Result<Vec<TripleTemplate>, QueryEvaluationError> {
        let mut bnode_keys: Vec<String> = Vec::new();
        template
            .iter()
            .map(|triple| {
                Ok(TripleTemplate {
                    subject: self.template_value(&triple.subject, &mut bnode_keys)?,
                    predicate: match &triple.predicate {
                        NamedNodePattern::NamedNode(node) => TripleTemplateValue::Constant(
                            self.dataset.encode_term(node.as_ref().into())?,
                        ),
                        NamedNodePattern::Variable(v) => {
                            TripleTemplateValue::Variable(self.encode_variable(v))
                        }
                    },
                    object: self.template_value(&triple.object, &mut bnode_keys)?,
                })
            })
            .collect()
    }

    fn template_value(
        &mut self,
        term: &TermPattern,
        bnode_keys: &mut Vec<String>,
    ) -> Result<TripleTemplateValue, QueryEvaluationError> {
        Ok(match term {
            TermPattern::NamedNode(node) => {
                TripleTemplateValue::Constant(self.dataset.encode_term(node.as_ref().into())?)
            }
            TermPattern::Literal(literal) => {
                TripleTemplateValue::Constant(self.dataset.encode_term(literal.as_ref().into())?)
            }
            TermPattern::Variable(v) => TripleTemplateValue::Variable(self.encode_variable(v)),
            TermPattern::BlankNode(node) => {
                let key = node.as_str().to_owned();
                let id = match bnode_keys.iter().position(|k| *k == key) {
                    Some(id) => id,
                    None => {
                        bnode_keys.push(key);
                        bnode_keys.len() - 1
                    }
                };
                TripleTemplateValue::BlankNode(id)
            }
            TermPattern::QuotedTriple(_) => {
                return Err(QueryPlanError::Unsupported(
                    "quoted triples in CONSTRUCT templates".into(),
                )
                .into())
            }
        })
    }

    fn build_pattern(
        &mut self,
        pattern: &GraphPattern,
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> Result<Rc<PlanNode>, QueryEvaluationError> {
        Ok(match pattern {
            GraphPattern::Bgp { patterns } => {
                self.build_bgp(patterns, &[], graph, temporal)?
            }
            GraphPattern::Filter { .. } => {
                // Fuse the filter stack and push conjuncts into the BGP.
                let mut filters = Vec::new();
                let mut inner = pattern;
                while let GraphPattern::Filter { expr, inner: next } = inner {
                    split_conjunction(expr, &mut filters);
                    inner = next;
                }
                if let GraphPattern::Bgp { patterns } = inner {
                    self.build_bgp(patterns, &filters, graph, temporal)?
                } else {
                    let mut plan = self.build_pattern(inner, graph, temporal)?;
                    for filter in filters {
                        plan = self.attach_filter(plan, filter, graph, temporal)?;
                    }
                    plan
                }
            }
            GraphPattern::Path {
                subject,
                path,
                object,
            } => Rc::new(PlanNode::PathPattern {
                child: Rc::new(PlanNode::Init),
                subject: self.pattern_value(subject)?,
                path: Rc::new(self.build_path(path)?),
                object: self.pattern_value(object)?,
                graph,
                temporal,
            }),
            GraphPattern::Join { left, right } => {
                let left_estimate = self.estimate_group(left, graph);
                let right_estimate = self.estimate_group(right, graph);
                let left_plan = self.build_pattern(left, graph, temporal)?;
                let right_plan = self.build_pattern(right, graph, temporal)?;
                let keys = self.shared_variable_positions(left, right);
                let strategy = if !keys.is_empty()
                    && left_estimate > HASH_JOIN_THRESHOLD
                    && right_estimate > HASH_JOIN_THRESHOLD
                {
                    JoinStrategy::Hash {
                        keys: Rc::new(keys),
                    }
                } else {
                    JoinStrategy::NestedLoop
                };
                Rc::new(PlanNode::Join {
                    left: left_plan,
                    right: right_plan,
                    strategy,
                })
            }
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => {
                let left_plan = self.build_pattern(left, graph, temporal)?;
                let right_plan = self.build_pattern(right, graph, temporal)?;
                let expression = expression
                    .as_ref()
                    .map(|e| self.build_expression(e, graph, temporal))
                    .transpose()?
                    .map(Rc::new);
                Rc::new(PlanNode::LeftJoin {
                    left: left_plan,
                    right: right_plan,
                    expression,
                })
            }
            GraphPattern::Minus { left, right } => Rc::new(PlanNode::AntiJoin {
                left: self.build_pattern(left, graph, temporal)?,
                right: self.build_pattern(right, graph, temporal)?,
            }),
            GraphPattern::Union { left, right } => Rc::new(PlanNode::Union {
                left: self.build_pattern(left, graph, temporal)?,
                right: self.build_pattern(right, graph, temporal)?,
            }),
            GraphPattern::Graph { name, inner } => {
                let graph = match name {
                    NamedNodePattern::NamedNode(node) => {
                        PatternValue::Constant(self.dataset.encode_term(node.as_ref().into())?)
                    }
                    NamedNodePattern::Variable(v) => {
                        PatternValue::Variable(self.encode_variable(v))
                    }
                };
                self.build_pattern(inner, graph, temporal)?
            }
            GraphPattern::Extend {
                inner,
                variable,
                expression,
            } => {
                let child = self.build_pattern(inner, graph, temporal)?;
                Rc::new(PlanNode::Extend {
                    child,
                    position: self.encode_variable(variable),
                    expression: Rc::new(self.build_expression(expression, graph, temporal)?),
                })
            }
            GraphPattern::Values {
                variables,
                bindings,
            } => {
                let positions: Vec<_> =
                    variables.iter().map(|v| self.encode_variable(v)).collect();
                let mut tuples = Vec::with_capacity(bindings.len());
                for row in bindings {
                    let mut tuple = EncodedTuple::default();
                    for (term, position) in row.iter().zip(&positions) {
                        if let Some(term) = term {
                            let term: Term = term.clone().into();
                            tuple.set(*position, self.dataset.encode_term(term.as_ref())?);
                        }
                    }
                    tuples.push(tuple);
                }
                Rc::new(PlanNode::StaticBindings { tuples })
            }
            GraphPattern::OrderBy { inner, expression } => {
                let child = self.build_pattern(inner, graph, temporal)?;
                let by = expression
                    .iter()
                    .map(|e| {
                        Ok(match e {
                            OrderExpression::Asc(e) => {
                                Comparator::Asc(self.build_expression(e, graph, temporal)?)
                            }
                            OrderExpression::Desc(e) => {
                                Comparator::Desc(self.build_expression(e, graph, temporal)?)
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, QueryEvaluationError>>()?;
                Rc::new(PlanNode::Sort { child, by })
            }
            GraphPattern::Project { inner, variables } => {
                self.depth += 1;
                if self.depth > self.recursion_limit {
                    return Err(
                        QueryPlanError::SubqueryDepthExceeded(self.recursion_limit).into()
                    );
                }
                self.check_group_projection(inner, variables)?;
                let child = self.build_pattern(inner, graph, temporal)?;
                self.depth -= 1;
                let mapping: Vec<_> = variables
                    .iter()
                    .map(|v| {
                        let position = self.encode_variable(v);
                        (position, position)
                    })
                    .collect();
                Rc::new(PlanNode::Project {
                    child,
                    mapping: Rc::new(mapping),
                })
            }
            GraphPattern::Distinct { inner } | GraphPattern::Reduced { inner } => {
                Rc::new(PlanNode::HashDeduplicate {
                    child: self.build_pattern(inner, graph, temporal)?,
                })
            }
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => {
                let mut plan = self.build_pattern(inner, graph, temporal)?;
                if *start > 0 {
                    plan = Rc::new(PlanNode::Skip {
                        child: plan,
                        count: *start,
                    });
                }
                if let Some(length) = length {
                    plan = Rc::new(PlanNode::Limit {
                        child: plan,
                        count: *length,
                    });
                }
                plan
            }
            GraphPattern::Group {
                inner,
                variables,
                aggregates,
            } => {
                self.check_aggregate_aliases(variables, aggregates)?;
                let child = self.build_pattern(inner, graph, temporal)?;
                let key_mapping: Vec<_> = variables
                    .iter()
                    .map(|v| {
                        let position = self.encode_variable(v);
                        (position, position)
                    })
                    .collect();
                let aggregations = aggregates
                    .iter()
                    .map(|(alias, aggregate)| {
                        Ok((
                            self.build_aggregate(aggregate, graph, temporal)?,
                            self.encode_variable(alias),
                        ))
                    })
                    .collect::<Result<Vec<_>, QueryEvaluationError>>()?;
                Rc::new(PlanNode::Aggregate {
                    child,
                    key_mapping: Rc::new(key_mapping),
                    aggregates: Rc::new(aggregations),
                })
            }
            GraphPattern::Service {
                name,
                inner,
                silent,
            } => {
                let name = match name {
                    NamedNodePattern::NamedNode(node) => {
                        PatternValue::Constant(self.dataset.encode_term(node.as_ref().into())?)
                    }
                    NamedNodePattern::Variable(v) => {
                        PatternValue::Variable(self.encode_variable(v))
                    }
                };
                let mut free = Vec::new();
                in_scope_variables(inner, &mut free);
                let variables: Vec<_> = free
                    .into_iter()
                    .map(|v| {
                        let position = self.encode_variable(&v);
                        (v, position)
                    })
                    .collect();
                Rc::new(PlanNode::Service {
                    child: Rc::new(PlanNode::Init),
                    name,
                    pattern: Rc::new(inner.as_ref().clone()),
                    variables: Rc::new(variables),
                    silent: *silent,
                })
            }
            GraphPattern::Temporal { inner, clause } => {
                // Innermost wins: the nested clause replaces the inherited
                // one for everything beneath.
                let temporal = resolve_temporal_clause(clause)?;
                self.build_pattern(inner, graph, temporal)?
            }
        })
    }

    /// Compiles a basic graph pattern: SPARQL-star expansion, selectivity
    /// ordering, then a chain of quad patterns with each filter attached as
    /// soon as its variables are bound.
    fn build_bgp(
        &mut self,
        patterns: &[TriplePattern],
        filters: &[&Expression],
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> Result<Rc<PlanNode>, QueryEvaluationError> {
        let mut expanded = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            self.expand_quoted_triples(pattern, &mut expanded);
        }
        let mut compiled = Vec::with_capacity(expanded.len());
        for pattern in &expanded {
            let subject = self.pattern_value(&pattern.subject)?;
            let predicate = match &pattern.predicate {
                NamedNodePattern::NamedNode(node) => {
                    PatternValue::Constant(self.dataset.encode_term(node.as_ref().into())?)
                }
                NamedNodePattern::Variable(v) => PatternValue::Variable(self.encode_variable(v)),
            };
            let object = self.pattern_value(&pattern.object)?;
            let estimate = self.estimate_quad_pattern(subject, predicate, object, graph);
            compiled.push((subject, predicate, object, estimate));
        }

        // Greedy ordering: always scan the cheapest remaining pattern,
        // counting variable positions bound by earlier patterns as bound.
        let mut ordered = Vec::with_capacity(compiled.len());
        let mut bound: FxHashSet<usize> = FxHashSet::default();
        if let PatternValue::Variable(v) = graph {
            bound.insert(v);
        }
        let mut remaining = compiled;
        while !remaining.is_empty() {
            let best = if self.with_optimizations {
                let mut best = 0;
                let mut best_cost = u64::MAX;
                for (i, (s, p, o, estimate)) in remaining.iter().enumerate() {
                    let mut cost = *estimate;
                    for value in [s, p, o] {
                        if let PatternValue::Variable(v) = value {
                            if bound.contains(v) {
                                cost /= 4;
                            }
                        }
                    }
                    if cost < best_cost {
                        best_cost = cost;
                        best = i;
                    }
                }
                best
            } else {
                0
            };
            let pattern = remaining.remove(best);
            for value in [pattern.0, pattern.1, pattern.2] {
                if let PatternValue::Variable(v) = value {
                    bound.insert(v);
                }
            }
            ordered.push(pattern);
        }

        // Each filter goes right after the first chain position binding all
        // its variables; unplaceable filters run at the end.
        let mut filter_slots: Vec<(usize, PlanExpression)> = Vec::new();
        for filter in filters {
            let expression = self.build_expression(filter, graph, temporal)?;
            let mut vars = FxHashSet::default();
            expression_variables(&expression, &mut vars);
            let mut bound: FxHashSet<usize> = FxHashSet::default();
            if let PatternValue::Variable(v) = graph {
                bound.insert(v);
            }
            let mut slot = ordered.len();
            if vars.iter().all(|v| bound.contains(v)) {
                slot = 0;
            } else {
                for (i, (s, p, o, _)) in ordered.iter().enumerate() {
                    for value in [s, p, o] {
                        if let PatternValue::Variable(v) = value {
                            bound.insert(*v);
                        }
                    }
                    if vars.iter().all(|v| bound.contains(v)) {
                        slot = i + 1;
                        break;
                    }
                }
            }
            filter_slots.push((slot, expression));
        }

        let mut plan = Rc::new(PlanNode::Init);
        for (_, expression) in filter_slots.iter().filter(|(slot, _)| *slot == 0) {
            plan = self.wrap_filter(plan, expression.clone());
        }
        for (i, (subject, predicate, object, _)) in ordered.into_iter().enumerate() {
            plan = Rc::new(PlanNode::QuadPattern {
                child: plan,
                subject,
                predicate,
                object,
                graph,
                temporal,
            });
            for (_, expression) in filter_slots.iter().filter(|(slot, _)| *slot == i + 1) {
                plan = self.wrap_filter(plan, expression.clone());
            }
        }
        Ok(plan)
    }

    fn wrap_filter(&self, child: Rc<PlanNode>, expression: PlanExpression) -> Rc<PlanNode> {
        // FILTER EXISTS is the dedicated probing operator.
        match expression {
            PlanExpression::Exists(pattern) => Rc::new(PlanNode::ExistsFilter {
                child,
                pattern,
                negated: false,
            }),
            PlanExpression::Not(inner) => match *inner {
                PlanExpression::Exists(pattern) => Rc::new(PlanNode::ExistsFilter {
                    child,
                    pattern,
                    negated: true,
                }),
                other => Rc::new(PlanNode::Filter {
                    child,
                    expression: Rc::new(PlanExpression::Not(Box::new(other))),
                }),
            },
            expression => Rc::new(PlanNode::Filter {
                child,
                expression: Rc::new(expression),
            }),
        }
    }

    fn attach_filter(
        &mut self,
        plan: Rc<PlanNode>,
        filter: &Expression,
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> Result<Rc<PlanNode>, QueryEvaluationError> {
        let expression = self.build_expression(filter, graph, temporal)?;
        Ok(self.wrap_filter(plan, expression))
    }

    /// Expands quoted triples into reification patterns over synthetic
    /// variables; nested quotes recurse.
    fn expand_quoted_triples(&mut self, pattern: &TriplePattern, into: &mut Vec<TriplePattern>) {
        let subject = self.expand_term(&pattern.subject, into);
        let object = self.expand_term(&pattern.object, into);
        into.push(TriplePattern {
            subject,
            predicate: pattern.predicate.clone(),
            object,
        });
    }

    fn expand_term(&mut self, term: &TermPattern, into: &mut Vec<TriplePattern>) -> TermPattern {
        let TermPattern::QuotedTriple(quoted) = term else {
            return term.clone();
        };
        let QuotedTriplePattern {
            subject,
            predicate,
            object,
        } = quoted.as_ref();
        self.synthetic_counter += 1;
        let var = Variable::new_unchecked(format!("__qt{}", self.synthetic_counter));
        let statement: TermPattern = var.clone().into();
        into.push(TriplePattern {
            subject: statement.clone(),
            predicate: NamedNodePattern::NamedNode(rdf::TYPE.into_owned()),
            object: TermPattern::NamedNode(NamedNode::from(rdf::STATEMENT)),
        });
        let expanded_subject = self.expand_term(subject, into);
        into.push(TriplePattern {
            subject: statement.clone(),
            predicate: NamedNodePattern::NamedNode(rdf::SUBJECT.into_owned()),
            object: expanded_subject,
        });
        into.push(TriplePattern {
            subject: statement.clone(),
            predicate: NamedNodePattern::NamedNode(rdf::PREDICATE.into_owned()),
            object: predicate.clone().into(),
        });
        let expanded_object = self.expand_term(object, into);
        into.push(TriplePattern {
            subject: statement.clone(),
            predicate: NamedNodePattern::NamedNode(rdf::OBJECT.into_owned()),
            object: expanded_object,
        });
        statement
    }

    fn pattern_value(
        &mut self,
        term: &TermPattern,
    ) -> Result<PatternValue, QueryEvaluationError> {
        Ok(match term {
            TermPattern::NamedNode(node) => {
                PatternValue::Constant(self.dataset.encode_term(node.as_ref().into())?)
            }
            TermPattern::Literal(literal) => {
                PatternValue::Constant(self.dataset.encode_term(literal.as_ref().into())?)
            }
            // Blank nodes in patterns behave as non-projected variables.
            TermPattern::BlankNode(node) => {
                let var = Variable::new_unchecked(format!("__bnode_{}", node.as_str()));
                PatternValue::Variable(self.encode_variable(&var))
            }
            TermPattern::Variable(v) => PatternValue::Variable(self.encode_variable(v)),
            TermPattern::QuotedTriple(_) => {
                // `expand_quoted_triples` runs first; reaching one here is a
                // planner bug.
                return Err(QueryPlanError::Unsupported(
                    "quoted triple outside a basic graph pattern".into(),
                )
                .into());
            }
        })
    }

    fn build_path(
        &mut self,
        path: &PropertyPathExpression,
    ) -> Result<PlanPropertyPath, QueryEvaluationError> {
        Ok(match path {
            PropertyPathExpression::NamedNode(node) => {
                PlanPropertyPath::Predicate(self.dataset.encode_term(node.as_ref().into())?)
            }
            PropertyPathExpression::Reverse(inner) => {
                PlanPropertyPath::Inverse(Rc::new(self.build_path(inner)?))
            }
            PropertyPathExpression::Sequence(a, b) => PlanPropertyPath::Sequence(
                Rc::new(self.build_path(a)?),
                Rc::new(self.build_path(b)?),
            ),
            PropertyPathExpression::Alternative(a, b) => PlanPropertyPath::Alternative(
                Rc::new(self.build_path(a)?),
                Rc::new(self.build_path(b)?),
            ),
            PropertyPathExpression::ZeroOrMore(inner) => {
                PlanPropertyPath::ZeroOrMore(Rc::new(self.build_path(inner)?))
            }
            PropertyPathExpression::OneOrMore(inner) => {
                PlanPropertyPath::OneOrMore(Rc::new(self.build_path(inner)?))
            }
            PropertyPathExpression::ZeroOrOne(inner) => {
                PlanPropertyPath::ZeroOrOne(Rc::new(self.build_path(inner)?))
            }
            PropertyPathExpression::NegatedPropertySet(predicates) => {
                let predicates = predicates
                    .iter()
                    .map(|p| self.dataset.encode_term(p.as_ref().into()))
                    .collect::<Result<Vec<_>, _>>()?;
                PlanPropertyPath::NegatedPropertySet(Rc::new(predicates))
            }
        })
    }

    fn build_aggregate(
        &mut self,
        aggregate: &AggregateExpression,
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> Result<PlanAggregation, QueryEvaluationError> {
        Ok(match aggregate {
            AggregateExpression::CountSolutions { distinct } => PlanAggregation {
                function: PlanAggregationFunction::Count,
                parameter: None,
                distinct: *distinct,
            },
            AggregateExpression::FunctionCall {
                name,
                expr,
                distinct,
            } => PlanAggregation {
                function: match name {
                    AggregateFunction::Count => PlanAggregationFunction::Count,
                    AggregateFunction::Sum => PlanAggregationFunction::Sum,
                    AggregateFunction::Avg => PlanAggregationFunction::Avg,
                    AggregateFunction::Min => PlanAggregationFunction::Min,
                    AggregateFunction::Max => PlanAggregationFunction::Max,
                    AggregateFunction::Sample => PlanAggregationFunction::Sample,
                    AggregateFunction::GroupConcat { separator } => {
                        PlanAggregationFunction::GroupConcat {
                            separator: separator.as_deref().unwrap_or(" ").into(),
                        }
                    }
                },
                parameter: Some(self.build_expression(expr, graph, temporal)?),
                distinct: *distinct,
            },
        })
    }

    fn boxed(
        &mut self,
        expression: &Expression,
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> Result<Box<PlanExpression>, QueryEvaluationError> {
        Ok(Box::new(self.build_expression(expression, graph, temporal)?))
    }

    fn build_expression(
        &mut self,
        expression: &Expression,
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> Result<PlanExpression, QueryEvaluationError> {
        Ok(match expression {
            Expression::NamedNode(node) => {
                PlanExpression::Constant(self.dataset.encode_term(node.as_ref().into())?)
            }
            Expression::Literal(literal) => {
                PlanExpression::Constant(self.dataset.encode_term(literal.as_ref().into())?)
            }
            Expression::Variable(v) => PlanExpression::Variable(self.encode_variable(v)),
            Expression::Bound(v) => PlanExpression::Bound(self.encode_variable(v)),
            Expression::Or(a, b) => {
                PlanExpression::Or(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?)
            }
            Expression::And(a, b) => PlanExpression::And(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::Equal(a, b) => PlanExpression::Equal(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::SameTerm(a, b) => PlanExpression::SameTerm(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::Greater(a, b) => PlanExpression::Greater(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::GreaterOrEqual(a, b) => {
                PlanExpression::GreaterOrEqual(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?)
            }
            Expression::Less(a, b) => PlanExpression::Less(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::LessOrEqual(a, b) => PlanExpression::LessOrEqual(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::In(a, bs) => {
                let a = self.boxed(a, graph, temporal)?;
                let bs = bs
                    .iter()
                    .map(|b| self.build_expression(b, graph, temporal))
                    .collect::<Result<Vec<_>, _>>()?;
                PlanExpression::In(a, bs)
            }
            Expression::Add(a, b) => PlanExpression::Add(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::Subtract(a, b) => PlanExpression::Subtract(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::Multiply(a, b) => PlanExpression::Multiply(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::Divide(a, b) => PlanExpression::Divide(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?),
            Expression::UnaryPlus(e) => PlanExpression::UnaryPlus(self.boxed(e, graph, temporal)?),
            Expression::UnaryMinus(e) => PlanExpression::UnaryMinus(self.boxed(e, graph, temporal)?),
            Expression::Not(e) => PlanExpression::Not(self.boxed(e, graph, temporal)?),
            Expression::Exists(pattern) => {
                let plan = self.build_pattern(pattern, graph, temporal)?;
                PlanExpression::Exists(plan)
            }
            Expression::If(a, b, c) => PlanExpression::If(self.boxed(a, graph, temporal)?, self.boxed(b, graph, temporal)?, self.boxed(c, graph, temporal)?),
            Expression::Coalesce(es) => PlanExpression::Coalesce(
                es.iter()
                    .map(|e| self.build_expression(e, graph, temporal))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Expression::FunctionCall(function, args) => {
                self.build_function_call(function, args, graph, temporal)?
            }
        })
    }

    fn boxed_arg(
        &mut self,
        function: &Function,
        args: &[Expression],
        i: usize,
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> Result<Box<PlanExpression>, QueryEvaluationError> {
        let e = args.get(i).ok_or_else(|| {
            QueryPlanError::Unsupported(format!("missing argument {i} of {function}"))
        })?;
        self.boxed(e, graph, temporal)
    }

    fn build_function_call(
        &mut self,
        function: &Function,
        args: &[Expression],
        graph: PatternValue,
        temporal: TemporalFilter,
    ) -> Result<PlanExpression, QueryEvaluationError> {
        Ok(match function {
            Function::Str => PlanExpression::Str(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Lang => PlanExpression::Lang(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::LangMatches => PlanExpression::LangMatches(self.boxed_arg(function, args, 0, graph, temporal)?, self.boxed_arg(function, args, 1, graph, temporal)?),
            Function::Datatype => PlanExpression::Datatype(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Iri => PlanExpression::Iri(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::BNode => {
                if args.is_empty() {
                    PlanExpression::BNode(None)
                } else {
                    PlanExpression::BNode(Some(self.boxed_arg(function, args, 0, graph, temporal)?))
                }
            }
            Function::Abs => PlanExpression::Abs(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Ceil => PlanExpression::Ceil(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Floor => PlanExpression::Floor(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Round => PlanExpression::Round(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Concat => PlanExpression::Concat(
                args.iter()
                    .map(|e| self.build_expression(e, graph, temporal))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Function::SubStr => PlanExpression::SubStr(
                self.boxed_arg(function, args, 0, graph, temporal)?,
                self.boxed_arg(function, args, 1, graph, temporal)?,
                if args.len() > 2 { Some(self.boxed_arg(function, args, 2, graph, temporal)?) } else { None },
            ),
            Function::StrLen => PlanExpression::StrLen(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Replace => PlanExpression::Replace(
                self.boxed_arg(function, args, 0, graph, temporal)?,
                self.boxed_arg(function, args, 1, graph, temporal)?,
                self.boxed_arg(function, args, 2, graph, temporal)?,
                if args.len() > 3 { Some(self.boxed_arg(function, args, 3, graph, temporal)?) } else { None },
            ),
            Function::UCase => PlanExpression::UCase(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::LCase => PlanExpression::LCase(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::EncodeForUri => PlanExpression::EncodeForUri(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Contains => PlanExpression::Contains(self.boxed_arg(function, args, 0, graph, temporal)?, self.boxed_arg(function, args, 1, graph, temporal)?),
            Function::StrStarts => PlanExpression::StrStarts(self.boxed_arg(function, args, 0, graph, temporal)?, self.boxed_arg(function, args, 1, graph, temporal)?),
            Function::StrEnds => PlanExpression::StrEnds(self.boxed_arg(function, args, 0, graph, temporal)?, self.boxed_arg(function, args, 1, graph, temporal)?),
            Function::StrBefore => PlanExpression::StrBefore(self.boxed_arg(function, args, 0, graph, temporal)?, self.boxed_arg(function, args, 1, graph, temporal)?),
            Function::StrAfter => PlanExpression::StrAfter(self.boxed_arg(function, args, 0, graph, temporal)?, self.boxed_arg(function, args, 1, graph, temporal)?),
            Function::StrLang => PlanExpression::StrLang(self.boxed_arg(function, args, 0, graph, temporal)?, self.boxed_arg(function, args, 1, graph, temporal)?),
            Function::StrDt => PlanExpression::StrDt(self.boxed_arg(function, args, 0, graph, temporal)?, self.boxed_arg(function, args, 1, graph, temporal)?),
            Function::IsIri => PlanExpression::IsIri(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::IsBlank => PlanExpression::IsBlank(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::IsLiteral => PlanExpression::IsLiteral(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::IsNumeric => PlanExpression::IsNumeric(self.boxed_arg(function, args, 0, graph, temporal)?),
            Function::Regex => PlanExpression::Regex(
                self.boxed_arg(function, args, 0, graph, temporal)?,
                self.boxed_arg(function, args, 1, graph, temporal)?,
                if args.len() > 2 { Some(self.boxed_arg(function, args, 2, graph, temporal)?) } else { None },
            ),
            Function::Custom(name) => {
                let cast = if *name == xsd::BOOLEAN {
                    Some(CastKind::Boolean)
                } else if *name == xsd::INTEGER {
                    Some(CastKind::Integer)
                } else if *name == xsd::DECIMAL {
                    Some(CastKind::Decimal)
                } else if *name == xsd::FLOAT {
                    Some(CastKind::Float)
                } else if *name == xsd::DOUBLE {
                    Some(CastKind::Double)
                } else if *name == xsd::STRING {
                    Some(CastKind::String)
                } else if *name == xsd::DATE_TIME {
                    Some(CastKind::DateTime)
                } else {
                    None
                };
                match cast {
                    Some(kind) => PlanExpression::Cast(kind, self.boxed_arg(function, args, 0, graph, temporal)?),
                    None => {
                        return Err(QueryPlanError::Unsupported(format!(
                            "the function {name} is not supported"
                        ))
                        .into())
                    }
                }
            }
        })
    }

    fn check_group_projection(
        &self,
        inner: &GraphPattern,
        projected: &[Variable],
    ) -> Result<(), QueryPlanError> {
        let GraphPattern::Group {
            variables,
            aggregates,
            ..
        } = skip_modifiers(inner)
        else {
            return Ok(());
        };
        for v in projected {
            let grouped = variables.contains(v)
                || aggregates.iter().any(|(alias, _)| alias == v)
                || extend_defines(inner, v);
            if !grouped {
                return Err(QueryPlanError::UngroupedVariable(v.clone()));
            }
        }
        Ok(())
    }

    fn check_aggregate_aliases(
        &self,
        keys: &[Variable],
        aggregates: &[(Variable, AggregateExpression)],
    ) -> Result<(), QueryPlanError> {
        for (i, (alias, _)) in aggregates.iter().enumerate() {
            if keys.contains(alias)
                || aggregates[..i].iter().any(|(other, _)| other == alias)
            {
                return Err(QueryPlanError::DuplicateAlias(alias.clone()));
            }
        }
        Ok(())
    }

    fn estimate_quad_pattern(
        &self,
        subject: PatternValue,
        predicate: PatternValue,
        object: PatternValue,
        graph: PatternValue,
    ) -> u64 {
        let constant = |v: PatternValue| match v {
            PatternValue::Constant(atom) => Some(atom),
            PatternValue::Variable(_) => None,
        };
        let graph_spec = match graph {
            PatternValue::Constant(atom) if atom.is_default_graph() => Some(None),
            PatternValue::Constant(atom) => Some(Some(atom)),
            PatternValue::Variable(_) => None,
        };
        self.dataset.estimate_pattern(
            constant(subject),
            constant(predicate),
            constant(object),
            graph_spec,
        )
    }

    /// A rough size guess for a whole group, just for join strategy choice.
    fn estimate_group(&mut self, pattern: &GraphPattern, graph: PatternValue) -> u64 {
        match pattern {
            GraphPattern::Bgp { patterns } => patterns
                .iter()
                .map(|p| {
                    let subject = self
                        .pattern_value(&p.subject)
                        .unwrap_or(PatternValue::Variable(usize::MAX));
                    let predicate = match &p.predicate {
                        NamedNodePattern::NamedNode(node) => self
                            .dataset
                            .encode_term(node.as_ref().into())
                            .map(PatternValue::Constant)
                            .unwrap_or(PatternValue::Variable(usize::MAX)),
                        NamedNodePattern::Variable(_) => PatternValue::Variable(usize::MAX),
                    };
                    let object = self
                        .pattern_value(&p.object)
                        .unwrap_or(PatternValue::Variable(usize::MAX));
                    self.estimate_quad_pattern(subject, predicate, object, graph)
                })
                .min()
                .unwrap_or(1),
            GraphPattern::Values { bindings, .. } => bindings.len() as u64,
            GraphPattern::Join { left, right } => self
                .estimate_group(left, graph)
                .min(self.estimate_group(right, graph)),
            GraphPattern::Union { left, right } => self
                .estimate_group(left, graph)
                .saturating_add(self.estimate_group(right, graph)),
            GraphPattern::Filter { inner, .. }
            | GraphPattern::Distinct { inner }
            | GraphPattern::Reduced { inner }
            | GraphPattern::Project { inner, .. }
            | GraphPattern::OrderBy { inner, .. }
            | GraphPattern::Extend { inner, .. }
            | GraphPattern::Graph { inner, .. }
            | GraphPattern::Temporal { inner, .. }
            | GraphPattern::LeftJoin { left: inner, .. }
            | GraphPattern::Minus { left: inner, .. } => self.estimate_group(inner, graph),
            GraphPattern::Slice { inner, length, .. } => length
                .map_or_else(|| self.estimate_group(inner, graph), |l| l as u64),
            _ => u64::MAX,
        }
    }

    fn shared_variable_positions(
        &mut self,
        left: &GraphPattern,
        right: &GraphPattern,
    ) -> Vec<usize> {
        let mut left_vars = Vec::new();
        in_scope_variables(left, &mut left_vars);
        let mut right_vars = Vec::new();
        in_scope_variables(right, &mut right_vars);
        left_vars
            .iter()
            .filter(|v| right_vars.contains(v))
            .map(|v| self.encode_variable(v))
            .collect()
    }

    fn encode_variable(&mut self, variable: &Variable) -> usize {
        match self.variables.iter().position(|v| v == variable) {
            Some(position) => position,
            None => {
                self.variables.push(variable.clone());
                self.variables.len() - 1
            }
        }
    }
}

/// Resolves a temporal clause into the filter scans apply, rejecting
/// malformed literals before execution.
pub fn resolve_temporal_clause(
    clause: &TemporalClause,
) -> Result<TemporalFilter, QueryPlanError> {
    Ok(match clause {
        TemporalClause::AsOf(literal) => TemporalFilter::AsOf(parse_temporal_literal(literal)?),
        TemporalClause::During(start, end) => {
            let start = parse_temporal_literal(start)?;
            let end = parse_temporal_literal(end)?;
            if start >= end {
                return Err(QueryPlanError::InvalidTemporalLiteral(format!(
                    "empty DURING range [{start}, {end})"
                )));
            }
            TemporalFilter::During(start, end)
        }
        TemporalClause::AllVersions => TemporalFilter::All,
    })
}

fn parse_temporal_literal(literal: &Literal) -> Result<Timestamp, QueryPlanError> {
    let datatype = literal.datatype();
    if datatype != xsd::DATE_TIME && datatype != xsd::DATE && datatype != xsd::STRING {
        return Err(QueryPlanError::InvalidTemporalLiteral(literal.to_string()));
    }
    temporal::parse_timestamp(literal.value())
        .ok_or_else(|| QueryPlanError::InvalidTemporalLiteral(literal.to_string()))
}

/// Peels the solution modifier wrappers off a pattern.
fn skip_modifiers(pattern: &GraphPattern) -> &GraphPattern {
    match pattern {
        GraphPattern::Distinct { inner }
        | GraphPattern::Reduced { inner }
        | GraphPattern::Project { inner, .. }
        | GraphPattern::Slice { inner, .. }
        | GraphPattern::OrderBy { inner, .. }
        | GraphPattern::Filter { inner, .. }
        | GraphPattern::Extend { inner, .. } => skip_modifiers(inner),
        pattern => pattern,
    }
}

fn has_projection(pattern: &GraphPattern) -> bool {
    match pattern {
        GraphPattern::Project { .. } => true,
        GraphPattern::Distinct { inner }
        | GraphPattern::Reduced { inner }
        | GraphPattern::Slice { inner, .. }
        | GraphPattern::OrderBy { inner, .. } => has_projection(inner),
        _ => false,
    }
}

/// Whether an `Extend` between the projection and the group defines `v`
/// (projected aggregate aliases travel through such binds).
fn extend_defines(pattern: &GraphPattern, v: &Variable) -> bool {
    match pattern {
        GraphPattern::Extend {
            inner, variable, ..
        } => variable == v || extend_defines(inner, v),
        GraphPattern::Distinct { inner }
        | GraphPattern::Reduced { inner }
        | GraphPattern::Project { inner, .. }
        | GraphPattern::Slice { inner, .. }
        | GraphPattern::OrderBy { inner, .. }
        | GraphPattern::Filter { inner, .. } => extend_defines(inner, v),
        _ => false,
    }
}

/// The variables a pattern may bind, in first-occurrence order.
pub fn in_scope_variables(pattern: &GraphPattern, into: &mut Vec<Variable>) {
    let mut push = |v: &Variable| {
        if !into.contains(v) && !v.as_str().starts_with("__") {
            into.push(v.clone());
        }
    };
    match pattern {
        GraphPattern::Bgp { patterns } => {
            for triple in patterns {
                term_variables(&triple.subject, &mut push);
                if let NamedNodePattern::Variable(v) = &triple.predicate {
                    push(v);
                }
                term_variables(&triple.object, &mut push);
            }
        }
        GraphPattern::Path {
            subject, object, ..
        } => {
            term_variables(subject, &mut push);
            term_variables(object, &mut push);
        }
        GraphPattern::Join { left, right }
        | GraphPattern::LeftJoin { left, right, .. }
        | GraphPattern::Union { left, right } => {
            in_scope_variables(left, into);
            in_scope_variables(right, into);
        }
        GraphPattern::Minus { left, .. } => in_scope_variables(left, into),
        GraphPattern::Filter { inner, .. }
        | GraphPattern::Distinct { inner }
        | GraphPattern::Reduced { inner }
        | GraphPattern::Slice { inner, .. }
        | GraphPattern::OrderBy { inner, .. }
        | GraphPattern::Temporal { inner, .. } => in_scope_variables(inner, into),
        GraphPattern::Graph { name, inner } => {
            if let NamedNodePattern::Variable(v) = name {
                push(v);
            }
            in_scope_variables(inner, into);
        }
        GraphPattern::Extend {
            inner, variable, ..
        } => {
            in_scope_variables(inner, into);
            if !into.contains(variable) {
                into.push(variable.clone());
            }
        }
        GraphPattern::Values { variables, .. } | GraphPattern::Project { variables, .. } => {
            for v in variables {
                if !into.contains(v) {
                    into.push(v.clone());
                }
            }
        }
        GraphPattern::Group {
            variables,
            aggregates,
            ..
        } => {
            for v in variables {
                if !into.contains(v) {
                    into.push(v.clone());
                }
            }
            for (alias, _) in aggregates {
                if !into.contains(alias) {
                    into.push(alias.clone());
                }
            }
        }
        GraphPattern::Service { name, inner, .. } => {
            if let NamedNodePattern::Variable(v) = name {
                push(v);
            }
            in_scope_variables(inner, into);
        }
    }
}

fn term_variables(term: &TermPattern, push: &mut impl FnMut(&Variable)) {
    match term {
        TermPattern::Variable(v) => push(v),
        TermPattern::QuotedTriple(quoted) => {
            term_variables(&quoted.subject, push);
            if let NamedNodePattern::Variable(v) = &quoted.predicate {
                push(v);
            }
            term_variables(&quoted.object, push);
        }
        _ => {}
    }
}

fn split_conjunction<'e>(expression: &'e Expression, into: &mut Vec<&'e Expression>) {
    if let Expression::And(a, b) = expression {
        split_conjunction(a, into);
        split_conjunction(b, into);
    } else {
        into.push(expression);
    }
}

fn expression_variables(expression: &PlanExpression, into: &mut FxHashSet<usize>) {
    match expression {
        PlanExpression::Variable(v) | PlanExpression::Bound(v) => {
            into.insert(*v);
        }
        PlanExpression::Constant(_) | PlanExpression::BNode(None) => {}
        PlanExpression::UnaryPlus(e)
        | PlanExpression::UnaryMinus(e)
        | PlanExpression::Not(e)
        | PlanExpression::Str(e)
        | PlanExpression::Lang(e)
        | PlanExpression::Datatype(e)
        | PlanExpression::Iri(e)
        | PlanExpression::BNode(Some(e))
        | PlanExpression::Abs(e)
        | PlanExpression::Ceil(e)
        | PlanExpression::Floor(e)
        | PlanExpression::Round(e)
        | PlanExpression::StrLen(e)
        | PlanExpression::UCase(e)
        | PlanExpression::LCase(e)
        | PlanExpression::EncodeForUri(e)
        | PlanExpression::IsIri(e)
        | PlanExpression::IsBlank(e)
        | PlanExpression::IsLiteral(e)
        | PlanExpression::IsNumeric(e)
        | PlanExpression::Cast(_, e) => expression_variables(e, into),
        PlanExpression::Or(a, b)
        | PlanExpression::And(a, b)
        | PlanExpression::Equal(a, b)
        | PlanExpression::SameTerm(a, b)
        | PlanExpression::Greater(a, b)
        | PlanExpression::GreaterOrEqual(a, b)
        | PlanExpression::Less(a, b)
        | PlanExpression::LessOrEqual(a, b)
        | PlanExpression::Add(a, b)
        | PlanExpression::Subtract(a, b)
        | PlanExpression::Multiply(a, b)
        | PlanExpression::Divide(a, b)
        | PlanExpression::LangMatches(a, b)
        | PlanExpression::Contains(a, b)
        | PlanExpression::StrStarts(a, b)
        | PlanExpression::StrEnds(a, b)
        | PlanExpression::StrBefore(a, b)
        | PlanExpression::StrAfter(a, b)
        | PlanExpression::StrLang(a, b)
        | PlanExpression::StrDt(a, b)
        | PlanExpression::SubStr(a, b, None)
        | PlanExpression::Regex(a, b, None) => {
            expression_variables(a, into);
            expression_variables(b, into);
        }
        PlanExpression::If(a, b, c)
        | PlanExpression::SubStr(a, b, Some(c))
        | PlanExpression::Regex(a, b, Some(c))
        | PlanExpression::Replace(a, b, c, None) => {
            expression_variables(a, into);
            expression_variables(b, into);
            expression_variables(c, into);
        }
        PlanExpression::Replace(a, b, c, Some(d)) => {
            expression_variables(a, into);
            expression_variables(b, into);
            expression_variables(c, into);
            expression_variables(d, into);
        }
        PlanExpression::Concat(es) | PlanExpression::Coalesce(es) => {
            for e in es {
                expression_variables(e, into);
            }
        }
        PlanExpression::In(a, bs) => {
            expression_variables(a, into);
            for b in bs {
                expression_variables(b, into);
            }
        }
        // Conservative: an EXISTS filter waits until the end of the chain.
        PlanExpression::Exists(_) => {
            into.insert(usize::MAX);
        }
    }
}
