//! SPARQL query and update evaluation against the store.
//!
//! Queries arrive pre-parsed as [`chronogebra`] trees; the planner compiles
//! them into a closed operator plan and the evaluator pulls solutions out
//! of it lazily. Temporal clauses flow into every index scan underneath.

mod dataset;
mod error;
mod eval;
mod expression;
mod model;
mod plan;
mod plan_builder;
mod service;
mod update;

pub use crate::sparql::error::{QueryEvaluationError, QueryPlanError, UpdateEvaluationError};
pub use crate::sparql::model::{QueryResults, QuerySolution, QuerySolutionIter, QueryTripleIter};
pub use crate::sparql::service::{ServiceHandler, ServiceHandlerRegistry, ServiceSolutions};
pub use chronogebra::{algebra::TemporalClause, Query, Update};

use crate::loader::DocumentLoader;
use crate::sparql::dataset::DatasetView;
use crate::sparql::eval::{EvalContext, SimpleEvaluator};
use crate::sparql::plan_builder::{resolve_temporal_clause, PlanBuilder};
pub(crate) use crate::sparql::update::UpdateEvaluator;
use crate::storage::StorageReader;
use crate::temporal::{self, TemporalFilter};
use oxrdf::{NamedNode, Variable};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Default cap on nested subqueries.
const DEFAULT_RECURSION_LIMIT: usize = 32;
/// Default budget for property path expansion steps.
const DEFAULT_PATH_STEP_BUDGET: usize = 1 << 20;

/// Options of a SPARQL query evaluation.
#[derive(Clone)]
pub struct QueryOptions {
    pub(crate) services: ServiceHandlerRegistry,
    pub(crate) recursion_limit: usize,
    pub(crate) path_step_budget: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) without_optimizations: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            services: ServiceHandlerRegistry::new(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            path_step_budget: DEFAULT_PATH_STEP_BUDGET,
            timeout: None,
            without_optimizations: false,
        }
    }
}

impl QueryOptions {
    /// Registers a [`ServiceHandler`] for one `SERVICE` endpoint.
    #[must_use]
    pub fn with_service_handler(
        mut self,
        service: NamedNode,
        handler: impl ServiceHandler + 'static,
    ) -> Self {
        self.services = self.services.with_handler(service, Arc::new(handler));
        self
    }

    /// Registers the fallback handler for `SERVICE` endpoints without one.
    #[must_use]
    pub fn with_default_service_handler(mut self, handler: impl ServiceHandler + 'static) -> Self {
        self.services = self.services.with_default_handler(Arc::new(handler));
        self
    }

    /// Caps the nesting depth of subqueries (default 32).
    #[must_use]
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Caps the number of property path expansion steps.
    #[must_use]
    pub fn with_path_step_budget(mut self, budget: usize) -> Self {
        self.path_step_budget = budget;
        self
    }

    /// A wall-clock deadline checked between produced solutions.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disables pattern reordering and runs the query as written.
    #[must_use]
    pub fn without_optimizations(mut self) -> Self {
        self.without_optimizations = true;
        self
    }
}

/// Options of a SPARQL update evaluation.
#[derive(Clone, Default)]
pub struct UpdateOptions {
    pub(crate) query_options: QueryOptions,
    pub(crate) loader: Option<Arc<dyn DocumentLoader>>,
}

impl UpdateOptions {
    /// Sets the parser collaborator `LOAD` calls.
    #[must_use]
    pub fn with_document_loader(mut self, loader: impl DocumentLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }
}

impl From<QueryOptions> for UpdateOptions {
    fn from(query_options: QueryOptions) -> Self {
        Self {
            query_options,
            loader: None,
        }
    }
}

/// Evaluates a query against one storage snapshot.
pub(crate) fn evaluate_query(
    reader: StorageReader,
    query: &Query,
    options: &QueryOptions,
) -> Result<QueryResults, QueryEvaluationError> {
    let dataset = Rc::new(DatasetView::new(reader, query.dataset())?);
    let base_temporal = match query.temporal() {
        Some(clause) => resolve_temporal_clause(clause)?,
        None => TemporalFilter::AsOf(temporal::now()),
    };
    let mut builder = PlanBuilder::new(
        &dataset,
        options.recursion_limit,
        !options.without_optimizations,
    );
    match query {
        Query::Select { pattern, .. } => {
            let (plan, variables) = builder.build_projected(pattern, base_temporal)?;
            let variables: Arc<[Variable]> = variables.into();
            let evaluator = evaluator(&dataset, options);
            Ok(QueryResults::Solutions(
                evaluator.evaluate_select(&plan, variables),
            ))
        }
        Query::Ask { pattern, .. } => {
            let plan = builder.build_pattern_root(pattern, base_temporal)?;
            let evaluator = evaluator(&dataset, options);
            Ok(QueryResults::Boolean(evaluator.evaluate_ask(&plan)?))
        }
        Query::Construct {
            template, pattern, ..
        } => {
            let plan = builder.build_pattern_root(pattern, base_temporal)?;
            let templates = builder.build_template(template)?;
            let evaluator = evaluator(&dataset, options);
            Ok(QueryResults::Graph(
                evaluator.evaluate_construct(&plan, templates),
            ))
        }
        Query::Describe { pattern, .. } => {
            let plan = builder.build_pattern_root(pattern, base_temporal)?;
            let evaluator = evaluator(&dataset, options);
            Ok(QueryResults::Graph(
                evaluator.evaluate_describe(&plan, base_temporal),
            ))
        }
    }
}

/// Evaluates a bare pattern into materialized solutions; the update
/// evaluator uses this for `WHERE` clauses before it starts mutating.
pub(crate) fn evaluate_pattern_solutions(
    reader: StorageReader,
    pattern: &chronogebra::algebra::GraphPattern,
    dataset_spec: Option<&chronogebra::algebra::QueryDataset>,
    options: &QueryOptions,
) -> Result<(Vec<Variable>, Vec<Vec<Option<oxrdf::Term>>>), QueryEvaluationError> {
    let dataset = Rc::new(DatasetView::new(reader, dataset_spec)?);
    let temporal = TemporalFilter::AsOf(temporal::now());
    let mut builder = PlanBuilder::new(
        &dataset,
        options.recursion_limit,
        !options.without_optimizations,
    );
    let (plan, variables) = builder.build_projected(pattern, temporal)?;
    let evaluator = evaluator(&dataset, options);
    let mut rows = Vec::new();
    for solution in evaluator.evaluate_select(&plan, variables.clone().into()) {
        rows.push(solution?.values().to_vec());
    }
    Ok((variables, rows))
}

fn evaluator(dataset: &Rc<DatasetView>, options: &QueryOptions) -> SimpleEvaluator {
    SimpleEvaluator::new(Rc::new(EvalContext::new(
        Rc::clone(dataset),
        Rc::new(options.services.clone()),
        options.path_step_budget,
        options.timeout,
    )))
}
