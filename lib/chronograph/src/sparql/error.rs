use crate::model::{NamedNode, Term, Variable};
use crate::storage::StorageError;
use std::error::Error;
use std::time::Duration;
use thiserror::Error;

/// An error raised while planning a query, before anything executes. The
/// store is left untouched.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryPlanError {
    /// `SELECT *` combined with `GROUP BY`.
    #[error("SELECT * is not allowed with GROUP BY")]
    SelectStarWithGroupBy,
    /// A projected variable is neither grouped nor an aggregate alias.
    #[error("The variable {0} is projected but neither grouped nor aggregated")]
    UngroupedVariable(Variable),
    /// Two projected expressions share an alias.
    #[error("The alias {0} is bound twice in the projection")]
    DuplicateAlias(Variable),
    /// A malformed `AS OF` / `DURING` timestamp literal.
    #[error("Invalid temporal literal: {0}")]
    InvalidTemporalLiteral(String),
    /// Nested subqueries past the configured recursion cap.
    #[error("Subqueries nested deeper than the limit of {0}")]
    SubqueryDepthExceeded(usize),
    /// An algebra construct the engine does not evaluate.
    #[error("Unsupported construct: {0}")]
    Unsupported(String),
}

/// A SPARQL evaluation error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryEvaluationError {
    /// Error from the storage layer.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Error raised before execution started.
    #[error(transparent)]
    Plan(#[from] QueryPlanError),
    /// Error during `SERVICE` evaluation.
    #[error("{0}")]
    Service(#[source] Box<dyn Error + Send + Sync>),
    /// The variable storing the `SERVICE` name is unbound.
    #[error("The variable encoding the service name is unbound")]
    UnboundService,
    /// The term naming the `SERVICE` endpoint is not an IRI.
    #[error("{0} is not a valid service name")]
    InvalidServiceName(Term),
    /// No handler is registered for the `SERVICE` endpoint.
    #[error("The service {0} is not supported")]
    UnsupportedService(NamedNode),
    /// Property path expansion exceeded the step budget.
    #[error("Property path evaluation exceeded the budget of {0} steps")]
    PathBudgetExceeded(usize),
    /// Execution exceeded the configured deadline.
    #[error("Query execution exceeded the timeout of {0:?}")]
    Timeout(Duration),
    #[doc(hidden)]
    #[error(transparent)]
    Unexpected(Box<dyn Error + Send + Sync>),
}

/// An error raised while executing a SPARQL update. The whole update rolls
/// back.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpdateEvaluationError {
    /// Error from the storage layer.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Error while evaluating the `WHERE` part.
    #[error(transparent)]
    Query(#[from] QueryEvaluationError),
    /// `CREATE` of a graph that already has content.
    #[error("The graph {0} already exists")]
    GraphAlreadyExists(NamedNode),
    /// `CLEAR`/`DROP` of a graph with no content.
    #[error("The graph {0} does not exist")]
    GraphDoesNotExist(NamedNode),
    /// `LOAD` was executed with no document loader configured.
    #[error("No document loader is configured, cannot LOAD")]
    NoDocumentLoader,
    /// The document loader failed.
    #[error("Loading {iri} failed: {error}")]
    Load {
        iri: String,
        #[source]
        error: Box<dyn Error + Send + Sync>,
    },
}

impl From<QueryPlanError> for UpdateEvaluationError {
    #[inline]
    fn from(error: QueryPlanError) -> Self {
        Self::Query(error.into())
    }
}
