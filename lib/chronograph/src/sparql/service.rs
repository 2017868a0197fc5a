//! `SERVICE` delegation: the federation endpoint collaborator.
//!
//! The engine ships the subpattern to a registered handler and treats the
//! returned bindings as a solution sequence. With `SILENT`, a failing or
//! missing handler contributes the empty sequence instead of an error.

use crate::model::{NamedNode, Term, Variable};
use chronogebra::algebra::GraphPattern;
use rustc_hash::FxHashMap;
use std::error::Error;
use std::sync::Arc;

/// The bindings one `SERVICE` call returns: one row per solution, each row
/// a set of (variable, term) pairs over the subpattern's free variables.
pub type ServiceSolutions = Vec<Vec<(Variable, Term)>>;

/// Evaluates a graph pattern against a federation endpoint.
pub trait ServiceHandler: Send + Sync {
    fn handle(
        &self,
        service: NamedNode,
        pattern: &GraphPattern,
    ) -> Result<ServiceSolutions, Box<dyn Error + Send + Sync>>;
}

impl<F> ServiceHandler for F
where
    F: Fn(NamedNode, &GraphPattern) -> Result<ServiceSolutions, Box<dyn Error + Send + Sync>>
        + Send
        + Sync,
{
    fn handle(
        &self,
        service: NamedNode,
        pattern: &GraphPattern,
    ) -> Result<ServiceSolutions, Box<dyn Error + Send + Sync>> {
        self(service, pattern)
    }
}

/// Maps endpoint IRIs to their handlers, with an optional fallback.
#[derive(Clone, Default)]
pub struct ServiceHandlerRegistry {
    handlers: FxHashMap<NamedNode, Arc<dyn ServiceHandler>>,
    default: Option<Arc<dyn ServiceHandler>>,
}

impl ServiceHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, service: NamedNode, handler: Arc<dyn ServiceHandler>) -> Self {
        self.handlers.insert(service, handler);
        self
    }

    #[must_use]
    pub fn with_default_handler(mut self, handler: Arc<dyn ServiceHandler>) -> Self {
        self.default = Some(handler);
        self
    }

    pub fn get(&self, service: &NamedNode) -> Option<&Arc<dyn ServiceHandler>> {
        self.handlers.get(service).or(self.default.as_ref())
    }
}
