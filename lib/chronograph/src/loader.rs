//! The document loader collaborator used by SPARQL `LOAD`.
//!
//! RDF surface syntax parsing is outside the store: a loader fetches and
//! parses the resource and hands back plain quads. The store copies every
//! term into its own dictionary before the call returns, so loaders are
//! free to reuse their buffers.

use crate::model::{GraphName, Quad};
use std::error::Error;

/// Fetches and parses a document for `LOAD`.
///
/// The returned quads are inserted as currently-valid statements into the
/// operation's destination graph (the quads' own graph positions are only
/// used when the destination is the default graph).
pub trait DocumentLoader: Send + Sync {
    fn load(&self, source: &str) -> Result<Vec<Quad>, Box<dyn Error + Send + Sync>>;
}

impl<F: Fn(&str) -> Result<Vec<Quad>, Box<dyn Error + Send + Sync>> + Send + Sync> DocumentLoader
    for F
{
    fn load(&self, source: &str) -> Result<Vec<Quad>, Box<dyn Error + Send + Sync>> {
        self(source)
    }
}

/// Retargets loaded quads into a destination graph.
pub(crate) fn retarget(quads: Vec<Quad>, destination: &GraphName) -> Vec<Quad> {
    match destination {
        GraphName::DefaultGraph => quads,
        _ => quads
            .into_iter()
            .map(|q| Quad::new(q.subject, q.predicate, q.object, destination.clone()))
            .collect(),
    }
}
