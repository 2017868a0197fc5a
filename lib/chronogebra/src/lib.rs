//! Chronogebra is the algebra contract of the chronograph bitemporal quad
//! store: the term patterns, graph patterns, expressions, query and update
//! trees that an external SPARQL text parser must produce and that the
//! chronograph planner consumes.
//!
//! There is deliberately no parser in this crate. The parser collaborator is
//! expected to have resolved prefixes and base IRIs, attached temporal
//! clauses and checked aggregate aliases before building these types.

pub mod algebra;
mod query;
pub mod term;
mod update;

pub use crate::query::Query;
pub use crate::update::{GraphOrDefault, GraphUpdateOperation, Update};
