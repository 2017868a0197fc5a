//! The RDF data model: implemented by [`oxrdf`](https://crates.io/crates/oxrdf)
//! and re-exported here for convenience.
//!
//! Usage example:
//!
//! ```
//! use chronograph::model::*;
//!
//! let quad = Quad::new(
//!     NamedNode::new("http://example.com/s")?,
//!     NamedNode::new("http://example.com/p")?,
//!     Literal::new_simple_literal("o"),
//!     GraphName::DefaultGraph,
//! );
//! assert_eq!(
//!     quad.to_string(),
//!     "<http://example.com/s> <http://example.com/p> \"o\" ."
//! );
//! # Result::<_, oxrdf::IriParseError>::Ok(())
//! ```

pub use oxrdf::{
    vocab, BlankNode, BlankNodeIdParseError, BlankNodeRef, GraphName, GraphNameRef, IriParseError,
    LanguageTagParseError, Literal, LiteralRef, NamedNode, NamedNodeRef, NamedOrBlankNode,
    NamedOrBlankNodeRef, Quad, QuadRef, Subject, SubjectRef, Term, TermParseError, TermRef, Triple,
    TripleRef, Variable, VariableNameParseError,
};
