//! Term patterns: the data terms of [`oxrdf`] extended with variables and
//! quoted triples, as they appear inside query and update patterns.

use oxrdf::{
    BlankNode, GraphName, Literal, NamedNode, NamedOrBlankNode, Quad, Subject, Term, Variable,
};
use std::fmt;

/// The union of [`NamedNode`] and [`Variable`], used in predicate and graph
/// name positions.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum NamedNodePattern {
    NamedNode(NamedNode),
    Variable(Variable),
}

impl fmt::Display for NamedNodePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NamedNode(node) => node.fmt(f),
            Self::Variable(var) => var.fmt(f),
        }
    }
}

impl From<NamedNode> for NamedNodePattern {
    fn from(node: NamedNode) -> Self {
        Self::NamedNode(node)
    }
}

impl From<Variable> for NamedNodePattern {
    fn from(var: Variable) -> Self {
        Self::Variable(var)
    }
}

/// The union of all RDF terms, variables and quoted triples.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum TermPattern {
    NamedNode(NamedNode),
    BlankNode(BlankNode),
    Literal(Literal),
    Variable(Variable),
    /// A quoted triple `<< s p o >>`. Expanded into reification patterns by
    /// the planner, never stored as-is.
    QuotedTriple(Box<QuotedTriplePattern>),
}

impl TermPattern {
    pub fn is_variable(&self) -> bool {
        matches!(self, Self::Variable(_))
    }
}

impl fmt::Display for TermPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NamedNode(term) => term.fmt(f),
            Self::BlankNode(term) => term.fmt(f),
            Self::Literal(term) => term.fmt(f),
            Self::Variable(var) => var.fmt(f),
            Self::QuotedTriple(triple) => triple.fmt(f),
        }
    }
}

impl From<NamedNode> for TermPattern {
    fn from(term: NamedNode) -> Self {
        Self::NamedNode(term)
    }
}

impl From<BlankNode> for TermPattern {
    fn from(term: BlankNode) -> Self {
        Self::BlankNode(term)
    }
}

impl From<Literal> for TermPattern {
    fn from(term: Literal) -> Self {
        Self::Literal(term)
    }
}

impl From<Variable> for TermPattern {
    fn from(var: Variable) -> Self {
        Self::Variable(var)
    }
}

impl From<NamedNodePattern> for TermPattern {
    fn from(pattern: NamedNodePattern) -> Self {
        match pattern {
            NamedNodePattern::NamedNode(node) => node.into(),
            NamedNodePattern::Variable(var) => var.into(),
        }
    }
}

impl From<Term> for TermPattern {
    fn from(term: Term) -> Self {
        match term {
            Term::NamedNode(node) => node.into(),
            Term::BlankNode(node) => node.into(),
            Term::Literal(literal) => literal.into(),
        }
    }
}

/// A [`TermPattern`] without blank nodes and variables, usable in `DELETE`
/// templates and `VALUES` rows.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum GroundTerm {
    NamedNode(NamedNode),
    Literal(Literal),
}

impl fmt::Display for GroundTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NamedNode(term) => term.fmt(f),
            Self::Literal(term) => term.fmt(f),
        }
    }
}

impl From<NamedNode> for GroundTerm {
    fn from(term: NamedNode) -> Self {
        Self::NamedNode(term)
    }
}

impl From<Literal> for GroundTerm {
    fn from(term: Literal) -> Self {
        Self::Literal(term)
    }
}

impl From<GroundTerm> for Term {
    fn from(term: GroundTerm) -> Self {
        match term {
            GroundTerm::NamedNode(node) => node.into(),
            GroundTerm::Literal(literal) => literal.into(),
        }
    }
}

impl From<GroundTerm> for TermPattern {
    fn from(term: GroundTerm) -> Self {
        match term {
            GroundTerm::NamedNode(node) => node.into(),
            GroundTerm::Literal(literal) => literal.into(),
        }
    }
}

/// A quoted triple `<< s p o >>` in a pattern position.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct QuotedTriplePattern {
    pub subject: TermPattern,
    pub predicate: NamedNodePattern,
    pub object: TermPattern,
}

impl fmt::Display for QuotedTriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<< {} {} {} >>", self.subject, self.predicate, self.object)
    }
}

/// A triple pattern of a basic graph pattern.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct TriplePattern {
    pub subject: TermPattern,
    pub predicate: NamedNodePattern,
    pub object: TermPattern,
}

impl TriplePattern {
    pub fn new(
        subject: impl Into<TermPattern>,
        predicate: impl Into<NamedNodePattern>,
        object: impl Into<TermPattern>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} .", self.subject, self.predicate, self.object)
    }
}

/// A graph name position in a quad pattern: a named node, a variable or the
/// default graph.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum GraphNamePattern {
    NamedNode(NamedNode),
    DefaultGraph,
    Variable(Variable),
}

impl fmt::Display for GraphNamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NamedNode(node) => node.fmt(f),
            Self::DefaultGraph => f.write_str("DEFAULT"),
            Self::Variable(var) => var.fmt(f),
        }
    }
}

impl From<NamedNode> for GraphNamePattern {
    fn from(node: NamedNode) -> Self {
        Self::NamedNode(node)
    }
}

impl From<Variable> for GraphNamePattern {
    fn from(var: Variable) -> Self {
        Self::Variable(var)
    }
}

impl From<NamedOrBlankNode> for GraphNamePattern {
    fn from(node: NamedOrBlankNode) -> Self {
        match node {
            NamedOrBlankNode::NamedNode(node) => Self::NamedNode(node),
            // Blank graph names only appear in already-labelled data; the
            // planner treats them as opaque constants.
            NamedOrBlankNode::BlankNode(node) => {
                Self::NamedNode(NamedNode::new_unchecked(format!("_:{}", node.as_str())))
            }
        }
    }
}

/// A quad pattern of an `INSERT` template.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct QuadPattern {
    pub subject: TermPattern,
    pub predicate: NamedNodePattern,
    pub object: TermPattern,
    pub graph_name: GraphNamePattern,
}

impl QuadPattern {
    pub fn new(
        subject: impl Into<TermPattern>,
        predicate: impl Into<NamedNodePattern>,
        object: impl Into<TermPattern>,
        graph_name: impl Into<GraphNamePattern>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            graph_name: graph_name.into(),
        }
    }
}

impl fmt::Display for QuadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.graph_name == GraphNamePattern::DefaultGraph {
            write!(f, "{} {} {} .", self.subject, self.predicate, self.object)
        } else {
            write!(
                f,
                "GRAPH {} {{ {} {} {} . }}",
                self.graph_name, self.subject, self.predicate, self.object
            )
        }
    }
}

/// A quad pattern without blank nodes, usable in `DELETE` templates.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct GroundQuadPattern {
    pub subject: TermPattern,
    pub predicate: NamedNodePattern,
    pub object: TermPattern,
    pub graph_name: GraphNamePattern,
}

impl fmt::Display for GroundQuadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.graph_name == GraphNamePattern::DefaultGraph {
            write!(f, "{} {} {} .", self.subject, self.predicate, self.object)
        } else {
            write!(
                f,
                "GRAPH {} {{ {} {} {} . }}",
                self.graph_name, self.subject, self.predicate, self.object
            )
        }
    }
}

/// A ground (blank-node free) quad, as carried by `DELETE DATA`.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct GroundQuad {
    pub subject: NamedNode,
    pub predicate: NamedNode,
    pub object: GroundTerm,
    pub graph_name: GraphName,
}

impl From<GroundQuad> for Quad {
    fn from(quad: GroundQuad) -> Self {
        Self {
            subject: Subject::NamedNode(quad.subject),
            predicate: quad.predicate,
            object: quad.object.into(),
            graph_name: quad.graph_name,
        }
    }
}

impl fmt::Display for GroundQuad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.graph_name == GraphName::DefaultGraph {
            write!(f, "{} {} {} .", self.subject, self.predicate, self.object)
        } else {
            write!(
                f,
                "GRAPH {} {{ {} {} {} . }}",
                self.graph_name, self.subject, self.predicate, self.object
            )
        }
    }
}

