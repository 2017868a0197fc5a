//! The executable plan: a closed sum of operators dispatched with a
//! `match`, produced by the plan builder and consumed by the evaluator.
//!
//! Variables are numbered into positions of an [`EncodedTuple`]; terms are
//! atom ids (query-local ids for constants absent from the dictionary).

use crate::storage::atoms::AtomId;
use crate::temporal::TemporalFilter;
use std::rc::Rc;

/// A plan operator. Every operator produces a finite, ordered, restartable
/// lazy sequence of solution tuples.
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// Emits the input tuple unchanged, once.
    Init,
    /// Inline solutions (`VALUES`), joined with the input tuple.
    StaticBindings { tuples: Vec<EncodedTuple> },
    /// An index scan joined against the input: for every input tuple, scan
    /// the pattern with the tuple's bindings substituted.
    QuadPattern {
        child: Rc<PlanNode>,
        subject: PatternValue,
        predicate: PatternValue,
        object: PatternValue,
        graph: PatternValue,
        temporal: TemporalFilter,
    },
    /// A property path scan joined against the input.
    PathPattern {
        child: Rc<PlanNode>,
        subject: PatternValue,
        path: Rc<PlanPropertyPath>,
        object: PatternValue,
        graph: PatternValue,
        temporal: TemporalFilter,
    },
    /// Join of two independent groups.
    Join {
        left: Rc<PlanNode>,
        right: Rc<PlanNode>,
        strategy: JoinStrategy,
    },
    /// `MINUS`: left solutions with no compatible right solution sharing at
    /// least one bound variable.
    AntiJoin {
        left: Rc<PlanNode>,
        right: Rc<PlanNode>,
    },
    /// `OPTIONAL`, with the filter evaluated on the combined solution.
    LeftJoin {
        left: Rc<PlanNode>,
        right: Rc<PlanNode>,
        expression: Option<Rc<PlanExpression>>,
    },
    Filter {
        child: Rc<PlanNode>,
        expression: Rc<PlanExpression>,
    },
    /// Order-preserving concatenation.
    Union {
        left: Rc<PlanNode>,
        right: Rc<PlanNode>,
    },
    /// `BIND`: extends solutions with an evaluated expression.
    Extend {
        child: Rc<PlanNode>,
        position: usize,
        expression: Rc<PlanExpression>,
    },
    Sort {
        child: Rc<PlanNode>,
        by: Vec<Comparator>,
    },
    HashDeduplicate { child: Rc<PlanNode> },
    Skip { child: Rc<PlanNode>, count: usize },
    Limit { child: Rc<PlanNode>, count: usize },
    /// Restricts and renumbers variables: (position in child, position in
    /// output) pairs.
    Project {
        child: Rc<PlanNode>,
        mapping: Rc<Vec<(usize, usize)>>,
    },
    /// `GROUP BY` + aggregates. Keys are (child position, output position)
    /// pairs; each aggregation lands in its output position.
    Aggregate {
        child: Rc<PlanNode>,
        key_mapping: Rc<Vec<(usize, usize)>>,
        aggregates: Rc<Vec<(PlanAggregation, usize)>>,
    },
    /// Ships a subpattern to a federation endpoint.
    Service {
        child: Rc<PlanNode>,
        name: PatternValue,
        pattern: Rc<chronogebra::algebra::GraphPattern>,
        variables: Rc<Vec<(oxrdf::Variable, usize)>>,
        silent: bool,
    },
    /// `EXISTS` / `NOT EXISTS` as a solution filter.
    ExistsFilter {
        child: Rc<PlanNode>,
        pattern: Rc<PlanNode>,
        negated: bool,
    },
}

/// How a [`PlanNode::Join`] is executed.
#[derive(Debug, Clone)]
pub enum JoinStrategy {
    /// Materialize the left side, stream the right, emit compatible pairs.
    /// Right when one side is small.
    NestedLoop,
    /// Build a hash multi-map over the shared variables from the right
    /// side, probe with the left.
    Hash { keys: Rc<Vec<usize>> },
}

/// A term position of a pattern: a constant atom or a tuple slot.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum PatternValue {
    Constant(AtomId),
    Variable(usize),
}

/// An expression over tuple slots, evaluated per solution.
#[derive(Debug, Clone)]
pub enum PlanExpression {
    Constant(AtomId),
    Variable(usize),
    Bound(usize),
    Or(Box<Self>, Box<Self>),
    And(Box<Self>, Box<Self>),
    Equal(Box<Self>, Box<Self>),
    SameTerm(Box<Self>, Box<Self>),
    Greater(Box<Self>, Box<Self>),
    GreaterOrEqual(Box<Self>, Box<Self>),
    Less(Box<Self>, Box<Self>),
    LessOrEqual(Box<Self>, Box<Self>),
    In(Box<Self>, Vec<Self>),
    Add(Box<Self>, Box<Self>),
    Subtract(Box<Self>, Box<Self>),
    Multiply(Box<Self>, Box<Self>),
    Divide(Box<Self>, Box<Self>),
    UnaryPlus(Box<Self>),
    UnaryMinus(Box<Self>),
    Not(Box<Self>),
    If(Box<Self>, Box<Self>, Box<Self>),
    Coalesce(Vec<Self>),
    Exists(Rc<PlanNode>),
    Str(Box<Self>),
    Lang(Box<Self>),
    LangMatches(Box<Self>, Box<Self>),
    Datatype(Box<Self>),
    Iri(Box<Self>),
    BNode(Option<Box<Self>>),
    Abs(Box<Self>),
    Ceil(Box<Self>),
    Floor(Box<Self>),
    Round(Box<Self>),
    Concat(Vec<Self>),
    SubStr(Box<Self>, Box<Self>, Option<Box<Self>>),
    StrLen(Box<Self>),
    Replace(Box<Self>, Box<Self>, Box<Self>, Option<Box<Self>>),
    UCase(Box<Self>),
    LCase(Box<Self>),
    EncodeForUri(Box<Self>),
    Contains(Box<Self>, Box<Self>),
    StrStarts(Box<Self>, Box<Self>),
    StrEnds(Box<Self>, Box<Self>),
    StrBefore(Box<Self>, Box<Self>),
    StrAfter(Box<Self>, Box<Self>),
    StrLang(Box<Self>, Box<Self>),
    StrDt(Box<Self>, Box<Self>),
    IsIri(Box<Self>),
    IsBlank(Box<Self>),
    IsLiteral(Box<Self>),
    IsNumeric(Box<Self>),
    Regex(Box<Self>, Box<Self>, Option<Box<Self>>),
    /// An XSD constructor cast, e.g. `xsd:integer(?x)`.
    Cast(CastKind, Box<Self>),
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CastKind {
    Boolean,
    Integer,
    Decimal,
    Float,
    Double,
    String,
    DateTime,
}

/// An aggregation of one group.
#[derive(Debug, Clone)]
pub struct PlanAggregation {
    pub function: PlanAggregationFunction,
    pub parameter: Option<PlanExpression>,
    pub distinct: bool,
}

#[derive(Debug, Clone)]
pub enum PlanAggregationFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Sample,
    GroupConcat { separator: Rc<str> },
}

/// A compiled property path over atom ids.
#[derive(Debug, Clone)]
pub enum PlanPropertyPath {
    Predicate(AtomId),
    Inverse(Rc<Self>),
    Sequence(Rc<Self>, Rc<Self>),
    Alternative(Rc<Self>, Rc<Self>),
    ZeroOrMore(Rc<Self>),
    OneOrMore(Rc<Self>),
    ZeroOrOne(Rc<Self>),
    NegatedPropertySet(Rc<Vec<AtomId>>),
}

/// An `ORDER BY` key.
#[derive(Debug, Clone)]
pub enum Comparator {
    Asc(PlanExpression),
    Desc(PlanExpression),
}

/// A `CONSTRUCT` template triple over tuple slots.
#[derive(Debug, Clone, Copy)]
pub struct TripleTemplate {
    pub subject: TripleTemplateValue,
    pub predicate: TripleTemplateValue,
    pub object: TripleTemplateValue,
}

#[derive(Debug, Clone, Copy)]
pub enum TripleTemplateValue {
    Constant(AtomId),
    /// A blank node scoped to each solution.
    BlankNode(usize),
    Variable(usize),
}

/// A positional solution mapping: `None` means unbound.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Default)]
pub struct EncodedTuple {
    inner: Vec<Option<AtomId>>,
}

impl EncodedTuple {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.inner.get(index).is_some_and(Option::is_some)
    }

    pub fn get(&self, index: usize) -> Option<AtomId> {
        self.inner.get(index).copied().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<AtomId>> + '_ {
        self.inner.iter().copied()
    }

    pub fn set(&mut self, index: usize, value: AtomId) {
        if self.inner.len() <= index {
            self.inner.resize(index + 1, None);
        }
        self.inner[index] = Some(value);
    }

    /// The merge of two compatible tuples; `None` when a shared slot holds
    /// two different values.
    pub fn combine_with(&self, other: &Self) -> Option<Self> {
        let (small, large) = if self.inner.len() < other.inner.len() {
            (self, other)
        } else {
            (other, self)
        };
        let mut result = large.inner.clone();
        for (key, value) in small.inner.iter().enumerate() {
            if let Some(value) = value {
                match &result[key] {
                    Some(existing) => {
                        if existing != value {
                            return None;
                        }
                    }
                    None => result[key] = Some(*value),
                }
            }
        }
        Some(Self { inner: result })
    }

    /// Whether the tuples agree on every slot bound in both, with at least
    /// one such slot (the `MINUS` compatibility test).
    pub fn overlaps_compatibly(&self, other: &Self) -> bool {
        let mut shared = false;
        for (a, b) in self.inner.iter().zip(&other.inner) {
            if let (Some(a), Some(b)) = (a, b) {
                if a != b {
                    return false;
                }
                shared = true;
            }
        }
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::atoms::AtomKind;

    fn atom(n: u64) -> AtomId {
        AtomId::new(AtomKind::NamedNode, n)
    }

    #[test]
    fn combine_merges_disjoint_slots() {
        let mut a = EncodedTuple::default();
        a.set(0, atom(1));
        let mut b = EncodedTuple::default();
        b.set(2, atom(3));
        let merged = a.combine_with(&b).unwrap();
        assert_eq!(merged.get(0), Some(atom(1)));
        assert_eq!(merged.get(1), None);
        assert_eq!(merged.get(2), Some(atom(3)));
    }

    #[test]
    fn combine_rejects_conflicts() {
        let mut a = EncodedTuple::default();
        a.set(0, atom(1));
        let mut b = EncodedTuple::default();
        b.set(0, atom(2));
        assert!(a.combine_with(&b).is_none());
    }

    #[test]
    fn minus_compatibility_requires_a_shared_binding() {
        let mut a = EncodedTuple::default();
        a.set(0, atom(1));
        let mut b = EncodedTuple::default();
        b.set(1, atom(2));
        assert!(!a.overlaps_compatibly(&b));
        b.set(0, atom(1));
        assert!(a.overlaps_compatibly(&b));
    }
}
