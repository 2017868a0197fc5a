use crate::model::{Term, Triple, Variable};
use crate::sparql::error::QueryEvaluationError;
use std::fmt;
use std::sync::Arc;

/// Results of a [SPARQL query](https://www.w3.org/TR/sparql11-query/).
pub enum QueryResults {
    /// Results of a [SELECT](https://www.w3.org/TR/sparql11-query/#select) query.
    Solutions(QuerySolutionIter),
    /// Result of an [ASK](https://www.w3.org/TR/sparql11-query/#ask) query.
    Boolean(bool),
    /// Results of a [CONSTRUCT](https://www.w3.org/TR/sparql11-query/#construct)
    /// or [DESCRIBE](https://www.w3.org/TR/sparql11-query/#describe) query.
    Graph(QueryTripleIter),
}

impl From<QuerySolutionIter> for QueryResults {
    #[inline]
    fn from(value: QuerySolutionIter) -> Self {
        Self::Solutions(value)
    }
}

impl From<bool> for QueryResults {
    #[inline]
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// One solution mapping: a partial map from the projected variables to
/// terms, positionally aligned with the variable list.
#[derive(Clone)]
pub struct QuerySolution {
    variables: Arc<[Variable]>,
    values: Vec<Option<Term>>,
}

impl QuerySolution {
    /// The value bound to the given variable in this solution, if any.
    pub fn get(&self, variable: impl VariableLookup) -> Option<&Term> {
        variable.find(&self.variables).and_then(|i| {
            self.values.get(i).and_then(Option::as_ref)
        })
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn values(&self) -> &[Option<Term>] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Term)> {
        self.variables
            .iter()
            .zip(&self.values)
            .filter_map(|(variable, value)| Some((variable, value.as_ref()?)))
    }

    pub fn len(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

impl From<(Arc<[Variable]>, Vec<Option<Term>>)> for QuerySolution {
    #[inline]
    fn from((variables, values): (Arc<[Variable]>, Vec<Option<Term>>)) -> Self {
        Self { variables, values }
    }
}

impl fmt::Debug for QuerySolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl PartialEq for QuerySolution {
    fn eq(&self, other: &Self) -> bool {
        let mut this: Vec<_> = self.iter().collect();
        let mut that: Vec<_> = other.iter().collect();
        this.sort_unstable_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        that.sort_unstable_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        this == that
    }
}

impl Eq for QuerySolution {}

/// Looks a variable up by name or by value.
pub trait VariableLookup {
    fn find(&self, variables: &[Variable]) -> Option<usize>;
}

impl VariableLookup for &str {
    fn find(&self, variables: &[Variable]) -> Option<usize> {
        variables.iter().position(|v| v.as_str() == *self)
    }
}

impl VariableLookup for &Variable {
    fn find(&self, variables: &[Variable]) -> Option<usize> {
        variables.iter().position(|v| v == *self)
    }
}

/// An iterator over [`QuerySolution`]s.
pub struct QuerySolutionIter {
    variables: Arc<[Variable]>,
    iter: Box<dyn Iterator<Item = Result<QuerySolution, QueryEvaluationError>>>,
}

impl QuerySolutionIter {
    pub fn new(
        variables: Arc<[Variable]>,
        iter: impl Iterator<Item = Result<Vec<Option<Term>>, QueryEvaluationError>> + 'static,
    ) -> Self {
        let shared = Arc::clone(&variables);
        Self {
            variables,
            iter: Box::new(
                iter.map(move |values| Ok((Arc::clone(&shared), values?).into())),
            ),
        }
    }

    /// The ordered list of variables solutions may bind.
    #[inline]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }
}

impl Iterator for QuerySolutionIter {
    type Item = Result<QuerySolution, QueryEvaluationError>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

/// An iterator over the triples of a `CONSTRUCT` or `DESCRIBE` result.
pub struct QueryTripleIter {
    pub(crate) iter: Box<dyn Iterator<Item = Result<Triple, QueryEvaluationError>>>,
}

impl Iterator for QueryTripleIter {
    type Item = Result<Triple, QueryEvaluationError>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}
