use crate::algebra::{GraphPattern, QueryDataset, TemporalClause};
use crate::term::TriplePattern;
use oxiri::Iri;
use std::fmt;

/// A parsed [SPARQL query](https://www.w3.org/TR/sparql11-query/), as the
/// external parser collaborator delivers it: prefixes and base already
/// resolved, solution modifiers folded into the pattern, and the temporal
/// clause attached.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum Query {
    /// [SELECT](https://www.w3.org/TR/sparql11-query/#select).
    Select {
        dataset: Option<QueryDataset>,
        pattern: GraphPattern,
        base_iri: Option<Iri<String>>,
        temporal: Option<TemporalClause>,
    },
    /// [CONSTRUCT](https://www.w3.org/TR/sparql11-query/#construct).
    Construct {
        template: Vec<TriplePattern>,
        dataset: Option<QueryDataset>,
        pattern: GraphPattern,
        base_iri: Option<Iri<String>>,
        temporal: Option<TemporalClause>,
    },
    /// [DESCRIBE](https://www.w3.org/TR/sparql11-query/#describe).
    Describe {
        dataset: Option<QueryDataset>,
        pattern: GraphPattern,
        base_iri: Option<Iri<String>>,
        temporal: Option<TemporalClause>,
    },
    /// [ASK](https://www.w3.org/TR/sparql11-query/#ask).
    Ask {
        dataset: Option<QueryDataset>,
        pattern: GraphPattern,
        base_iri: Option<Iri<String>>,
        temporal: Option<TemporalClause>,
    },
}

impl Query {
    #[inline]
    pub fn dataset(&self) -> Option<&QueryDataset> {
        match self {
            Self::Select { dataset, .. }
            | Self::Construct { dataset, .. }
            | Self::Describe { dataset, .. }
            | Self::Ask { dataset, .. } => dataset.as_ref(),
        }
    }

    #[inline]
    pub fn pattern(&self) -> &GraphPattern {
        match self {
            Self::Select { pattern, .. }
            | Self::Construct { pattern, .. }
            | Self::Describe { pattern, .. }
            | Self::Ask { pattern, .. } => pattern,
        }
    }

    #[inline]
    pub fn base_iri(&self) -> Option<&Iri<String>> {
        match self {
            Self::Select { base_iri, .. }
            | Self::Construct { base_iri, .. }
            | Self::Describe { base_iri, .. }
            | Self::Ask { base_iri, .. } => base_iri.as_ref(),
        }
    }

    /// The temporal clause of the outermost scope, if any.
    #[inline]
    pub fn temporal(&self) -> Option<&TemporalClause> {
        match self {
            Self::Select { temporal, .. }
            | Self::Construct { temporal, .. }
            | Self::Describe { temporal, .. }
            | Self::Ask { temporal, .. } => temporal.as_ref(),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select {
                pattern, temporal, ..
            } => {
                write!(f, "{pattern}")?;
                if let Some(temporal) = temporal {
                    write!(f, " {temporal}")?;
                }
                Ok(())
            }
            Self::Construct {
                template,
                pattern,
                temporal,
                ..
            } => {
                f.write_str("CONSTRUCT { ")?;
                for triple in template {
                    write!(f, "{triple} ")?;
                }
                write!(f, "}} WHERE {{ {pattern} }}")?;
                if let Some(temporal) = temporal {
                    write!(f, " {temporal}")?;
                }
                Ok(())
            }
            Self::Describe {
                pattern, temporal, ..
            } => {
                write!(f, "DESCRIBE WHERE {{ {pattern} }}")?;
                if let Some(temporal) = temporal {
                    write!(f, " {temporal}")?;
                }
                Ok(())
            }
            Self::Ask {
                pattern, temporal, ..
            } => {
                write!(f, "ASK {{ {pattern} }}")?;
                if let Some(temporal) = temporal {
                    write!(f, " {temporal}")?;
                }
                Ok(())
            }
        }
    }
}
