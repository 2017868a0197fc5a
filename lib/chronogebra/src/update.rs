use crate::algebra::{GraphPattern, GraphTarget, QueryDataset};
use crate::term::{GroundQuad, GroundQuadPattern, QuadPattern};
use oxiri::Iri;
use oxrdf::{GraphName, NamedNode, Quad};
use std::fmt;

/// A parsed [SPARQL update](https://www.w3.org/TR/sparql11-update/).
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct Update {
    /// The update base IRI.
    pub base_iri: Option<Iri<String>>,
    /// The [update operations](https://www.w3.org/TR/sparql11-update/#formalModelGraphUpdate),
    /// executed in order inside a single transaction.
    pub operations: Vec<GraphUpdateOperation>,
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(base_iri) = &self.base_iri {
            writeln!(f, "BASE <{base_iri}>")?;
        }
        for op in &self.operations {
            writeln!(f, "{op} ;")?;
        }
        Ok(())
    }
}

/// A graph name or the default graph, as named by `COPY`/`MOVE`/`ADD`.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum GraphOrDefault {
    NamedNode(NamedNode),
    DefaultGraph,
}

impl fmt::Display for GraphOrDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NamedNode(node) => write!(f, "GRAPH {node}"),
            Self::DefaultGraph => f.write_str("DEFAULT"),
        }
    }
}

impl From<GraphOrDefault> for GraphName {
    fn from(graph: GraphOrDefault) -> Self {
        match graph {
            GraphOrDefault::NamedNode(node) => Self::NamedNode(node),
            GraphOrDefault::DefaultGraph => Self::DefaultGraph,
        }
    }
}

/// The [graph update operations](https://www.w3.org/TR/sparql11-update/#formalModelGraphUpdate).
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum GraphUpdateOperation {
    /// [insert data](https://www.w3.org/TR/sparql11-update/#defn_insertDataOperation).
    InsertData { data: Vec<Quad> },
    /// [delete data](https://www.w3.org/TR/sparql11-update/#defn_deleteDataOperation).
    DeleteData { data: Vec<GroundQuad> },
    /// [delete insert](https://www.w3.org/TR/sparql11-update/#defn_deleteInsertOperation).
    ///
    /// `DELETE WHERE { p }` arrives as a `DeleteInsert` whose delete
    /// templates mirror `p` and whose insert list is empty.
    DeleteInsert {
        delete: Vec<GroundQuadPattern>,
        insert: Vec<QuadPattern>,
        using: Option<QueryDataset>,
        pattern: Box<GraphPattern>,
    },
    /// [load](https://www.w3.org/TR/sparql11-update/#defn_loadOperation).
    Load {
        silent: bool,
        source: NamedNode,
        destination: GraphName,
    },
    /// [clear](https://www.w3.org/TR/sparql11-update/#defn_clearOperation).
    Clear { silent: bool, graph: GraphTarget },
    /// [create](https://www.w3.org/TR/sparql11-update/#defn_createOperation).
    Create { silent: bool, graph: NamedNode },
    /// [drop](https://www.w3.org/TR/sparql11-update/#defn_dropOperation).
    Drop { silent: bool, graph: GraphTarget },
    /// [copy](https://www.w3.org/TR/sparql11-update/#copy).
    Copy {
        silent: bool,
        source: GraphOrDefault,
        destination: GraphOrDefault,
    },
    /// [move](https://www.w3.org/TR/sparql11-update/#move).
    Move {
        silent: bool,
        source: GraphOrDefault,
        destination: GraphOrDefault,
    },
    /// [add](https://www.w3.org/TR/sparql11-update/#add).
    Add {
        silent: bool,
        source: GraphOrDefault,
        destination: GraphOrDefault,
    },
}

impl fmt::Display for GraphUpdateOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsertData { data } => {
                f.write_str("INSERT DATA { ")?;
                for quad in data {
                    write!(f, "{quad} ")?;
                }
                f.write_str("}")
            }
            Self::DeleteData { data } => {
                f.write_str("DELETE DATA { ")?;
                for quad in data {
                    write!(f, "{quad} ")?;
                }
                f.write_str("}")
            }
            Self::DeleteInsert {
                delete,
                insert,
                pattern,
                ..
            } => {
                f.write_str("DELETE { ")?;
                for quad in delete {
                    write!(f, "{quad} ")?;
                }
                f.write_str("} INSERT { ")?;
                for quad in insert {
                    write!(f, "{quad} ")?;
                }
                write!(f, "}} WHERE {{ {pattern} }}")
            }
            Self::Load {
                silent,
                source,
                destination,
            } => {
                f.write_str("LOAD ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                write!(f, "{source}")?;
                if let GraphName::NamedNode(destination) = destination {
                    write!(f, " INTO GRAPH {destination}")?;
                }
                Ok(())
            }
            Self::Clear { silent, graph } => {
                f.write_str("CLEAR ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                write!(f, "{graph}")
            }
            Self::Create { silent, graph } => {
                f.write_str("CREATE ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                write!(f, "GRAPH {graph}")
            }
            Self::Drop { silent, graph } => {
                f.write_str("DROP ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                write!(f, "{graph}")
            }
            Self::Copy {
                silent,
                source,
                destination,
            } => {
                f.write_str("COPY ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                write!(f, "{source} TO {destination}")
            }
            Self::Move {
                silent,
                source,
                destination,
            } => {
                f.write_str("MOVE ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                write!(f, "{source} TO {destination}")
            }
            Self::Add {
                silent,
                source,
                destination,
            } => {
                f.write_str("ADD ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                write!(f, "{source} TO {destination}")
            }
        }
    }
}
