//! End-to-end scenarios: quad writes, SPARQL queries with temporal
//! modifiers, updates and pruning, all against on-disk stores.

#![allow(clippy::panic_in_result_fn)]

use chronogebra::algebra::{
    AggregateExpression, Expression, GraphPattern, PropertyPathExpression, TemporalClause,
};
use chronogebra::term::{
    GraphNamePattern, GroundQuadPattern, NamedNodePattern, QuadPattern, TermPattern, TriplePattern,
};
use chronogebra::{GraphUpdateOperation, Query, Update};
use chronograph::model::{vocab::xsd, GraphName, Literal, NamedNode, Quad, Variable};
use chronograph::prune::{HistoryMode, PruneFilter, PruneOptions};
use chronograph::sparql::{QueryResults, TemporalClause as StoreTemporalClause};
use chronograph::store::Store;
use chronograph::temporal::{parse_timestamp, Interval, TemporalMode};
use std::error::Error;

type TestResult = Result<(), Box<dyn Error>>;

fn ex(name: &str) -> NamedNode {
    NamedNode::new_unchecked(format!("http://example.com/{name}"))
}

fn var(name: &str) -> Variable {
    Variable::new_unchecked(name)
}

fn triple(
    subject: impl Into<TermPattern>,
    predicate: NamedNode,
    object: impl Into<TermPattern>,
) -> TriplePattern {
    TriplePattern::new(subject, predicate, object)
}

fn bgp(patterns: Vec<TriplePattern>) -> GraphPattern {
    GraphPattern::Bgp { patterns }
}

fn select(pattern: GraphPattern, variables: &[&str]) -> Query {
    select_temporal(pattern, variables, None)
}

fn select_temporal(
    pattern: GraphPattern,
    variables: &[&str],
    temporal: Option<TemporalClause>,
) -> Query {
    Query::Select {
        dataset: None,
        pattern: GraphPattern::Project {
            inner: Box::new(pattern),
            variables: variables.iter().map(|v| var(v)).collect(),
        },
        base_iri: None,
        temporal,
    }
}

fn as_of(lexical: &str) -> Option<TemporalClause> {
    Some(TemporalClause::AsOf(Literal::new_typed_literal(
        lexical,
        xsd::DATE_TIME,
    )))
}

/// Runs a SELECT and returns the solutions as sorted rows of term strings
/// (multiset comparison).
fn rows(store: &Store, query: &Query) -> Result<Vec<Vec<Option<String>>>, Box<dyn Error>> {
    let QueryResults::Solutions(solutions) = store.query(query)? else {
        panic!("a SELECT query must produce solutions");
    };
    let mut rows = Vec::new();
    for solution in solutions {
        let solution = solution?;
        rows.push(
            solution
                .values()
                .iter()
                .map(|t| t.as_ref().map(ToString::to_string))
                .collect(),
        );
    }
    rows.sort();
    Ok(rows)
}

fn iri_string(name: &str) -> Option<String> {
    Some(ex(name).to_string())
}

fn literal_string(value: &str) -> Option<String> {
    Some(Literal::new_simple_literal(value).to_string())
}

#[test]
fn basic_select() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    for (s, o) in [("a", "1"), ("a", "2"), ("b", "3")] {
        store.insert_current(
            Quad::new(
                ex(s),
                ex("p"),
                Literal::new_simple_literal(o),
                GraphName::DefaultGraph,
            )
            .as_ref(),
        )?;
    }
    let query = select(
        bgp(vec![triple(var("s"), ex("p"), var("o"))]),
        &["s", "o"],
    );
    assert_eq!(
        rows(&store, &query)?,
        vec![
            vec![iri_string("a"), literal_string("1")],
            vec![iri_string("a"), literal_string("2")],
            vec![iri_string("b"), literal_string("3")],
        ]
    );
    Ok(())
}

#[test]
fn optional_with_unbound() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    for (s, p, o) in [("a", "name", "A"), ("b", "name", "B"), ("a", "mbox", "a@x")] {
        store.insert_current(
            Quad::new(
                ex(s),
                ex(p),
                Literal::new_simple_literal(o),
                GraphName::DefaultGraph,
            )
            .as_ref(),
        )?;
    }
    let query = select(
        GraphPattern::LeftJoin {
            left: Box::new(bgp(vec![triple(var("s"), ex("name"), var("n"))])),
            right: Box::new(bgp(vec![triple(var("s"), ex("mbox"), var("m"))])),
            expression: None,
        },
        &["s", "m"],
    );
    assert_eq!(
        rows(&store, &query)?,
        vec![
            vec![iri_string("a"), literal_string("a@x")],
            vec![iri_string("b"), None],
        ]
    );
    Ok(())
}

#[test]
fn property_path_one_or_more() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    for (s, o) in [("a", "b"), ("b", "c"), ("c", "d")] {
        store.insert_current(
            Quad::new(ex(s), ex("k"), ex(o), GraphName::DefaultGraph).as_ref(),
        )?;
    }
    let query = select(
        GraphPattern::Path {
            subject: ex("a").into(),
            path: PropertyPathExpression::OneOrMore(Box::new(ex("k").into())),
            object: var("y").into(),
        },
        &["y"],
    );
    assert_eq!(
        rows(&store, &query)?,
        vec![
            vec![iri_string("b")],
            vec![iri_string("c")],
            vec![iri_string("d")],
        ]
    );
    Ok(())
}

fn works_for_query(temporal: Option<TemporalClause>) -> Query {
    select_temporal(
        bgp(vec![triple(ex("alice"), ex("worksFor"), var("e"))]),
        &["e"],
        temporal,
    )
}

#[test]
fn temporal_as_of() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    store.insert_at(
        Quad::new(ex("alice"), ex("worksFor"), ex("acme"), GraphName::DefaultGraph).as_ref(),
        Interval {
            start: parse_timestamp("2020-01-01").unwrap(),
            end: parse_timestamp("2023-07-01").unwrap(),
        },
    )?;
    store.insert_at(
        Quad::new(ex("alice"), ex("worksFor"), ex("other"), GraphName::DefaultGraph).as_ref(),
        Interval::since(parse_timestamp("2023-07-01").unwrap()),
    )?;

    assert_eq!(
        rows(&store, &works_for_query(as_of("2022-06-01T00:00:00Z")))?,
        vec![vec![iri_string("acme")]]
    );
    assert_eq!(
        rows(&store, &works_for_query(as_of("2024-01-01T00:00:00Z")))?,
        vec![vec![iri_string("other")]]
    );
    assert_eq!(
        rows(&store, &works_for_query(Some(TemporalClause::AllVersions)))?,
        vec![vec![iri_string("acme")], vec![iri_string("other")]]
    );
    // No clause means the current state.
    assert_eq!(
        rows(&store, &works_for_query(None))?,
        vec![vec![iri_string("other")]]
    );
    Ok(())
}

#[test]
fn delete_insert_with_where() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    store.insert_current(
        Quad::new(
            ex("a"),
            ex("status"),
            Literal::new_simple_literal("draft"),
            GraphName::DefaultGraph,
        )
        .as_ref(),
    )?;

    let update = Update {
        base_iri: None,
        operations: vec![GraphUpdateOperation::DeleteInsert {
            delete: vec![GroundQuadPattern {
                subject: var("s").into(),
                predicate: ex("status").into(),
                object: Literal::new_simple_literal("draft").into(),
                graph_name: GraphNamePattern::DefaultGraph,
            }],
            insert: vec![QuadPattern::new(
                var("s"),
                ex("status"),
                Literal::new_simple_literal("final"),
                GraphNamePattern::DefaultGraph,
            )],
            using: None,
            pattern: Box::new(bgp(vec![triple(
                var("s"),
                ex("status"),
                Literal::new_simple_literal("draft"),
            )])),
        }],
    };
    let affected = store.update(&update)?;
    assert!(affected >= 2, "one close and one insert, got {affected}");

    let current = select(
        bgp(vec![triple(ex("a"), ex("status"), var("o"))]),
        &["o"],
    );
    assert_eq!(rows(&store, &current)?, vec![vec![literal_string("final")]]);

    let all = select_temporal(
        bgp(vec![triple(ex("a"), ex("status"), var("o"))]),
        &["o"],
        Some(TemporalClause::AllVersions),
    );
    assert_eq!(
        rows(&store, &all)?,
        vec![vec![literal_string("draft")], vec![literal_string("final")]]
    );
    Ok(())
}

#[test]
fn pruning_flatten_drops_history() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store_path = dir.path().join("data");
    let store = Store::open(&store_path)?;
    store.insert_at(
        Quad::new(ex("alice"), ex("worksFor"), ex("acme"), GraphName::DefaultGraph).as_ref(),
        Interval {
            start: parse_timestamp("2020-01-01").unwrap(),
            end: parse_timestamp("2023-07-01").unwrap(),
        },
    )?;
    store.insert_at(
        Quad::new(ex("alice"), ex("worksFor"), ex("other"), GraphName::DefaultGraph).as_ref(),
        Interval::since(parse_timestamp("2023-07-01").unwrap()),
    )?;

    let (store, report) = store.prune(&PruneOptions {
        history_mode: HistoryMode::FlattenToCurrent,
        verify: true,
        compute_checksum: true,
        ..PruneOptions::default()
    })?;
    assert_eq!(report.scanned, 2);
    assert_eq!(report.kept, 1);
    assert_eq!(report.filtered_out, 1);
    assert!(report.checksum.is_some());

    assert_eq!(
        rows(&store, &works_for_query(Some(TemporalClause::AllVersions)))?,
        vec![vec![iri_string("other")]]
    );
    assert_eq!(
        rows(&store, &works_for_query(as_of("2022-06-01T00:00:00Z")))?,
        Vec::<Vec<Option<String>>>::new()
    );
    store.validate()?;
    Ok(())
}

#[test]
fn pruning_dry_run_counts_without_writing() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path().join("data"))?;
    let quad = Quad::new(ex("s"), ex("p"), ex("o"), GraphName::DefaultGraph);
    store.insert_current(quad.as_ref())?;
    store.remove(quad.as_ref())?;

    let (store, report) = store.prune(&PruneOptions {
        history_mode: HistoryMode::FlattenToCurrent,
        dry_run: true,
        ..PruneOptions::default()
    })?;
    assert!(report.dry_run);
    assert_eq!(report.scanned, 1);
    assert_eq!(report.kept, 0);
    // Nothing moved: the closed version is still there.
    assert_eq!(store.len(TemporalMode::AllVersions)?, 1);
    Ok(())
}

#[test]
fn pruning_preserve_versions_suppresses_superseded_only() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path().join("data"))?;
    // Quad A: a closed version followed by a replacement.
    let a = Quad::new(ex("a"), ex("p"), ex("o"), GraphName::DefaultGraph);
    store.insert_current(a.as_ref())?;
    store.transaction::<_, chronograph::store::StorageError>(|txn| {
        txn.remove(a.as_ref())?;
        txn.insert_current(a.as_ref())?;
        Ok(())
    })?;
    // Quad B: deleted and never re-added.
    let b = Quad::new(ex("b"), ex("p"), ex("o"), GraphName::DefaultGraph);
    store.insert_current(b.as_ref())?;
    store.remove(b.as_ref())?;

    let (store, report) = store.prune(&PruneOptions {
        history_mode: HistoryMode::PreserveVersions,
        verify: true,
        ..PruneOptions::default()
    })?;
    // A's superseded first version goes away; its current version and B's
    // never-replaced tombstone survive.
    assert_eq!(report.scanned, 3);
    assert_eq!(report.kept, 2);
    assert!(store.contains(a.as_ref(), TemporalMode::Current)?);
    assert!(store.contains(b.as_ref(), TemporalMode::AllVersions)?);
    assert!(!store.contains(b.as_ref(), TemporalMode::Current)?);
    store.validate()?;
    Ok(())
}

#[test]
fn pruning_filter_and_audit() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path().join("data"))?;
    store.insert_current(
        Quad::new(ex("s"), ex("keep"), ex("o"), GraphName::DefaultGraph).as_ref(),
    )?;
    store.insert_current(
        Quad::new(ex("s"), ex("drop"), ex("o"), GraphName::DefaultGraph).as_ref(),
    )?;
    let audit = dir.path().join("audit.log");
    let (store, report) = store.prune(&PruneOptions {
        filter: PruneFilter::new().exclude_predicate(ex("drop")),
        history_mode: HistoryMode::All,
        audit_log_path: Some(audit.clone()),
        ..PruneOptions::default()
    })?;
    assert_eq!(report.kept, 1);
    assert_eq!(report.filtered_out, 1);
    assert_eq!(store.len(TemporalMode::Current)?, 1);
    let audit_content = std::fs::read_to_string(audit)?;
    assert!(audit_content.contains("drop"), "{audit_content}");
    Ok(())
}

#[test]
fn insert_then_delete_is_noop_for_current_queries() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    let quad = Quad::new(
        ex("s"),
        ex("p"),
        Literal::new_simple_literal("v"),
        GraphName::DefaultGraph,
    );
    store.update(&Update {
        base_iri: None,
        operations: vec![GraphUpdateOperation::InsertData {
            data: vec![quad.clone()],
        }],
    })?;
    store.update(&Update {
        base_iri: None,
        operations: vec![GraphUpdateOperation::DeleteData {
            data: vec![chronogebra::term::GroundQuad {
                subject: ex("s"),
                predicate: ex("p"),
                object: Literal::new_simple_literal("v").into(),
                graph_name: GraphName::DefaultGraph,
            }],
        }],
    })?;
    assert_eq!(store.len(TemporalMode::Current)?, 0);
    // Both the insert and the delete remain visible to ALL VERSIONS.
    assert_eq!(store.len(TemporalMode::AllVersions)?, 1);
    assert!(store.contains(quad.as_ref(), TemporalMode::AllVersions)?);
    Ok(())
}

#[test]
fn filters_and_binds() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    for (s, age) in [("a", "12"), ("b", "30")] {
        store.insert_current(
            Quad::new(
                ex(s),
                ex("age"),
                Literal::new_typed_literal(age, xsd::INTEGER),
                GraphName::DefaultGraph,
            )
            .as_ref(),
        )?;
    }
    let query = select(
        GraphPattern::Filter {
            expr: Expression::Greater(
                Box::new(var("age").into()),
                Box::new(Literal::new_typed_literal("18", xsd::INTEGER).into()),
            ),
            inner: Box::new(bgp(vec![triple(var("s"), ex("age"), var("age"))])),
        },
        &["s"],
    );
    assert_eq!(rows(&store, &query)?, vec![vec![iri_string("b")]]);
    Ok(())
}

#[test]
fn union_and_minus() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    for (s, p, o) in [("a", "p", "x"), ("b", "q", "y"), ("a", "flag", "z")] {
        store.insert_current(
            Quad::new(ex(s), ex(p), ex(o), GraphName::DefaultGraph).as_ref(),
        )?;
    }
    let union = select(
        GraphPattern::Union {
            left: Box::new(bgp(vec![triple(var("s"), ex("p"), var("o"))])),
            right: Box::new(bgp(vec![triple(var("s"), ex("q"), var("o"))])),
        },
        &["s"],
    );
    assert_eq!(
        rows(&store, &union)?,
        vec![vec![iri_string("a")], vec![iri_string("b")]]
    );

    let minus = select(
        GraphPattern::Minus {
            left: Box::new(GraphPattern::Union {
                left: Box::new(bgp(vec![triple(var("s"), ex("p"), var("o"))])),
                right: Box::new(bgp(vec![triple(var("s"), ex("q"), var("o"))])),
            }),
            right: Box::new(bgp(vec![triple(var("s"), ex("flag"), var("z"))])),
        },
        &["s"],
    );
    assert_eq!(rows(&store, &minus)?, vec![vec![iri_string("b")]]);
    Ok(())
}

#[test]
fn group_by_count() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    for (s, o) in [("a", "1"), ("a", "2"), ("b", "3")] {
        store.insert_current(
            Quad::new(
                ex(s),
                ex("p"),
                Literal::new_simple_literal(o),
                GraphName::DefaultGraph,
            )
            .as_ref(),
        )?;
    }
    let query = select(
        GraphPattern::Group {
            inner: Box::new(bgp(vec![triple(var("s"), ex("p"), var("o"))])),
            variables: vec![var("s")],
            aggregates: vec![(
                var("c"),
                AggregateExpression::CountSolutions { distinct: false },
            )],
        },
        &["s", "c"],
    );
    let count = |n: &str| Some(Literal::new_typed_literal(n, xsd::INTEGER).to_string());
    assert_eq!(
        rows(&store, &query)?,
        vec![
            vec![iri_string("a"), count("2")],
            vec![iri_string("b"), count("1")],
        ]
    );
    Ok(())
}

#[test]
fn values_injection() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    for s in ["a", "b", "c"] {
        store.insert_current(
            Quad::new(ex(s), ex("p"), ex("o"), GraphName::DefaultGraph).as_ref(),
        )?;
    }
    let query = select(
        GraphPattern::Join {
            left: Box::new(GraphPattern::Values {
                variables: vec![var("s")],
                bindings: vec![vec![Some(ex("a").into())], vec![Some(ex("c").into())]],
            }),
            right: Box::new(bgp(vec![triple(var("s"), ex("p"), var("o"))])),
        },
        &["s"],
    );
    assert_eq!(
        rows(&store, &query)?,
        vec![vec![iri_string("a")], vec![iri_string("c")]]
    );
    Ok(())
}

#[test]
fn named_graph_scoping() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    store.insert_current(
        Quad::new(ex("s"), ex("p"), ex("in-default"), GraphName::DefaultGraph).as_ref(),
    )?;
    store.insert_current(
        Quad::new(ex("s"), ex("p"), ex("in-named"), GraphName::NamedNode(ex("g"))).as_ref(),
    )?;

    // A bare pattern only sees the default graph.
    let default_only = select(bgp(vec![triple(ex("s"), ex("p"), var("o"))]), &["o"]);
    assert_eq!(
        rows(&store, &default_only)?,
        vec![vec![iri_string("in-default")]]
    );

    // GRAPH ?g ranges over the named graphs only.
    let named = select(
        GraphPattern::Graph {
            name: NamedNodePattern::Variable(var("g")),
            inner: Box::new(bgp(vec![triple(ex("s"), ex("p"), var("o"))])),
        },
        &["g", "o"],
    );
    assert_eq!(
        rows(&store, &named)?,
        vec![vec![iri_string("g"), iri_string("in-named")]]
    );

    assert!(store.contains_named_graph(ex("g").as_ref())?);
    assert_eq!(store.named_graphs()?.len(), 1);
    Ok(())
}

#[test]
fn clear_and_copy_operations() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    store.insert_current(
        Quad::new(ex("s"), ex("p"), ex("o1"), GraphName::NamedNode(ex("from"))).as_ref(),
    )?;

    // COPY into a new graph, then CLEAR the source.
    store.update(&Update {
        base_iri: None,
        operations: vec![GraphUpdateOperation::Copy {
            silent: false,
            source: chronogebra::GraphOrDefault::NamedNode(ex("from")),
            destination: chronogebra::GraphOrDefault::NamedNode(ex("to")),
        }],
    })?;
    let in_graph = |g: &str| {
        select(
            GraphPattern::Graph {
                name: NamedNodePattern::NamedNode(ex(g)),
                inner: Box::new(bgp(vec![triple(var("s"), ex("p"), var("o"))])),
            },
            &["o"],
        )
    };
    assert_eq!(rows(&store, &in_graph("to"))?, vec![vec![iri_string("o1")]]);
    assert_eq!(
        rows(&store, &in_graph("from"))?,
        vec![vec![iri_string("o1")]]
    );

    store.update(&Update {
        base_iri: None,
        operations: vec![GraphUpdateOperation::Clear {
            silent: false,
            graph: chronogebra::algebra::GraphTarget::NamedNode(ex("from")),
        }],
    })?;
    assert_eq!(rows(&store, &in_graph("from"))?, Vec::<Vec<Option<String>>>::new());
    assert_eq!(rows(&store, &in_graph("to"))?, vec![vec![iri_string("o1")]]);

    // CREATE of a graph with content fails, SILENT succeeds.
    assert!(store
        .update(&Update {
            base_iri: None,
            operations: vec![GraphUpdateOperation::Create {
                silent: false,
                graph: ex("to"),
            }],
        })
        .is_err());
    store.update(&Update {
        base_iri: None,
        operations: vec![GraphUpdateOperation::Create {
            silent: true,
            graph: ex("to"),
        }],
    })?;
    Ok(())
}

#[test]
fn updates_roll_back_on_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    let update = Update {
        base_iri: None,
        operations: vec![
            GraphUpdateOperation::InsertData {
                data: vec![Quad::new(ex("s"), ex("p"), ex("o"), GraphName::DefaultGraph)],
            },
            // CLEAR of a graph that does not exist fails without SILENT.
            GraphUpdateOperation::Clear {
                silent: false,
                graph: chronogebra::algebra::GraphTarget::NamedNode(ex("missing")),
            },
        ],
    };
    assert!(store.update(&update).is_err());
    assert_eq!(store.len(TemporalMode::Current)?, 0);
    Ok(())
}

#[test]
fn ask_and_construct() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    store.insert_current(
        Quad::new(ex("s"), ex("p"), ex("o"), GraphName::DefaultGraph).as_ref(),
    )?;

    let ask = Query::Ask {
        dataset: None,
        pattern: bgp(vec![triple(var("s"), ex("p"), var("o"))]),
        base_iri: None,
        temporal: None,
    };
    let QueryResults::Boolean(found) = store.query(&ask)? else {
        panic!("ASK must produce a boolean");
    };
    assert!(found);

    let construct = Query::Construct {
        template: vec![triple(var("s"), ex("derived"), var("o"))],
        dataset: None,
        pattern: bgp(vec![triple(var("s"), ex("p"), var("o"))]),
        base_iri: None,
        temporal: None,
    };
    let QueryResults::Graph(triples) = store.query(&construct)? else {
        panic!("CONSTRUCT must produce triples");
    };
    let triples: Vec<_> = triples.collect::<Result<_, _>>()?;
    assert_eq!(triples.len(), 1);
    assert_eq!(triples[0].predicate, ex("derived"));
    Ok(())
}

#[test]
fn store_survives_reopen() -> TestResult {
    let dir = tempfile::tempdir()?;
    let quad = Quad::new(ex("s"), ex("p"), ex("o"), GraphName::DefaultGraph);
    {
        let store = Store::open(dir.path())?;
        store.insert_current(quad.as_ref())?;
    }
    let store = Store::open(dir.path())?;
    assert!(store.contains(quad.as_ref(), TemporalMode::Current)?);
    store.validate()?;
    Ok(())
}

#[test]
fn logical_delete_then_reinsert_keeps_adjacent_versions() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = Store::open(dir.path())?;
    let quad = Quad::new(ex("s"), ex("p"), ex("o"), GraphName::DefaultGraph);
    store.insert_current(quad.as_ref())?;
    // One batch shares one write instant, so the closed interval and its
    // successor meet exactly.
    store.transaction::<_, chronograph::store::StorageError>(|txn| {
        txn.remove(quad.as_ref())?;
        txn.insert_current(quad.as_ref())?;
        Ok(())
    })?;

    let versions: Vec<_> = store
        .quads_for_pattern(None, None, None, None, TemporalMode::AllVersions)
        .collect::<Result<_, _>>()?;
    assert_eq!(versions.len(), 2);
    let mut intervals: Vec<Interval> = versions.iter().map(|v| v.validity).collect();
    intervals.sort_by_key(|i| i.start);
    assert_eq!(intervals[0].end, intervals[1].start);
    assert!(intervals[1].is_current());
    assert!(!intervals[0].is_current());
    Ok(())
}

#[test]
fn temporal_clause_type_alias_is_exported() {
    // `chronograph::sparql` re-exports the algebra's temporal clause.
    let clause: StoreTemporalClause = TemporalClause::AllVersions;
    assert_eq!(clause, TemporalClause::AllVersions);
}
