//! Value-level SPARQL operations on resolved terms: effective boolean
//! value, numeric promotion and arithmetic, value equality and ordering.
//!
//! Everything here follows the error-as-`None` convention: `None` is a
//! SPARQL evaluation error, absorbed or propagated by the caller.

use crate::model::{vocab::xsd, Literal, NamedNodeRef, Term};
use crate::temporal;
use oxsdatatypes::{Boolean, Decimal, Double, Float, Integer};
use std::cmp::Ordering;

/// A numeric literal value after parsing.
#[derive(Debug, Clone, Copy)]
pub enum Numeric {
    Integer(Integer),
    Decimal(Decimal),
    Float(Float),
    Double(Double),
}

/// A pair of numerics promoted to their common type.
#[derive(Debug, Clone, Copy)]
pub enum NumericPair {
    Integer(Integer, Integer),
    Decimal(Decimal, Decimal),
    Float(Float, Float),
    Double(Double, Double),
}

pub fn numeric_value(term: &Term) -> Option<Numeric> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.language().is_some() {
        return None;
    }
    let datatype = literal.datatype();
    let value = literal.value();
    if datatype == xsd::DOUBLE {
        Some(Numeric::Double(value.parse().ok()?))
    } else if datatype == xsd::FLOAT {
        Some(Numeric::Float(value.parse().ok()?))
    } else if datatype == xsd::DECIMAL {
        Some(Numeric::Decimal(value.parse().ok()?))
    } else if is_integer_datatype(datatype) {
        Some(Numeric::Integer(value.parse().ok()?))
    } else {
        None
    }
}

fn is_integer_datatype(datatype: NamedNodeRef<'_>) -> bool {
    datatype == xsd::INTEGER
        || datatype == xsd::LONG
        || datatype == xsd::INT
        || datatype == xsd::SHORT
        || datatype == xsd::BYTE
        || datatype == xsd::UNSIGNED_LONG
        || datatype == xsd::UNSIGNED_INT
        || datatype == xsd::UNSIGNED_SHORT
        || datatype == xsd::UNSIGNED_BYTE
        || datatype == xsd::NON_NEGATIVE_INTEGER
        || datatype == xsd::NON_POSITIVE_INTEGER
        || datatype == xsd::POSITIVE_INTEGER
        || datatype == xsd::NEGATIVE_INTEGER
}

/// XPath numeric promotion of two values to a common type.
pub fn promote(a: Numeric, b: Numeric) -> NumericPair {
    use Numeric::{Decimal as De, Double as Do, Float as Fl, Integer as In};
    match (a, b) {
        (In(a), In(b)) => NumericPair::Integer(a, b),
        (In(a), De(b)) => NumericPair::Decimal(a.into(), b),
        (De(a), In(b)) => NumericPair::Decimal(a, b.into()),
        (De(a), De(b)) => NumericPair::Decimal(a, b),
        (In(a), Fl(b)) => NumericPair::Float(a.into(), b),
        (Fl(a), In(b)) => NumericPair::Float(a, b.into()),
        (De(a), Fl(b)) => NumericPair::Float(a.into(), b),
        (Fl(a), De(b)) => NumericPair::Float(a, b.into()),
        (Fl(a), Fl(b)) => NumericPair::Float(a, b),
        (In(a), Do(b)) => NumericPair::Double(a.into(), b),
        (Do(a), In(b)) => NumericPair::Double(a, b.into()),
        (De(a), Do(b)) => NumericPair::Double(a.into(), b),
        (Do(a), De(b)) => NumericPair::Double(a, b.into()),
        (Fl(a), Do(b)) => NumericPair::Double(a.into(), b),
        (Do(a), Fl(b)) => NumericPair::Double(a, b.into()),
        (Do(a), Do(b)) => NumericPair::Double(a, b),
    }
}

pub fn numeric_pair(a: &Term, b: &Term) -> Option<NumericPair> {
    Some(promote(numeric_value(a)?, numeric_value(b)?))
}

pub fn integer_term(value: Integer) -> Term {
    Literal::new_typed_literal(value.to_string(), xsd::INTEGER).into()
}

pub fn decimal_term(value: Decimal) -> Term {
    Literal::new_typed_literal(value.to_string(), xsd::DECIMAL).into()
}

pub fn float_term(value: Float) -> Term {
    Literal::new_typed_literal(value.to_string(), xsd::FLOAT).into()
}

pub fn double_term(value: Double) -> Term {
    Literal::new_typed_literal(value.to_string(), xsd::DOUBLE).into()
}

pub fn boolean_term(value: bool) -> Term {
    Literal::new_typed_literal(if value { "true" } else { "false" }, xsd::BOOLEAN).into()
}

pub fn numeric_term(value: Numeric) -> Term {
    match value {
        Numeric::Integer(v) => integer_term(v),
        Numeric::Decimal(v) => decimal_term(v),
        Numeric::Float(v) => float_term(v),
        Numeric::Double(v) => double_term(v),
    }
}

pub fn add(pair: NumericPair) -> Option<Term> {
    Some(match pair {
        NumericPair::Integer(a, b) => integer_term(a.checked_add(b)?),
        NumericPair::Decimal(a, b) => decimal_term(a.checked_add(b)?),
        NumericPair::Float(a, b) => float_term(a + b),
        NumericPair::Double(a, b) => double_term(a + b),
    })
}

pub fn subtract(pair: NumericPair) -> Option<Term> {
    Some(match pair {
        NumericPair::Integer(a, b) => integer_term(a.checked_sub(b)?),
        NumericPair::Decimal(a, b) => decimal_term(a.checked_sub(b)?),
        NumericPair::Float(a, b) => float_term(a - b),
        NumericPair::Double(a, b) => double_term(a - b),
    })
}

pub fn multiply(pair: NumericPair) -> Option<Term> {
    Some(match pair {
        NumericPair::Integer(a, b) => integer_term(a.checked_mul(b)?),
        NumericPair::Decimal(a, b) => decimal_term(a.checked_mul(b)?),
        NumericPair::Float(a, b) => float_term(a * b),
        NumericPair::Double(a, b) => double_term(a * b),
    })
}

/// `op:numeric-divide`; integer ÷ integer produces a decimal.
pub fn divide(pair: NumericPair) -> Option<Term> {
    Some(match pair {
        NumericPair::Integer(a, b) => {
            decimal_term(Decimal::from(a).checked_div(Decimal::from(b))?)
        }
        NumericPair::Decimal(a, b) => decimal_term(a.checked_div(b)?),
        NumericPair::Float(a, b) => float_term(a / b),
        NumericPair::Double(a, b) => double_term(a / b),
    })
}

/// The [effective boolean value](https://www.w3.org/TR/sparql11-query/#ebv).
pub fn effective_boolean_value(term: &Term) -> Option<bool> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.language().is_some() {
        return Some(!literal.value().is_empty());
    }
    let datatype = literal.datatype();
    if datatype == xsd::BOOLEAN {
        literal.value().parse::<Boolean>().ok().map(bool::from)
    } else if datatype == xsd::STRING {
        Some(!literal.value().is_empty())
    } else if let Some(value) = numeric_value(term) {
        Some(match value {
            Numeric::Integer(v) => v != Integer::from(0_i64),
            Numeric::Decimal(v) => v != Decimal::from(0_i64),
            Numeric::Float(v) => !(v.is_nan() || v == Float::from(0_f32)),
            Numeric::Double(v) => !(v.is_nan() || v == Double::from(0_f64)),
        })
    } else {
        None
    }
}

fn date_time_value(term: &Term) -> Option<i64> {
    let Term::Literal(literal) = term else {
        return None;
    };
    let datatype = literal.datatype();
    if datatype == xsd::DATE_TIME || datatype == xsd::DATE {
        temporal::parse_timestamp(literal.value())
    } else {
        None
    }
}

fn boolean_value(term: &Term) -> Option<bool> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.datatype() == xsd::BOOLEAN {
        literal.value().parse::<Boolean>().ok().map(bool::from)
    } else {
        None
    }
}

fn plain_string_value(term: &Term) -> Option<&str> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.language().is_none() && literal.datatype() == xsd::STRING {
        Some(literal.value())
    } else {
        None
    }
}

/// SPARQL value equality: `None` means the pair is not comparable (an
/// evaluation error, unless the terms are identical).
pub fn value_equals(a: &Term, b: &Term) -> Option<bool> {
    if a == b {
        return Some(true);
    }
    if let Some(pair) = numeric_pair(a, b) {
        return Some(match pair {
            NumericPair::Integer(a, b) => a == b,
            NumericPair::Decimal(a, b) => a == b,
            NumericPair::Float(a, b) => a == b,
            NumericPair::Double(a, b) => a == b,
        });
    }
    if let (Some(a), Some(b)) = (plain_string_value(a), plain_string_value(b)) {
        return Some(a == b);
    }
    if let (Some(a), Some(b)) = (boolean_value(a), boolean_value(b)) {
        return Some(a == b);
    }
    if let (Some(a), Some(b)) = (date_time_value(a), date_time_value(b)) {
        return Some(a == b);
    }
    if let (Term::Literal(la), Term::Literal(lb)) = (a, b) {
        // Language-tagged values are (string, tag) pairs.
        if la.language().is_some() && lb.language().is_some() {
            return Some(la.value() == lb.value() && la.language() == lb.language());
        }
    }
    match (a, b) {
        // Different IRIs / blank nodes are plainly different.
        (Term::NamedNode(_) | Term::BlankNode(_), _)
        | (_, Term::NamedNode(_) | Term::BlankNode(_)) => Some(false),
        // Literals of a datatype the engine has no value space for: the
        // comparison is an evaluation error, not `false`.
        (Term::Literal(_), Term::Literal(_)) => None,
    }
}

/// SPARQL order comparison for `<`, `>`, `<=`, `>=`.
pub fn value_partial_cmp(a: &Term, b: &Term) -> Option<Ordering> {
    if let Some(pair) = numeric_pair(a, b) {
        return match pair {
            NumericPair::Integer(a, b) => a.partial_cmp(&b),
            NumericPair::Decimal(a, b) => a.partial_cmp(&b),
            NumericPair::Float(a, b) => a.partial_cmp(&b),
            NumericPair::Double(a, b) => a.partial_cmp(&b),
        };
    }
    if let (Some(a), Some(b)) = (plain_string_value(a), plain_string_value(b)) {
        return Some(a.cmp(b));
    }
    if let (Some(a), Some(b)) = (boolean_value(a), boolean_value(b)) {
        return Some(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (date_time_value(a), date_time_value(b)) {
        return Some(a.cmp(&b));
    }
    // Language-tagged pairs with the same tag compare by value.
    if let (Term::Literal(la), Term::Literal(lb)) = (a, b) {
        if let (Some(ta), Some(tb)) = (la.language(), lb.language()) {
            if ta == tb {
                return Some(la.value().cmp(lb.value()));
            }
        }
    }
    None
}

/// The total order used by `ORDER BY`: unbound, then blank nodes, then
/// IRIs, then literals (by value where comparable, else by lexical form).
pub fn order_cmp(a: Option<&Term>, b: Option<&Term>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Term::BlankNode(a), Term::BlankNode(b)) => a.as_str().cmp(b.as_str()),
            (Term::BlankNode(_), _) => Ordering::Less,
            (_, Term::BlankNode(_)) => Ordering::Greater,
            (Term::NamedNode(a), Term::NamedNode(b)) => a.as_str().cmp(b.as_str()),
            (Term::NamedNode(_), _) => Ordering::Less,
            (_, Term::NamedNode(_)) => Ordering::Greater,
            (Term::Literal(la), Term::Literal(lb)) => value_partial_cmp(a, b)
                .unwrap_or_else(|| {
                    la.value()
                        .cmp(lb.value())
                        .then_with(|| la.datatype().as_str().cmp(lb.datatype().as_str()))
                        .then_with(|| la.language().cmp(&lb.language()))
                }),
        },
    }
}

/// The lexical form `STR()` exposes.
pub fn string_value(term: &Term) -> String {
    match term {
        Term::NamedNode(node) => node.as_str().to_owned(),
        Term::BlankNode(node) => node.as_str().to_owned(),
        Term::Literal(literal) => literal.value().to_owned(),
    }
}

/// Argument compatibility for the string functions: both plain or
/// `xsd:string`, or the second's language tag matching the first's.
pub fn compatible_string_pair<'a>(
    a: &'a Term,
    b: &'a Term,
) -> Option<(&'a str, &'a str, Option<&'a str>)> {
    let (Term::Literal(la), Term::Literal(lb)) = (a, b) else {
        return None;
    };
    if la.datatype() != xsd::STRING && la.language().is_none() {
        return None;
    }
    if lb.datatype() != xsd::STRING && lb.language().is_none() {
        return None;
    }
    match (la.language(), lb.language()) {
        (_, None) => Some((la.value(), lb.value(), la.language())),
        (Some(ta), Some(tb)) if ta == tb => Some((la.value(), lb.value(), Some(ta))),
        _ => None,
    }
}

/// A string-valued argument: a plain, `xsd:string` or language-tagged
/// literal, with its language.
pub fn string_literal(term: &Term) -> Option<(&str, Option<&str>)> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.language().is_some() || literal.datatype() == xsd::STRING {
        Some((literal.value(), literal.language()))
    } else {
        None
    }
}

pub fn plain_literal(value: impl Into<String>, language: Option<&str>) -> Term {
    match language {
        Some(language) => {
            Literal::new_language_tagged_literal_unchecked(value.into(), language).into()
        }
        None => Literal::new_simple_literal(value.into()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NamedNode;

    fn int(n: i64) -> Term {
        integer_term(Integer::from(n))
    }

    fn dec(s: &str) -> Term {
        Literal::new_typed_literal(s, xsd::DECIMAL).into()
    }

    #[test]
    fn numeric_promotion_equality() {
        assert_eq!(value_equals(&int(1), &dec("1.0")), Some(true));
        assert_eq!(value_equals(&int(1), &dec("1.5")), Some(false));
    }

    #[test]
    fn integer_division_yields_decimal() {
        let result = divide(numeric_pair(&int(1), &int(2)).unwrap()).unwrap();
        assert_eq!(result, dec("0.5"));
        assert_eq!(divide(numeric_pair(&int(1), &int(0)).unwrap()), None);
    }

    #[test]
    fn ebv_rules() {
        assert_eq!(effective_boolean_value(&int(0)), Some(false));
        assert_eq!(effective_boolean_value(&int(3)), Some(true));
        assert_eq!(
            effective_boolean_value(&Literal::new_simple_literal("").into()),
            Some(false)
        );
        assert_eq!(
            effective_boolean_value(&Literal::new_simple_literal("x").into()),
            Some(true)
        );
        assert_eq!(
            effective_boolean_value(&NamedNode::new_unchecked("http://e.com").into()),
            None
        );
    }

    #[test]
    fn incomparable_terms_error() {
        let iri: Term = NamedNode::new_unchecked("http://e.com").into();
        assert_eq!(value_partial_cmp(&iri, &int(1)), None);
        assert_eq!(value_equals(&iri, &int(1)), Some(false));
    }

    #[test]
    fn date_time_comparison() {
        let a: Term = Literal::new_typed_literal("2020-01-01T00:00:00Z", xsd::DATE_TIME).into();
        let b: Term = Literal::new_typed_literal("2021-01-01T00:00:00Z", xsd::DATE_TIME).into();
        assert_eq!(value_partial_cmp(&a, &b), Some(Ordering::Less));
    }

    #[test]
    fn order_by_groups_kinds() {
        let blank: Term = crate::model::BlankNode::new_unchecked("b").into();
        let iri: Term = NamedNode::new_unchecked("http://e.com").into();
        assert_eq!(order_cmp(None, Some(&blank)), Ordering::Less);
        assert_eq!(order_cmp(Some(&blank), Some(&iri)), Ordering::Less);
        assert_eq!(order_cmp(Some(&iri), Some(&int(1))), Ordering::Less);
    }
}
