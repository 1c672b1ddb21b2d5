//! RQL filter expressions evaluated against JSON entity state.
//!
//! `and(eq(attributes/location,"kitchen"),gt(features/temp/properties/value,20))`

use crate::{error::ConnectivityError, placeholder::glob_match};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, map, map_res},
    error::{Error as NomError, ErrorKind},
    multi::separated_list1,
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};
use serde_json::Value;
use std::{cmp::Ordering, fmt};

#[derive(Debug, Clone, PartialEq)]
enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Compare(Comparison, String, Value),
    In(String, Vec<Value>),
    Exists(String),
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

/// Parsed filter.
#[derive(Debug, Clone, PartialEq)]
pub struct RqlFilter {
    expression: String,
    root: Node,
}

impl fmt::Display for RqlFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn ws<'a, O>(inner: impl FnMut(&'a str) -> IResult<&'a str, O>) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn property(i: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| c != ',' && c != ')' && c != '('), |p: &str| {
        p.trim().trim_start_matches('/').to_string()
    })(i)
}

fn quoted(i: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"')(i)?;
    let mut out = String::new();
    let mut chars = rest.char_indices();
    loop {
        match chars.next() {
            Some((idx, '"')) => {
                rest = &rest[idx + 1..];
                return Ok((rest, out));
            }
            Some((_, '\\')) => match chars.next() {
                Some((_, c)) => out.push(c),
                None => break,
            },
            Some((_, c)) => out.push(c),
            None => break,
        }
    }
    Err(nom::Err::Error(NomError::new(i, ErrorKind::Char)))
}

fn bare_value(i: &str) -> IResult<&str, Value> {
    map_res(take_while1(|c: char| c != ',' && c != ')'), |raw: &str| {
        let raw = raw.trim();
        match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" => Ok(Value::Null),
            _ => raw
                .parse::<serde_json::Number>()
                .map(Value::Number)
                .map_err(|_| "not a number"),
        }
    })(i)
}

fn value(i: &str) -> IResult<&str, Value> {
    ws(alt((map(quoted, Value::String), bare_value)))(i)
}

fn comparison(i: &str) -> IResult<&str, Node> {
    let (i, op) = alt((
        map(tag("eq"), |_| Comparison::Eq),
        map(tag("ne"), |_| Comparison::Ne),
        map(tag("gt"), |_| Comparison::Gt),
        map(tag("ge"), |_| Comparison::Ge),
        map(tag("lt"), |_| Comparison::Lt),
        map(tag("le"), |_| Comparison::Le),
        map(tag("like"), |_| Comparison::Like),
    ))(i)?;
    map(
        delimited(char('('), separated_pair(ws(property), char(','), value), char(')')),
        move |(p, v)| Node::Compare(op.clone(), p, v),
    )(i)
}

fn in_node(i: &str) -> IResult<&str, Node> {
    map(
        preceded(
            tag("in"),
            delimited(
                char('('),
                tuple((ws(property), char(','), separated_list1(char(','), value))),
                char(')'),
            ),
        ),
        |(p, _, values)| Node::In(p, values),
    )(i)
}

fn exists(i: &str) -> IResult<&str, Node> {
    map(preceded(tag("exists"), delimited(char('('), ws(property), char(')'))), Node::Exists)(i)
}

fn logical(i: &str) -> IResult<&str, Node> {
    alt((
        map(
            preceded(tag("and"), delimited(char('('), separated_list1(char(','), ws(node)), char(')'))),
            Node::And,
        ),
        map(
            preceded(tag("or"), delimited(char('('), separated_list1(char(','), ws(node)), char(')'))),
            Node::Or,
        ),
        map(preceded(tag("not"), delimited(char('('), ws(node), char(')'))), |n| {
            Node::Not(Box::new(n))
        }),
    ))(i)
}

fn node(i: &str) -> IResult<&str, Node> {
    alt((logical, exists, in_node, comparison))(i)
}

impl RqlFilter {
    pub fn parse(expression: &str) -> Result<Self, ConnectivityError> {
        let root = all_consuming(ws(node))(expression)
            .map(|(_, n)| n)
            .map_err(|e| ConnectivityError::FilterInvalid {
                filter: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            root,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, entity: &Value) -> bool {
        eval(&self.root, entity)
    }
}

fn lookup<'v>(entity: &'v Value, property: &str) -> Option<&'v Value> {
    if property.is_empty() {
        return Some(entity);
    }
    entity.pointer(&format!("/{property}"))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn eval(node: &Node, entity: &Value) -> bool {
    match node {
        Node::And(nodes) => nodes.iter().all(|n| eval(n, entity)),
        Node::Or(nodes) => nodes.iter().any(|n| eval(n, entity)),
        Node::Not(n) => !eval(n, entity),
        Node::Exists(p) => lookup(entity, p).is_some(),
        Node::In(p, values) => lookup(entity, p)
            .is_some_and(|actual| values.iter().any(|v| compare(actual, v) == Some(Ordering::Equal))),
        Node::Compare(op, p, expected) => {
            let Some(actual) = lookup(entity, p) else {
                return *op == Comparison::Ne;
            };
            match op {
                Comparison::Eq => compare(actual, expected) == Some(Ordering::Equal),
                Comparison::Ne => compare(actual, expected) != Some(Ordering::Equal),
                Comparison::Gt => compare(actual, expected) == Some(Ordering::Greater),
                Comparison::Ge => matches!(compare(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
                Comparison::Lt => compare(actual, expected) == Some(Ordering::Less),
                Comparison::Le => matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal)),
                Comparison::Like => match (actual, expected) {
                    (Value::String(a), Value::String(pattern)) => glob_match(pattern, a),
                    _ => false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thing() -> Value {
        json!({
            "thingId": "org.acme:lamp",
            "attributes": {"location": "kitchen", "floor": 2},
            "features": {"temp": {"properties": {"value": 21.5}}}
        })
    }

    #[test]
    fn comparisons() {
        let t = thing();
        let m = |f: &str| RqlFilter::parse(f).unwrap().matches(&t);
        assert!(m(r#"eq(attributes/location,"kitchen")"#));
        assert!(m("eq(thingId,\"org.acme:lamp\")"));
        assert!(m("gt(features/temp/properties/value,20)"));
        assert!(!m("lt(attributes/floor,2)"));
        assert!(m("le(attributes/floor,2)"));
        assert!(m(r#"like(attributes/location,"kit*")"#));
        assert!(m(r#"in(attributes/floor,1,2,3)"#));
        assert!(m("exists(attributes/floor)"));
        assert!(m("ne(attributes/missing,1)"));
    }

    #[test]
    fn logical_nesting() {
        let t = thing();
        let f = RqlFilter::parse(r#"and(eq(attributes/location,"kitchen"), not(eq(attributes/floor,3)), or(exists(x),gt(attributes/floor,1)))"#)
            .unwrap();
        assert!(f.matches(&t));
        let f = RqlFilter::parse(r#"or(eq(attributes/location,"garage"),exists(attributes/nope))"#).unwrap();
        assert!(!f.matches(&t));
    }

    #[test]
    fn invalid_filters() {
        assert!(RqlFilter::parse("eq(attributes/x)").is_err());
        assert!(RqlFilter::parse("explode(a,1)").is_err());
        assert!(RqlFilter::parse("eq(a,unquoted)").is_err());
        assert!(RqlFilter::parse(r#"eq(a,"open"#).is_err());
    }
}
