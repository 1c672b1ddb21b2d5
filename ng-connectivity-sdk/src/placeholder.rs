//! Placeholder templates such as `{{ header:device-id | fn:lower() }}`.
//!
//! A template is literal text with embedded `{{ ... }}` expressions. An expression is a
//! pipeline: a placeholder (`prefix:name`) or a function, followed by `| fn:...` stages.
//!
//! Supported prefixes: `header`, `thing`, `policy`, `entity`, `topic`, `connection`,
//! `source`, `request`, `time`.
//! Supported functions: `default`, `lower`, `upper`, `trim`, `substring-before`,
//! `substring-after`, `filter`, `delete`.

use crate::{
    entity::{EntityId, EntityType},
    error::ConnectivityError,
    headers::AuthorizationContext,
    topic::TopicPath,
};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, map},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, separated_pair, terminated},
    IResult,
};
use std::collections::BTreeMap;

/// Values placeholders are resolved against.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderContext<'a> {
    headers: Option<&'a BTreeMap<String, String>>,
    entity_id: Option<&'a EntityId>,
    topic: Option<&'a TopicPath>,
    connection_id: Option<&'a str>,
    source_address: Option<&'a str>,
    authorization_context: Option<&'a AuthorizationContext>,
}

impl<'a> PlaceholderContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(mut self, headers: &'a BTreeMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_entity_id(mut self, entity_id: &'a EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn with_topic(mut self, topic: &'a TopicPath) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_connection_id(mut self, connection_id: &'a str) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn with_source_address(mut self, address: &'a str) -> Self {
        self.source_address = Some(address);
        self
    }

    pub fn with_authorization_context(mut self, context: &'a AuthorizationContext) -> Self {
        self.authorization_context = Some(context);
        self
    }

    fn header(&self, name: &str) -> Option<String> {
        let headers = self.headers?;
        headers
            .get(name)
            .or_else(|| {
                headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .cloned()
    }
}

/// Result of resolving a template.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(String),
    /// The named expression had no value.
    Unresolved(String),
    /// A `fn:delete()` stage asked for the target to be removed.
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
struct PlaceholderRef {
    prefix: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Literal(String),
    Placeholder(PlaceholderRef),
}

#[derive(Debug, Clone, PartialEq)]
struct FunctionCall {
    name: String,
    args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Placeholder(PlaceholderRef),
    Function(FunctionCall),
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline {
    first: Stage,
    functions: Vec<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq)]
enum PipelineValue {
    Value(String),
    Empty,
    Deleted,
}

fn ident(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_')(i)
}

fn placeholder_name(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || "-_./".contains(c))(i)
}

fn placeholder_ref(i: &str) -> IResult<&str, PlaceholderRef> {
    map(separated_pair(ident, char(':'), placeholder_name), |(prefix, name)| PlaceholderRef {
        prefix: prefix.to_string(),
        name: name.to_string(),
    })(i)
}

fn literal(i: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
            delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        )),
        String::from,
    )(i)
}

fn arg(i: &str) -> IResult<&str, Arg> {
    alt((map(literal, Arg::Literal), map(placeholder_ref, Arg::Placeholder)))(i)
}

fn function_call(i: &str) -> IResult<&str, FunctionCall> {
    map(
        preceded(
            tag("fn:"),
            pair(
                ident,
                delimited(
                    pair(char('('), multispace0),
                    separated_list0(delimited(multispace0, char(','), multispace0), arg),
                    pair(multispace0, char(')')),
                ),
            ),
        ),
        |(name, args)| FunctionCall {
            name: name.to_string(),
            args,
        },
    )(i)
}

fn stage(i: &str) -> IResult<&str, Stage> {
    alt((map(function_call, Stage::Function), map(placeholder_ref, Stage::Placeholder)))(i)
}

fn pipeline(i: &str) -> IResult<&str, Pipeline> {
    map(
        pair(
            delimited(multispace0, stage, multispace0),
            many0(preceded(
                pair(char('|'), multispace0),
                terminated(function_call, multispace0),
            )),
        ),
        |(first, functions)| Pipeline { first, functions },
    )(i)
}

fn parse_pipeline(expression: &str) -> Result<Pipeline, ConnectivityError> {
    all_consuming(pipeline)(expression)
        .map(|(_, p)| p)
        .map_err(|e| ConnectivityError::PlaceholderInvalid {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

enum Segment<'t> {
    Text(&'t str),
    Expression(&'t str),
}

fn split_template(template: &str) -> Result<Vec<Segment<'_>>, ConnectivityError> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| ConnectivityError::PlaceholderInvalid {
            expression: template.to_string(),
            reason: "unclosed '{{'".to_string(),
        })?;
        segments.push(Segment::Expression(&after[..end]));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

pub fn contains_placeholder(template: &str) -> bool {
    template.contains("{{")
}

/// Checks syntax and names without resolving anything.
pub fn validate_template(template: &str) -> Result<(), ConnectivityError> {
    let ctx = PlaceholderContext::new();
    for segment in split_template(template)? {
        if let Segment::Expression(expr) = segment {
            let p = parse_pipeline(expr)?;
            // resolving against an empty context surfaces unknown prefixes and functions
            evaluate(&p, expr, &ctx)?;
        }
    }
    Ok(())
}

pub fn resolve_template(template: &str, ctx: &PlaceholderContext<'_>) -> Result<Resolved, ConnectivityError> {
    let mut out = String::with_capacity(template.len());
    let mut unresolved: Option<String> = None;
    for segment in split_template(template)? {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Expression(expr) => {
                let p = parse_pipeline(expr)?;
                match evaluate(&p, expr, ctx)? {
                    PipelineValue::Value(v) => out.push_str(&v),
                    PipelineValue::Deleted => return Ok(Resolved::Deleted),
                    PipelineValue::Empty => {
                        if unresolved.is_none() {
                            unresolved = Some(expr.trim().to_string());
                        }
                    }
                }
            }
        }
    }
    Ok(match unresolved {
        Some(expr) => Resolved::Unresolved(expr),
        None => Resolved::Value(out),
    })
}

/// Resolves a template that must produce a value.
pub fn resolve_required(template: &str, ctx: &PlaceholderContext<'_>) -> Result<String, ConnectivityError> {
    match resolve_template(template, ctx)? {
        Resolved::Value(v) => Ok(v),
        Resolved::Unresolved(placeholder) => Err(ConnectivityError::UnresolvedPlaceholder { placeholder }),
        Resolved::Deleted => Err(ConnectivityError::UnresolvedPlaceholder {
            placeholder: template.to_string(),
        }),
    }
}

/// A condition holds when it resolves to a value other than `false`.
///
/// The braces are optional: `fn:filter(header:x,'eq','y')` and
/// `{{ fn:filter(header:x,'eq','y') }}` are equivalent.
pub fn evaluate_condition(condition: &str, ctx: &PlaceholderContext<'_>) -> Result<bool, ConnectivityError> {
    let resolved = if contains_placeholder(condition) {
        resolve_template(condition, ctx)?
    } else {
        let p = parse_pipeline(condition)?;
        match evaluate(&p, condition, ctx)? {
            PipelineValue::Value(v) => Resolved::Value(v),
            PipelineValue::Empty => Resolved::Unresolved(condition.to_string()),
            PipelineValue::Deleted => Resolved::Deleted,
        }
    };
    Ok(matches!(resolved, Resolved::Value(ref v) if v.trim() != "false"))
}

fn evaluate(
    pipeline: &Pipeline,
    expression: &str,
    ctx: &PlaceholderContext<'_>,
) -> Result<PipelineValue, ConnectivityError> {
    let mut value = match &pipeline.first {
        Stage::Placeholder(p) => match resolve_placeholder(p, ctx)? {
            Some(v) => PipelineValue::Value(v),
            None => PipelineValue::Empty,
        },
        Stage::Function(f) => apply_function(f, PipelineValue::Empty, true, expression, ctx)?,
    };
    for f in &pipeline.functions {
        value = apply_function(f, value, false, expression, ctx)?;
    }
    Ok(value)
}

fn resolve_arg(arg: &Arg, ctx: &PlaceholderContext<'_>) -> Result<Option<String>, ConnectivityError> {
    match arg {
        Arg::Literal(s) => Ok(Some(s.clone())),
        Arg::Placeholder(p) => resolve_placeholder(p, ctx),
    }
}

fn literal_arg<'f>(f: &'f FunctionCall, index: usize, expression: &str) -> Result<&'f str, ConnectivityError> {
    match f.args.get(index) {
        Some(Arg::Literal(s)) => Ok(s.as_str()),
        _ => Err(ConnectivityError::PlaceholderInvalid {
            expression: expression.to_string(),
            reason: format!("fn:{} expects a string literal at position {}", f.name, index + 1),
        }),
    }
}

fn apply_function(
    f: &FunctionCall,
    input: PipelineValue,
    first: bool,
    expression: &str,
    ctx: &PlaceholderContext<'_>,
) -> Result<PipelineValue, ConnectivityError> {
    let invalid = |reason: String| ConnectivityError::PlaceholderInvalid {
        expression: expression.to_string(),
        reason,
    };
    if input == PipelineValue::Deleted {
        return Ok(PipelineValue::Deleted);
    }
    match f.name.as_str() {
        "default" => {
            let arg = f.args.first().ok_or_else(|| invalid("fn:default expects one argument".into()))?;
            match input {
                PipelineValue::Empty => Ok(resolve_arg(arg, ctx)?.map_or(PipelineValue::Empty, PipelineValue::Value)),
                other => Ok(other),
            }
        }
        "lower" => Ok(map_value(input, |v| PipelineValue::Value(v.to_lowercase()))),
        "upper" => Ok(map_value(input, |v| PipelineValue::Value(v.to_uppercase()))),
        "trim" => Ok(map_value(input, |v| PipelineValue::Value(v.trim().to_string()))),
        "substring-before" | "substring-after" => {
            let needle = literal_arg(f, 0, expression)?.to_string();
            let before = f.name == "substring-before";
            Ok(map_value(input, |v| match v.find(&needle) {
                Some(idx) if before => PipelineValue::Value(v[..idx].to_string()),
                Some(idx) => PipelineValue::Value(v[idx + needle.len()..].to_string()),
                None => PipelineValue::Empty,
            }))
        }
        "delete" => Ok(PipelineValue::Deleted),
        "filter" => {
            // as first stage the subject is the first argument
            let (subject, rest) = if first {
                let arg = f.args.first().ok_or_else(|| invalid("fn:filter expects a subject".into()))?;
                let subject = resolve_arg(arg, ctx)?.map_or(PipelineValue::Empty, PipelineValue::Value);
                (subject, 1)
            } else {
                (input, 0)
            };
            let op = literal_arg(f, rest, expression)?;
            let operand = match f.args.get(rest + 1) {
                Some(arg) => resolve_arg(arg, ctx)?,
                None => None,
            };
            let keep = match (op, &subject) {
                ("exists", s) => {
                    let expected = operand.as_deref() != Some("false");
                    matches!(s, PipelineValue::Value(_)) == expected
                }
                ("eq", PipelineValue::Value(v)) => operand.as_deref() == Some(v.as_str()),
                ("ne", PipelineValue::Value(v)) => operand.as_deref() != Some(v.as_str()),
                ("ne", PipelineValue::Empty) => operand.is_some(),
                ("like", PipelineValue::Value(v)) => operand.as_deref().is_some_and(|pattern| glob_match(pattern, v)),
                ("eq" | "like", _) => false,
                (other, _) => return Err(invalid(format!("unknown filter operator '{other}'"))),
            };
            match (keep, subject) {
                (true, PipelineValue::Value(v)) => Ok(PipelineValue::Value(v)),
                (true, _) => Ok(PipelineValue::Value("true".to_string())),
                (false, _) => Ok(PipelineValue::Empty),
            }
        }
        other => Err(invalid(format!("unknown function 'fn:{other}'"))),
    }
}

fn map_value(input: PipelineValue, op: impl FnOnce(String) -> PipelineValue) -> PipelineValue {
    match input {
        PipelineValue::Value(v) => op(v),
        other => other,
    }
}

fn entity_field(entity_id: Option<&EntityId>, required: Option<EntityType>, name: &str) -> Option<Option<String>> {
    let entity_id = match (entity_id, required) {
        (Some(id), Some(t)) if id.entity_type() != t => None,
        (id, _) => id,
    };
    match name {
        "id" => Some(entity_id.map(ToString::to_string)),
        "namespace" => Some(entity_id.map(|id| id.namespace().to_string())),
        "name" => Some(entity_id.map(|id| id.name().to_string())),
        _ => None,
    }
}

fn topic_field(topic: Option<&TopicPath>, name: &str) -> Option<Option<String>> {
    let value = |f: &dyn Fn(&TopicPath) -> Option<String>| topic.and_then(f);
    let field = match name {
        "full" => value(&|t| Some(t.to_string())),
        "namespace" => value(&|t| Some(t.namespace.clone())),
        "entityName" => value(&|t| Some(t.entity_name.clone())),
        "group" => value(&|t| Some(t.group.to_string())),
        "channel" => value(&|t| (!t.channel.as_str().is_empty()).then(|| t.channel.to_string())),
        "criterion" => value(&|t| Some(t.criterion.to_string())),
        "action" => value(&|t| t.action.map(|a| a.to_string())),
        "subject" => value(&|t| t.subject.clone()),
        "action-subject" => value(&|t| t.action.map(|a| a.to_string()).or_else(|| t.subject.clone())),
        _ => return None,
    };
    Some(field)
}

fn resolve_placeholder(p: &PlaceholderRef, ctx: &PlaceholderContext<'_>) -> Result<Option<String>, ConnectivityError> {
    let unknown = || ConnectivityError::PlaceholderInvalid {
        expression: format!("{}:{}", p.prefix, p.name),
        reason: "unknown placeholder".to_string(),
    };
    let name = p.name.as_str();
    let resolved = match p.prefix.as_str() {
        "header" => Some(ctx.header(name)),
        "thing" => entity_field(ctx.entity_id, Some(EntityType::Thing), name),
        "policy" => entity_field(ctx.entity_id, Some(EntityType::Policy), name),
        "entity" => entity_field(ctx.entity_id, None, name),
        "topic" => topic_field(ctx.topic, name),
        "connection" if name == "id" => Some(ctx.connection_id.map(String::from)),
        "source" if name == "address" => Some(ctx.source_address.map(String::from)),
        "request" if name == "subjectId" => Some(
            ctx.authorization_context
                .and_then(|c| c.first_subject())
                .map(String::from),
        ),
        "time" if name == "now" => Some(Some(chrono::Utc::now().to_rfc3339())),
        "time" if name == "now_epoch_millis" => Some(Some(chrono::Utc::now().timestamp_millis().to_string())),
        _ => None,
    };
    resolved.ok_or_else(unknown)
}

/// `*` matches any sequence, `?` a single character.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let (mut pi, mut vi) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = vi;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            vi = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
