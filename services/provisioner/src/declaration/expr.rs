//! Expression IR and the `${...}` expression parser.
//!
//! Field values are parsed once into [`Expr`]. Graph construction walks this
//! IR; nothing downstream looks at the raw strings again.

use std::collections::BTreeMap;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0},
    combinator::{map, map_res, not, opt, peek, recognize, value},
    error::{convert_error, VerboseError},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    Finish, IResult,
};
use serde_json::{Number, Value};

use super::types::Address;

type ParseResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// A data reference: `kind.name.attribute`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub target: Address,
    pub attribute: String,
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Map(BTreeMap<String, Expr>),
    Template(Vec<TemplatePart>),
    Variable(String),
    Reference(Reference),
    Index { base: Box<Expr>, index: usize },
    Attribute { base: Box<Expr>, name: String },
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `primary ?? fallback`: fallback is used when primary is null or absent.
    Fallback { primary: Box<Expr>, fallback: Box<Expr> },
}

impl Expr {
    /// Build the IR for a JSON field value, parsing every string as a template.
    pub fn from_json(value: &Value) -> Result<Expr, String> {
        match value {
            Value::String(text) => parse_template(text),
            Value::Array(items) => items
                .iter()
                .map(Expr::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Expr::List),
            Value::Object(entries) => entries
                .iter()
                .map(|(k, v)| Expr::from_json(v).map(|e| (k.clone(), e)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Expr::Map),
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    /// Visit every reference in this expression, including both branches of
    /// conditionals and both sides of fallbacks. `path` is extended with list
    /// indexes and map keys so callers can attribute the reference.
    pub fn walk_references<F>(&self, path: &str, visit: &mut F)
    where
        F: FnMut(&Reference, &str),
    {
        match self {
            Expr::Literal(_) | Expr::Variable(_) => {}
            Expr::Reference(reference) => visit(reference, path),
            Expr::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.walk_references(&format!("{path}[{i}]"), visit);
                }
            }
            Expr::Map(entries) => {
                for (key, item) in entries {
                    item.walk_references(&format!("{path}.{key}"), visit);
                }
            }
            Expr::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Expr(expr) = part {
                        expr.walk_references(path, visit);
                    }
                }
            }
            Expr::Index { base, .. } | Expr::Attribute { base, .. } => {
                base.walk_references(path, visit)
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.walk_references(path, visit);
                then.walk_references(path, visit);
                otherwise.walk_references(path, visit);
            }
            Expr::Fallback { primary, fallback } => {
                primary.walk_references(path, visit);
                fallback.walk_references(path, visit);
            }
        }
    }

    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        self.walk_references("", &mut |r: &Reference, _: &str| out.push(r.clone()));
        out
    }

    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<String>) {
        match self {
            Expr::Variable(name) => out.push(name.clone()),
            Expr::Literal(_) | Expr::Reference(_) => {}
            Expr::List(items) => items.iter().for_each(|e| e.collect_variables(out)),
            Expr::Map(entries) => entries.values().for_each(|e| e.collect_variables(out)),
            Expr::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Expr(expr) = part {
                        expr.collect_variables(out);
                    }
                }
            }
            Expr::Index { base, .. } | Expr::Attribute { base, .. } => {
                base.collect_variables(out)
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_variables(out);
                then.collect_variables(out);
                otherwise.collect_variables(out);
            }
            Expr::Fallback { primary, fallback } => {
                primary.collect_variables(out);
                fallback.collect_variables(out);
            }
        }
    }

    /// The value if this expression is a plain literal tree.
    pub fn as_literal(&self) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::List(items) => items
                .iter()
                .map(Expr::as_literal)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Expr::Map(entries) => entries
                .iter()
                .map(|(k, e)| e.as_literal().map(|v| (k.clone(), v)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(Value::Object),
            _ => None,
        }
    }
}

/// Parse a string field. `$${` escapes a literal `${`.
pub fn parse_template(text: &str) -> Result<Expr, String> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("$${") {
            literal.push_str("${");
            rest = after;
            continue;
        }
        if let Some(after) = rest.strip_prefix("${") {
            let (remaining, parsed) = delimited(multispace0, expr, multispace0)(after)
                .finish()
                .map_err(|e| convert_error(after, e))?;
            let Some(remaining) = remaining.strip_prefix('}') else {
                return Err(format!("expected `}}` before `{remaining}`"));
            };
            if !literal.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut literal)));
            }
            parts.push(TemplatePart::Expr(parsed));
            rest = remaining;
            continue;
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            literal.push(c);
        }
        rest = chars.as_str();
    }
    if !literal.is_empty() {
        parts.push(TemplatePart::Text(literal));
    }

    Ok(match parts.len() {
        0 => Expr::Literal(Value::String(String::new())),
        1 => match parts.remove(0) {
            TemplatePart::Text(text) => Expr::Literal(Value::String(text)),
            TemplatePart::Expr(expr) => expr,
        },
        _ => Expr::Template(parts),
    })
}

/// Parse a bare expression (no `${}` wrapper), as used for conditions.
pub fn parse_expression(text: &str) -> Result<Expr, String> {
    let (remaining, parsed) = delimited(multispace0, expr, multispace0)(text)
        .finish()
        .map_err(|e| convert_error(text, e))?;
    if !remaining.is_empty() {
        return Err(format!("unexpected trailing input `{remaining}`"));
    }
    Ok(parsed)
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> ParseResult<'a, O>
where
    F: FnMut(&'a str) -> ParseResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> ParseResult<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> ParseResult<'a, &'a str> {
    terminated(
        tag(word),
        not(peek(alt((alphanumeric1, tag("_"), tag("."))))),
    )
}

fn expr(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = conditional(input)?;
    let (input, rest) = many0(preceded(ws(tag("??")), conditional))(input)?;
    let folded = rest.into_iter().fold(first, |primary, fallback| Expr::Fallback {
        primary: Box::new(primary),
        fallback: Box::new(fallback),
    });
    Ok((input, folded))
}

fn conditional(input: &str) -> ParseResult<'_, Expr> {
    let (input, condition) = postfix(input)?;
    let question = ws(terminated(char('?'), not(char('?'))));
    let (input, branches) = opt(tuple((
        preceded(question, expr),
        preceded(ws(char(':')), expr),
    )))(input)?;
    let parsed = match branches {
        Some((then, otherwise)) => Expr::Conditional {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        },
        None => condition,
    };
    Ok((input, parsed))
}

enum Suffix {
    Index(usize),
    Attribute(String),
}

fn suffix(input: &str) -> ParseResult<'_, Suffix> {
    alt((
        map(
            delimited(
                ws(char('[')),
                map_res(digit1, str::parse::<usize>),
                ws(char(']')),
            ),
            Suffix::Index,
        ),
        map(preceded(char('.'), identifier), |name: &str| {
            Suffix::Attribute(name.to_string())
        }),
    ))(input)
}

fn postfix(input: &str) -> ParseResult<'_, Expr> {
    let (input, base) = primary(input)?;
    let (input, suffixes) = many0(suffix)(input)?;
    let folded = suffixes.into_iter().fold(base, |base, s| match s {
        Suffix::Index(index) => Expr::Index {
            base: Box::new(base),
            index,
        },
        Suffix::Attribute(name) => Expr::Attribute {
            base: Box::new(base),
            name,
        },
    });
    Ok((input, folded))
}

fn primary(input: &str) -> ParseResult<'_, Expr> {
    ws(alt((
        value(Expr::Literal(Value::Null), keyword("null")),
        value(Expr::Literal(Value::Bool(true)), keyword("true")),
        value(Expr::Literal(Value::Bool(false)), keyword("false")),
        number,
        string_literal,
        variable,
        reference,
        delimited(char('('), expr, char(')')),
    )))(input)
}

fn number(input: &str) -> ParseResult<'_, Expr> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        |text: &str| -> Result<Expr, String> {
            let number = if text.contains('.') {
                let f: f64 = text.parse().map_err(|e| format!("{e}"))?;
                Number::from_f64(f).ok_or_else(|| format!("invalid number `{text}`"))?
            } else {
                let i: i64 = text.parse().map_err(|e| format!("{e}"))?;
                Number::from(i)
            };
            Ok(Expr::Literal(Value::Number(number)))
        },
    )(input)
}

fn string_literal(input: &str) -> ParseResult<'_, Expr> {
    map(
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        |s: &str| Expr::Literal(Value::String(s.to_string())),
    )(input)
}

fn variable(input: &str) -> ParseResult<'_, Expr> {
    map(preceded(tag("var."), identifier), |name: &str| {
        Expr::Variable(name.to_string())
    })(input)
}

fn reference(input: &str) -> ParseResult<'_, Expr> {
    map(
        tuple((
            identifier,
            preceded(char('.'), identifier),
            preceded(char('.'), identifier),
        )),
        |(kind, name, attribute): (&str, &str, &str)| {
            Expr::Reference(Reference {
                target: Address::new(kind, name),
                attribute: attribute.to_string(),
            })
        },
    )(input)
}
