//! Filter expressions evaluated by the in-memory backend.
//!
//! Accepts the subset of OData used by typical facet UIs: comparisons
//! (`eq ne gt ge lt le`) against string, number, boolean and `null` literals,
//! `and`, `or`, `not` and parentheses. `and` binds tighter than `or`.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde_json::Value;
use std::cmp::Ordering;

use super::Document;
use crate::error::{ Result, SearchError };

#[derive(Parser)]
#[grammar = "db/filter.pest"]
struct FilterGrammar;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Filter {
    Compare(String, CompareOp, Value),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

fn malformed(input: &str) -> SearchError {
    SearchError::Query(format!("malformed filter '{}'", input))
}

impl Filter {
    pub(crate) fn parse(input: &str) -> Result<Self> {
        let root = FilterGrammar::parse(Rule::filter, input)
            .map_err(|e| SearchError::Query(format!("invalid filter '{}': {}", input, e)))?
            .next()
            .ok_or_else(|| malformed(input))?;

        let expr = root
            .into_inner()
            .find(|p| p.as_rule() == Rule::or_expr)
            .ok_or_else(|| malformed(input))?;
        Self::from_pair(expr, input)
    }

    fn from_pair(pair: Pair<'_, Rule>, input: &str) -> Result<Self> {
        match pair.as_rule() {
            Rule::or_expr => Self::fold(pair, Rule::and_expr, input, Filter::Or),
            Rule::and_expr => Self::fold(pair, Rule::unary, input, Filter::And),
            Rule::unary | Rule::group => {
                let inner = pair.into_inner().next().ok_or_else(|| malformed(input))?;
                Self::from_pair(inner, input)
            }
            Rule::not_expr => {
                let operand = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::unary)
                    .ok_or_else(|| malformed(input))?;
                Ok(Filter::Not(Box::new(Self::from_pair(operand, input)?)))
            }
            Rule::comparison => Self::comparison(pair, input),
            _ => Err(malformed(input)),
        }
    }

    /// Left-folds the `operand` children of a binary chain.
    fn fold(
        pair: Pair<'_, Rule>,
        operand: Rule,
        input: &str,
        join: fn(Box<Filter>, Box<Filter>) -> Filter
    ) -> Result<Self> {
        let mut operands = pair.into_inner().filter(|p| p.as_rule() == operand);
        let first = operands.next().ok_or_else(|| malformed(input))?;
        let mut left = Self::from_pair(first, input)?;
        for next in operands {
            left = join(Box::new(left), Box::new(Self::from_pair(next, input)?));
        }
        Ok(left)
    }

    fn comparison(pair: Pair<'_, Rule>, input: &str) -> Result<Self> {
        let mut parts = pair.into_inner();
        let (Some(field), Some(op), Some(literal)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(malformed(input));
        };

        let op = match op.as_str().to_lowercase().as_str() {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "ge" => CompareOp::Ge,
            "lt" => CompareOp::Lt,
            "le" => CompareOp::Le,
            other => {
                return Err(SearchError::Query(format!("unsupported operator '{}'", other)));
            }
        };

        let literal = match literal.as_rule() {
            Rule::string => {
                let raw = literal.into_inner().next().map_or("", |p| p.as_str());
                // '' is an escaped quote
                Value::from(raw.replace("''", "'"))
            }
            Rule::number => {
                let raw = literal.as_str();
                let num = raw
                    .parse::<f64>()
                    .map_err(|_| SearchError::Query(format!("invalid number '{}' in filter", raw)))?;
                Value::from(num)
            }
            Rule::bool_literal => Value::Bool(literal.as_str() == "true"),
            Rule::null_literal => Value::Null,
            _ => {
                return Err(malformed(input));
            }
        };

        Ok(Filter::Compare(field.as_str().to_string(), op, literal))
    }

    pub(crate) fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::And(a, b) => a.matches(doc) && b.matches(doc),
            Filter::Or(a, b) => a.matches(doc) || b.matches(doc),
            Filter::Not(inner) => !inner.matches(doc),
            Filter::Compare(field, op, literal) => {
                let value = doc.get(field).unwrap_or(&Value::Null);
                match compare(value, literal) {
                    Some(ordering) =>
                        match op {
                            CompareOp::Eq => ordering == Ordering::Equal,
                            CompareOp::Ne => ordering != Ordering::Equal,
                            CompareOp::Gt => ordering == Ordering::Greater,
                            CompareOp::Ge => ordering != Ordering::Less,
                            CompareOp::Lt => ordering == Ordering::Less,
                            CompareOp::Le => ordering != Ordering::Greater,
                        }
                    // incomparable values only satisfy `ne`
                    None => *op == CompareOp::Ne,
                }
            }
        }
    }
}

fn compare(value: &Value, literal: &Value) -> Option<Ordering> {
    match (value, literal) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
