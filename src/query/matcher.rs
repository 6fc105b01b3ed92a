//! Value-level predicate matching.
//!
//! [`value_matches`] decides whether one stored value satisfies a
//! positive operator. Negated operators never reach this level: the
//! evaluator rewrites `NOT_X` as "records holding the key, minus records
//! matching `X`".
//!
//! Compiled regexes (including LIKE translations) are cached per
//! evaluation through [`RegexCache`].

use std::collections::HashMap;

use regex::Regex;

use crate::query::tokenize::tokenize;
use crate::query::{Operator, QueryError};
use crate::value::{Text, Value};

/// Per-evaluation cache of compiled regexes, keyed by pattern source.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: HashMap<String, Regex>,
}

impl RegexCache {
    /// A fresh cache.
    pub fn new() -> RegexCache {
        RegexCache::default()
    }

    /// Compile (or fetch) a regex, anchoring is the caller's business.
    pub fn get(&mut self, pattern: &str) -> Result<&Regex, QueryError> {
        if !self.compiled.contains_key(pattern) {
            let regex = Regex::new(pattern)
                .map_err(|e| QueryError::InvalidCriteria(format!("bad regex {pattern:?}: {e}")))?;
            self.compiled.insert(pattern.to_string(), regex);
        }
        // just inserted above on miss
        self.compiled
            .get(pattern)
            .ok_or_else(|| QueryError::InvalidCriteria("regex cache lookup failed".into()))
    }
}

/// Translate a SQL LIKE pattern (`%` any run, `_` any char) into an
/// anchored regex pattern.
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// The ordered, per-term substring rule behind `CONTAINS` and `search`.
///
/// Every query token must match a stored token at consecutive positions,
/// where "match" is substring containment.
pub fn infix_match(stored: &[Text], query: &[Text]) -> bool {
    if query.is_empty() || stored.len() < query.len() {
        return false;
    }
    (0..=stored.len() - query.len()).any(|start| {
        query
            .iter()
            .enumerate()
            .all(|(i, term)| stored[start + i].as_str().contains(term.as_str()))
    })
}

fn operand<'a>(operands: &'a [Value], index: usize, op: &Operator) -> Result<&'a Value, QueryError> {
    operands.get(index).ok_or_else(|| {
        QueryError::InvalidCriteria(format!("operator {op} is missing operand {index}"))
    })
}

/// Does `stored` satisfy the positive operator with the given operands?
pub fn value_matches(
    op: &Operator,
    stored: &Value,
    operands: &[Value],
    cache: &mut RegexCache,
) -> Result<bool, QueryError> {
    match op {
        Operator::Equals | Operator::LinksTo => Ok(stored.class_eq(operand(operands, 0, op)?)),
        Operator::GreaterThan => ordered(stored, operand(operands, 0, op)?, |o| o.is_gt()),
        Operator::GreaterThanOrEquals => ordered(stored, operand(operands, 0, op)?, |o| o.is_ge()),
        Operator::LessThan => ordered(stored, operand(operands, 0, op)?, |o| o.is_lt()),
        Operator::LessThanOrEquals => ordered(stored, operand(operands, 0, op)?, |o| o.is_le()),
        Operator::Between => {
            // left-inclusive, right-exclusive
            let low = operand(operands, 0, op)?;
            let high = operand(operands, 1, op)?;
            Ok(ordered(stored, low, |o| o.is_ge())? && ordered(stored, high, |o| o.is_lt())?)
        }
        Operator::Regex => {
            let Some(text) = stored.as_text() else {
                return Ok(false);
            };
            let pattern = textual_operand(operand(operands, 0, op)?, op)?;
            Ok(cache.get(&pattern)?.is_match(text.as_str()))
        }
        Operator::Like => {
            let Some(text) = stored.as_text() else {
                return Ok(false);
            };
            let pattern = like_to_regex(&textual_operand(operand(operands, 0, op)?, op)?);
            Ok(cache.get(&pattern)?.is_match(text.as_str()))
        }
        Operator::Contains => {
            let Some(text) = stored.as_text() else {
                return Ok(false);
            };
            let query = textual_operand(operand(operands, 0, op)?, op)?;
            Ok(infix_match(&tokenize(text.as_str()), &tokenize(&query)))
        }
        Operator::NotEquals
        | Operator::NotRegex
        | Operator::NotLike
        | Operator::NotContains => Err(QueryError::InvalidCriteria(format!(
            "negated operator {op} must be rewritten before value matching"
        ))),
    }
}

fn ordered(
    stored: &Value,
    operand: &Value,
    accept: fn(std::cmp::Ordering) -> bool,
) -> Result<bool, QueryError> {
    // ordering only relates values of the same kind: a string is neither
    // greater nor less than a number
    if !stored.same_kind(operand) {
        return Ok(false);
    }
    Ok(accept(stored.class_cmp(operand)))
}

fn textual_operand(value: &Value, op: &Operator) -> Result<String, QueryError> {
    match value.as_text() {
        Some(text) => Ok(text.as_str().to_string()),
        None => Err(QueryError::InvalidCriteria(format!(
            "operator {op} requires a string operand, got {value}"
        ))),
    }
}
