//! Declarative query evaluation.
//!
//! The engine accepts an already-parsed [`Criteria`] tree (leaves are
//! `key / operator / operands`, internals are AND / OR / NOT) and returns
//! the set of record ids satisfying it against a snapshot.
//!
//! ## Reader
//!
//! Evaluation runs against the [`Reader`] trait: a snapshot-scoped view
//! of the store. The database implements it for plain reads at a version;
//! atomic operations implement it with their own queued writes overlaid
//! and observations recorded into the read set. The evaluator itself is
//! snapshot-agnostic — determinism follows from the reader's snapshot.
//!
//! ## Navigation keys
//!
//! A key containing `.` is a path: `a.b.c` starts at a record, follows
//! link values of `a`, then `b`, and applies the predicate to the values
//! of `c` at the leaves. Three strategies produce identical results:
//!
//! - **forward** — BFS from every record holding the first key;
//! - **reverse** — evaluate the leaf predicate through the index, then
//!   walk link inverses back to the origins;
//! - **ad-hoc** — materialize the full `leaf value → origins` mapping
//!   and filter it (the fallback and the correctness oracle).
//!
//! [`find`] picks a strategy from cheap cardinality estimates;
//! [`find_with_strategy`] pins one (the navigation-equivalence tests rely
//! on this).
//!
//! ## Search
//!
//! [`search`] implements the infix match rule: stored text and query are
//! tokenized identically, and a record matches when every query token, in
//! order, is a substring of the stored token at consecutive positions.

pub mod matcher;
pub mod tokenize;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use thiserror::Error;

use crate::value::{Id, Position, Text, Value};

use matcher::{RegexCache, value_matches};
use tokenize::tokenize as tokenize_text;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by query parsing and evaluation.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Malformed criteria: unknown operator, missing operand, bad regex,
    /// unparsable textual form.
    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),

    /// Failure in the underlying store while reading.
    #[error("store error: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl QueryError {
    /// Wrap a store-level failure.
    pub fn store<E: std::error::Error + Send + Sync + 'static>(error: E) -> QueryError {
        QueryError::Store(Box::new(error))
    }
}

// ------------------------------------------------------------------------------------------------
// Operators
// ------------------------------------------------------------------------------------------------

/// Leaf predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    /// Left-inclusive, right-exclusive.
    Between,
    Regex,
    NotRegex,
    Like,
    NotLike,
    /// Full-text infix match (see [`search`]).
    Contains,
    NotContains,
    LinksTo,
}

impl Operator {
    /// Number of operand values the operator consumes.
    pub fn arity(&self) -> usize {
        match self {
            Operator::Between => 2,
            _ => 1,
        }
    }

    /// `(positive form, negated?)`: `NOT_X` evaluates as "records holding
    /// the key, minus records matching `X`".
    pub fn positive_form(&self) -> (Operator, bool) {
        match self {
            Operator::NotEquals => (Operator::Equals, true),
            Operator::NotRegex => (Operator::Regex, true),
            Operator::NotLike => (Operator::Like, true),
            Operator::NotContains => (Operator::Contains, true),
            other => (*other, false),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Operator::Equals => "EQUALS",
            Operator::NotEquals => "NOT_EQUALS",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::GreaterThanOrEquals => "GREATER_THAN_OR_EQUALS",
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEquals => "LESS_THAN_OR_EQUALS",
            Operator::Between => "BETWEEN",
            Operator::Regex => "REGEX",
            Operator::NotRegex => "NOT_REGEX",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT_LIKE",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOT_CONTAINS",
            Operator::LinksTo => "LINKS_TO",
        }
    }

    fn parse(word: &str) -> Option<Operator> {
        Some(match word {
            "EQUALS" => Operator::Equals,
            "NOT_EQUALS" => Operator::NotEquals,
            "GREATER_THAN" => Operator::GreaterThan,
            "GREATER_THAN_OR_EQUALS" => Operator::GreaterThanOrEquals,
            "LESS_THAN" => Operator::LessThan,
            "LESS_THAN_OR_EQUALS" => Operator::LessThanOrEquals,
            "BETWEEN" => Operator::Between,
            "REGEX" => Operator::Regex,
            "NOT_REGEX" => Operator::NotRegex,
            "LIKE" => Operator::Like,
            "NOT_LIKE" => Operator::NotLike,
            "CONTAINS" => Operator::Contains,
            "NOT_CONTAINS" => Operator::NotContains,
            "LINKS_TO" => Operator::LinksTo,
            _ => return None,
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ------------------------------------------------------------------------------------------------
// Criteria
// ------------------------------------------------------------------------------------------------

/// A parsed query: leaf predicates combined with AND / OR / NOT.
///
/// `Display` and [`Criteria::parse`] round-trip:
/// `parse(format(c)) == c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criteria {
    /// `key OPERATOR operand…`
    Leaf {
        /// Field name, possibly a dotted navigation path.
        key: Text,
        /// The predicate operator.
        operator: Operator,
        /// Operand values (`arity` of them).
        values: Vec<Value>,
    },
    /// Both sides must hold.
    And(Box<Criteria>, Box<Criteria>),
    /// Either side must hold.
    Or(Box<Criteria>, Box<Criteria>),
    /// The inner criteria must not hold.
    Not(Box<Criteria>),
}

impl Criteria {
    /// A leaf predicate.
    pub fn leaf(key: impl Into<Text>, operator: Operator, values: Vec<Value>) -> Criteria {
        Criteria::Leaf {
            key: key.into(),
            operator,
            values,
        }
    }

    /// `self AND other`.
    pub fn and(self, other: Criteria) -> Criteria {
        Criteria::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`.
    pub fn or(self, other: Criteria) -> Criteria {
        Criteria::Or(Box::new(self), Box::new(other))
    }

    /// `NOT self`.
    pub fn negate(self) -> Criteria {
        Criteria::Not(Box::new(self))
    }

    /// Parse the canonical textual form produced by `Display`.
    pub fn parse(input: &str) -> Result<Criteria, QueryError> {
        let tokens = lex(input)?;
        let mut cursor = 0;
        let criteria = parse_criteria(&tokens, &mut cursor)?;
        if cursor != tokens.len() {
            return Err(QueryError::InvalidCriteria(format!(
                "trailing input after criteria: {input:?}"
            )));
        }
        Ok(criteria)
    }
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criteria::Leaf {
                key,
                operator,
                values,
            } => {
                write!(f, "{key} {operator}")?;
                for value in values {
                    write!(f, " {value}")?;
                }
                Ok(())
            }
            Criteria::And(a, b) => write!(f, "({a} AND {b})"),
            Criteria::Or(a, b) => write!(f, "({a} OR {b})"),
            Criteria::Not(inner) => write!(f, "(NOT {inner})"),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Criteria lexer / parser
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Open,
    Close,
    Word(String),
    Quoted(String),
    Backquoted(String),
    Timestamp(u64),
}

fn lex(input: &str) -> Result<Vec<Tok>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Tok::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Tok::Close);
            }
            '"' | '`' | '|' => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == c {
                        closed = true;
                        break;
                    }
                    body.push(inner);
                }
                if !closed {
                    return Err(QueryError::InvalidCriteria(format!(
                        "unterminated {c} delimiter in {input:?}"
                    )));
                }
                tokens.push(match c {
                    '"' => Tok::Quoted(body),
                    '`' => Tok::Backquoted(body),
                    _ => Tok::Timestamp(body.parse::<u64>().map_err(|_| {
                        QueryError::InvalidCriteria(format!("bad timestamp literal |{body}|"))
                    })?),
                });
            }
            _ => {
                let mut word = String::new();
                while let Some(&inner) = chars.peek() {
                    if inner.is_whitespace() || inner == '(' || inner == ')' {
                        break;
                    }
                    word.push(inner);
                    chars.next();
                }
                tokens.push(Tok::Word(word));
            }
        }
    }
    Ok(tokens)
}

fn parse_criteria(tokens: &[Tok], cursor: &mut usize) -> Result<Criteria, QueryError> {
    match tokens.get(*cursor) {
        Some(Tok::Open) => {
            *cursor += 1;
            if tokens.get(*cursor) == Some(&Tok::Word("NOT".into())) {
                *cursor += 1;
                let inner = parse_criteria(tokens, cursor)?;
                expect_close(tokens, cursor)?;
                return Ok(inner.negate());
            }
            let left = parse_criteria(tokens, cursor)?;
            let combinator = match tokens.get(*cursor) {
                Some(Tok::Word(w)) if w == "AND" || w == "OR" => w.clone(),
                other => {
                    return Err(QueryError::InvalidCriteria(format!(
                        "expected AND/OR, found {other:?}"
                    )));
                }
            };
            *cursor += 1;
            let right = parse_criteria(tokens, cursor)?;
            expect_close(tokens, cursor)?;
            Ok(if combinator == "AND" {
                left.and(right)
            } else {
                left.or(right)
            })
        }
        Some(Tok::Word(key)) => {
            let key = Text::new(key);
            *cursor += 1;
            let operator = match tokens.get(*cursor) {
                Some(Tok::Word(w)) => Operator::parse(w).ok_or_else(|| {
                    QueryError::InvalidCriteria(format!("unknown operator {w:?}"))
                })?,
                other => {
                    return Err(QueryError::InvalidCriteria(format!(
                        "expected operator, found {other:?}"
                    )));
                }
            };
            *cursor += 1;
            let mut values = Vec::with_capacity(operator.arity());
            for _ in 0..operator.arity() {
                values.push(parse_value(tokens, cursor)?);
            }
            Ok(Criteria::Leaf {
                key,
                operator,
                values,
            })
        }
        other => Err(QueryError::InvalidCriteria(format!(
            "expected criteria, found {other:?}"
        ))),
    }
}

fn expect_close(tokens: &[Tok], cursor: &mut usize) -> Result<(), QueryError> {
    if tokens.get(*cursor) != Some(&Tok::Close) {
        return Err(QueryError::InvalidCriteria("expected ')'".into()));
    }
    *cursor += 1;
    Ok(())
}

fn parse_value(tokens: &[Tok], cursor: &mut usize) -> Result<Value, QueryError> {
    let value = match tokens.get(*cursor) {
        Some(Tok::Quoted(s)) => Value::String(Text::new(s)),
        Some(Tok::Backquoted(s)) => Value::Tag(Text::new(s)),
        Some(Tok::Timestamp(ts)) => Value::Timestamp(*ts),
        Some(Tok::Word(word)) => parse_scalar(word)?,
        other => {
            return Err(QueryError::InvalidCriteria(format!(
                "expected value, found {other:?}"
            )));
        }
    };
    *cursor += 1;
    Ok(value)
}

fn parse_scalar(word: &str) -> Result<Value, QueryError> {
    match word {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Some(id) = word.strip_prefix('@') {
        let raw = id.parse::<u64>().map_err(|_| {
            QueryError::InvalidCriteria(format!("bad link literal @{id}"))
        })?;
        return Ok(Value::Link(Id(raw)));
    }
    if let Some(body) = word.strip_suffix('L') {
        if let Ok(v) = body.parse::<i64>() {
            return Ok(Value::Int64(v));
        }
    }
    if let Some(body) = word.strip_suffix('F') {
        if let Ok(v) = body.parse::<f32>() {
            return Ok(Value::Float32(v));
        }
    }
    if let Some(body) = word.strip_suffix('D') {
        if let Ok(v) = body.parse::<f64>() {
            return Ok(Value::Float64(v));
        }
    }
    if let Ok(v) = word.parse::<i32>() {
        return Ok(Value::Int32(v));
    }
    if let Ok(v) = word.parse::<i64>() {
        return Ok(Value::Int64(v));
    }
    if let Ok(v) = word.parse::<f64>() {
        return Ok(Value::Float64(v));
    }
    Err(QueryError::InvalidCriteria(format!(
        "unparsable value literal {word:?}"
    )))
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// A snapshot-scoped view of the store, the surface the evaluator runs
/// against.
///
/// Implementations must be deterministic functions of their snapshot.
pub trait Reader {
    /// Values of `key` in `record`.
    fn select(&self, record: Id, key: &Text) -> Result<BTreeSet<Value>, QueryError>;

    /// Records holding a value class-equal to `value` under `key`.
    fn index_lookup(&self, key: &Text, value: &Value) -> Result<BTreeSet<Id>, QueryError>;

    /// Full inverted mapping of `key`: value → records.
    fn index_browse(&self, key: &Text) -> Result<BTreeMap<Value, BTreeSet<Id>>, QueryError>;

    /// Corpus of `key`: term → occurrence positions.
    fn corpus_positions(&self, key: &Text) -> Result<BTreeMap<Text, BTreeSet<Position>>, QueryError>;

    /// Every record id known to the snapshot.
    fn inventory(&self) -> Result<BTreeSet<Id>, QueryError>;
}

// ------------------------------------------------------------------------------------------------
// Navigation strategy
// ------------------------------------------------------------------------------------------------

/// Traversal strategy for navigation-key predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavStrategy {
    /// Choose from cardinality estimates.
    Auto,
    /// BFS from source records.
    Forward,
    /// Leaf index first, then link inverses back.
    Reverse,
    /// Materialize the full leaf mapping, then filter.
    AdHoc,
}

// ------------------------------------------------------------------------------------------------
// Evaluation
// ------------------------------------------------------------------------------------------------

/// Evaluate `criteria` against `reader`.
pub fn find<R: Reader>(reader: &R, criteria: &Criteria) -> Result<BTreeSet<Id>, QueryError> {
    find_with_strategy(reader, criteria, NavStrategy::Auto)
}

/// [`find`] with a pinned navigation strategy.
pub fn find_with_strategy<R: Reader>(
    reader: &R,
    criteria: &Criteria,
    strategy: NavStrategy,
) -> Result<BTreeSet<Id>, QueryError> {
    let mut cache = RegexCache::new();
    eval(reader, criteria, strategy, &mut cache)
}

fn eval<R: Reader>(
    reader: &R,
    criteria: &Criteria,
    strategy: NavStrategy,
    cache: &mut RegexCache,
) -> Result<BTreeSet<Id>, QueryError> {
    match criteria {
        Criteria::And(a, b) => {
            let left = eval(reader, a, strategy, cache)?;
            if left.is_empty() {
                return Ok(left);
            }
            let right = eval(reader, b, strategy, cache)?;
            Ok(left.intersection(&right).copied().collect())
        }
        Criteria::Or(a, b) => {
            let mut left = eval(reader, a, strategy, cache)?;
            left.extend(eval(reader, b, strategy, cache)?);
            Ok(left)
        }
        Criteria::Not(inner) => {
            let matched = eval(reader, inner, strategy, cache)?;
            Ok(reader
                .inventory()?
                .into_iter()
                .filter(|id| !matched.contains(id))
                .collect())
        }
        Criteria::Leaf {
            key,
            operator,
            values,
        } => eval_leaf(reader, key, operator, values, strategy, cache),
    }
}

fn eval_leaf<R: Reader>(
    reader: &R,
    key: &Text,
    operator: &Operator,
    values: &[Value],
    strategy: NavStrategy,
    cache: &mut RegexCache,
) -> Result<BTreeSet<Id>, QueryError> {
    if key.contains('.') {
        let path: Vec<Text> = key.split('.').map(Text::new).collect();
        return eval_navigation(reader, &path, operator, values, strategy, cache);
    }
    let (positive, negated) = operator.positive_form();
    let matched = eval_plain_positive(reader, key, &positive, values, cache)?;
    if !negated {
        return Ok(matched);
    }
    // NOT_X: records holding the key at all, minus X matches
    let holding = records_with_key(reader, key)?;
    Ok(holding.into_iter().filter(|id| !matched.contains(id)).collect())
}

fn eval_plain_positive<R: Reader>(
    reader: &R,
    key: &Text,
    positive: &Operator,
    values: &[Value],
    cache: &mut RegexCache,
) -> Result<BTreeSet<Id>, QueryError> {
    match positive {
        Operator::Equals | Operator::LinksTo => {
            let operand = values.first().ok_or_else(|| {
                QueryError::InvalidCriteria(format!("{positive} is missing its operand"))
            })?;
            reader.index_lookup(key, operand)
        }
        Operator::Contains => {
            let operand = values.first().and_then(Value::as_text).ok_or_else(|| {
                QueryError::InvalidCriteria("CONTAINS requires a string operand".into())
            })?;
            search(reader, key, operand.as_str())
        }
        _ => {
            let mut out = BTreeSet::new();
            for (value, ids) in reader.index_browse(key)? {
                if value_matches(positive, &value, values, cache)? {
                    out.extend(ids);
                }
            }
            Ok(out)
        }
    }
}

fn records_with_key<R: Reader>(reader: &R, key: &Text) -> Result<BTreeSet<Id>, QueryError> {
    let mut out = BTreeSet::new();
    for (_, ids) in reader.index_browse(key)? {
        out.extend(ids);
    }
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Navigation
// ------------------------------------------------------------------------------------------------

fn eval_navigation<R: Reader>(
    reader: &R,
    path: &[Text],
    operator: &Operator,
    values: &[Value],
    strategy: NavStrategy,
    cache: &mut RegexCache,
) -> Result<BTreeSet<Id>, QueryError> {
    if path.len() < 2 {
        return Err(QueryError::InvalidCriteria(
            "navigation key must have at least two segments".into(),
        ));
    }
    let (positive, negated) = operator.positive_form();
    let strategy = match strategy {
        NavStrategy::Auto => choose_strategy(reader, path, &positive, values)?,
        pinned => pinned,
    };

    let positive_matched = match strategy {
        NavStrategy::Forward | NavStrategy::Auto => {
            forward_navigation(reader, path, &positive, values, cache)?
        }
        NavStrategy::Reverse => reverse_navigation(reader, path, &positive, values, cache)?,
        NavStrategy::AdHoc => adhoc_navigation(reader, path, &positive, values, cache)?,
    };
    if !negated {
        return Ok(positive_matched);
    }
    // candidates: origins whose path reaches at least one leaf value
    let candidates: BTreeSet<Id> = browse_navigation(reader, path)?
        .into_values()
        .flatten()
        .collect();
    Ok(candidates
        .into_iter()
        .filter(|id| !positive_matched.contains(id))
        .collect())
}

fn choose_strategy<R: Reader>(
    reader: &R,
    path: &[Text],
    positive: &Operator,
    values: &[Value],
) -> Result<NavStrategy, QueryError> {
    let source_count = records_with_key(reader, &path[0])?.len();
    match positive {
        Operator::Equals | Operator::LinksTo => {
            let leaf_key = &path[path.len() - 1];
            let leaf_count = match values.first() {
                Some(operand) => reader.index_lookup(leaf_key, operand)?.len(),
                None => 0,
            };
            if leaf_count < source_count {
                Ok(NavStrategy::Reverse)
            } else {
                Ok(NavStrategy::Forward)
            }
        }
        _ if source_count <= 4096 => Ok(NavStrategy::Forward),
        _ => Ok(NavStrategy::AdHoc),
    }
}

/// Leaf values reachable from `record` along `path`.
fn collect_leaves<R: Reader>(
    reader: &R,
    record: Id,
    path: &[Text],
) -> Result<BTreeSet<Value>, QueryError> {
    let (first, rest) = match path.split_first() {
        Some(split) => split,
        None => return Ok(BTreeSet::new()),
    };
    let values = reader.select(record, first)?;
    if rest.is_empty() {
        return Ok(values);
    }
    let mut out = BTreeSet::new();
    for value in values {
        if let Value::Link(next) = value {
            out.extend(collect_leaves(reader, next, rest)?);
        }
    }
    Ok(out)
}

fn forward_navigation<R: Reader>(
    reader: &R,
    path: &[Text],
    positive: &Operator,
    values: &[Value],
    cache: &mut RegexCache,
) -> Result<BTreeSet<Id>, QueryError> {
    let sources = records_with_key(reader, &path[0])?;
    let mut out = BTreeSet::new();
    for source in sources {
        for leaf in collect_leaves(reader, source, path)? {
            if value_matches(positive, &leaf, values, cache)? {
                out.insert(source);
                break;
            }
        }
    }
    Ok(out)
}

fn reverse_navigation<R: Reader>(
    reader: &R,
    path: &[Text],
    positive: &Operator,
    values: &[Value],
    cache: &mut RegexCache,
) -> Result<BTreeSet<Id>, QueryError> {
    let leaf_key = &path[path.len() - 1];
    let mut current = eval_plain_positive(reader, leaf_key, positive, values, cache)?;
    // walk the link inverses back to the origins
    for key in path[..path.len() - 1].iter().rev() {
        if current.is_empty() {
            return Ok(current);
        }
        let mut linking = BTreeSet::new();
        for (value, ids) in reader.index_browse(key)? {
            if let Value::Link(target) = value
                && current.contains(&target)
            {
                linking.extend(ids);
            }
        }
        current = linking;
    }
    Ok(current)
}

fn adhoc_navigation<R: Reader>(
    reader: &R,
    path: &[Text],
    positive: &Operator,
    values: &[Value],
    cache: &mut RegexCache,
) -> Result<BTreeSet<Id>, QueryError> {
    let mapping = browse_navigation(reader, path)?;
    let mut out = BTreeSet::new();
    for (value, origins) in mapping {
        if value_matches(positive, &value, values, cache)? {
            out.extend(origins);
        }
    }
    Ok(out)
}

/// `leaf value → origin records` for a navigation path: the temporary
/// index behind the ad-hoc strategy and behind `browse` on a dotted key.
pub fn browse_navigation<R: Reader>(
    reader: &R,
    path: &[Text],
) -> Result<BTreeMap<Value, BTreeSet<Id>>, QueryError> {
    let sources = records_with_key(reader, &path[0])?;
    let mut out: BTreeMap<Value, BTreeSet<Id>> = BTreeMap::new();
    for source in sources {
        for leaf in collect_leaves(reader, source, path)? {
            out.entry(leaf).or_default().insert(source);
        }
    }
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Search
// ------------------------------------------------------------------------------------------------

/// Full-text infix search over the corpus of `key`.
///
/// Both sides are tokenized identically; a record matches when every
/// query token, in order, is a substring of the stored token at
/// consecutive positions.
pub fn search<R: Reader>(reader: &R, key: &Text, query: &str) -> Result<BTreeSet<Id>, QueryError> {
    let query_tokens = tokenize_text(query);
    if query_tokens.is_empty() {
        return Ok(BTreeSet::new());
    }

    let corpus = reader.corpus_positions(key)?;
    // invert to record → position → tokens at that position
    let mut by_record: HashMap<Id, BTreeMap<u32, Vec<Text>>> = HashMap::new();
    for (token, positions) in corpus {
        for position in positions {
            by_record
                .entry(position.record)
                .or_default()
                .entry(position.index)
                .or_default()
                .push(token.clone());
        }
    }

    let mut out = BTreeSet::new();
    'records: for (record, slots) in by_record {
        for &start in slots.keys() {
            let run_matches = query_tokens.iter().enumerate().all(|(i, term)| {
                slots
                    .get(&(start + i as u32))
                    .is_some_and(|tokens| tokens.iter().any(|t| t.contains(term.as_str())))
            });
            if run_matches {
                out.insert(record);
                continue 'records;
            }
        }
    }
    Ok(out)
}
