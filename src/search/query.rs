use std::cmp::Ordering;
use std::collections::BTreeSet;
use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;
use crate::aggregation::number::Number;
use crate::core::error::{Error, Result};
use crate::core::types::ColumnValue;

/// How a leaf's matches are folded into the running block state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchOp {
    And,
    Or,
    Exclusion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
}

impl FilterOp {
    fn holds(&self, ord: Ordering) -> bool {
        match self {
            FilterOp::Equals => ord == Ordering::Equal,
            FilterOp::NotEquals => ord != Ordering::Equal,
            FilterOp::LessThan => ord == Ordering::Less,
            FilterOp::LessThanOrEqualTo => ord != Ordering::Greater,
            FilterOp::GreaterThan => ord == Ordering::Greater,
            FilterOp::GreaterThanOrEqualTo => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnSelector {
    Named(String),
    All,  // every column that survived micro-index pruning
}

impl ColumnSelector {
    pub fn named(name: &str) -> Self {
        ColumnSelector::Named(name.to_string())
    }
}

/// Turns a `*` wildcard literal into an anchored regex.
fn wildcard_regex(literal: &str) -> Result<Regex> {
    let body = literal
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Ok(Regex::new(&format!("^{}$", body))?)
}

/// True when `word` occurs in `haystack` delimited by non-alphanumeric characters or the ends.
pub fn is_sub_word_present(haystack: &str, word: &str) -> bool {
    if word.is_empty() {
        return true;
    }
    haystack.match_indices(word).any(|(start, _)| {
        let end = start + word.len();
        let before_ok = haystack[..start].chars().next_back().is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[end..].chars().next().is_none_or(|c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

/// Words searched for in a column; the operator decides whether all or any must be present.
#[derive(Debug, Clone)]
pub struct MatchFilter {
    pub column: ColumnSelector,
    pub words: Vec<String>,
    pub op: LogicalOp,
    pub negate: bool,
    wildcards: Vec<Option<Regex>>,
}

impl MatchFilter {
    pub fn new(column: ColumnSelector, words: Vec<String>, op: LogicalOp) -> Result<Self> {
        let wildcards = words
            .iter()
            .map(|w| if w.contains('*') { wildcard_regex(w).map(Some) } else { Ok(None) })
            .collect::<Result<Vec<_>>>()?;
        Ok(MatchFilter { column, words, op, negate: false, wildcards })
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    fn word_present(&self, idx: usize, value: &str) -> bool {
        match &self.wildcards[idx] {
            Some(re) => value.unicode_words().any(|w| re.is_match(w)),
            None => is_sub_word_present(value, &self.words[idx]),
        }
    }

    pub fn matches(&self, value: &ColumnValue) -> bool {
        if self.words.is_empty() {
            return true;
        }
        let value = match value {
            ColumnValue::Str(s) => s,
            _ => return false,
        };
        match self.op {
            LogicalOp::And => (0..self.words.len()).all(|i| self.word_present(i, value)),
            LogicalOp::Or => (0..self.words.len()).any(|i| self.word_present(i, value)),
        }
    }
}

/// `column <op> value`. String equality honours `*` wildcards.
#[derive(Debug, Clone)]
pub struct ExpressionFilter {
    pub column: ColumnSelector,
    pub op: FilterOp,
    pub value: ColumnValue,
    wildcard: Option<Regex>,
}

impl ExpressionFilter {
    pub fn new(column: ColumnSelector, op: FilterOp, value: ColumnValue) -> Result<Self> {
        let wildcard = match &value {
            ColumnValue::Str(s) if s.contains('*') => Some(wildcard_regex(s)?),
            _ => None,
        };
        Ok(ExpressionFilter { column, op, value, wildcard })
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard.is_some()
    }

    pub fn matches(&self, record: &ColumnValue) -> bool {
        match &self.value {
            ColumnValue::Signed(_) | ColumnValue::Unsigned(_) | ColumnValue::Float(_) => {
                let (Some(q), Some(r)) = (Number::from_column_value(&self.value), Number::from_column_value(record)) else {
                    return false;
                };
                r.compare(&q).is_some_and(|ord| self.op.holds(ord))
            }
            ColumnValue::Str(q) => {
                let r = match record {
                    ColumnValue::Str(s) => s.clone(),
                    ColumnValue::Null => return false,
                    other => other.to_string(),
                };
                match (&self.wildcard, self.op) {
                    (Some(re), FilterOp::Equals) => re.is_match(&r),
                    (Some(re), FilterOp::NotEquals) => !re.is_match(&r),
                    _ => self.op.holds(r.as_str().cmp(q.as_str())),
                }
            }
            ColumnValue::Bool(q) => match (record, self.op) {
                (ColumnValue::Bool(r), FilterOp::Equals) => r == q,
                (ColumnValue::Bool(r), FilterOp::NotEquals) => r != q,
                _ => false,
            },
            ColumnValue::Null => match self.op {
                FilterOp::Equals => matches!(record, ColumnValue::Null),
                FilterOp::NotEquals => !matches!(record, ColumnValue::Null),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegexFilter {
    pub column: ColumnSelector,
    pub regex: Regex,
    pub op: FilterOp,  // Equals or NotEquals
}

impl RegexFilter {
    pub fn new(column: ColumnSelector, pattern: &str, op: FilterOp) -> Result<Self> {
        if !matches!(op, FilterOp::Equals | FilterOp::NotEquals) {
            return Err(Error::invalid_argument(format!("regex filters support = and != only, got {:?}", op)));
        }
        Ok(RegexFilter { column, regex: Regex::new(pattern)?, op })
    }

    pub fn matches(&self, record: &ColumnValue) -> bool {
        let hit = match record {
            ColumnValue::Str(s) => self.regex.is_match(s),
            ColumnValue::Null => return false,
            other => self.regex.is_match(&other.to_string()),
        };
        if self.op == FilterOp::Equals { hit } else { !hit }
    }
}

/// Inclusive numeric between.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeFilter {
    pub column: String,
    pub low: Number,
    pub high: Number,
}

impl RangeFilter {
    pub fn matches(&self, record: &ColumnValue) -> bool {
        let Some(v) = Number::from_column_value(record) else {
            return false;
        };
        v.compare(&self.low).is_some_and(|o| o != Ordering::Less)
            && v.compare(&self.high).is_some_and(|o| o != Ordering::Greater)
    }
}

/// Literal tokens a block bloom filter can be probed with.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomKeys {
    pub keys: BTreeSet<String>,
    pub wildcard_exists: bool,
    pub op: LogicalOp,
}

/// A leaf predicate.
#[derive(Debug, Clone)]
pub enum SearchQuery {
    MatchAll,                       // only the record's time matters
    Match(MatchFilter),             // words in a column
    Expression(ExpressionFilter),   // column <op> literal
    Regex(RegexFilter),
    Range(RangeFilter),             // low <= column <= high
}

impl SearchQuery {
    pub fn words(column: &str, words: &[&str], op: LogicalOp) -> Result<Self> {
        Ok(SearchQuery::Match(MatchFilter::new(
            ColumnSelector::named(column),
            words.iter().map(|w| w.to_string()).collect(),
            op,
        )?))
    }

    pub fn expression(column: &str, op: FilterOp, value: impl Into<ColumnValue>) -> Result<Self> {
        Ok(SearchQuery::Expression(ExpressionFilter::new(
            ColumnSelector::named(column),
            op,
            value.into(),
        )?))
    }

    pub fn any_column(op: FilterOp, value: impl Into<ColumnValue>) -> Result<Self> {
        Ok(SearchQuery::Expression(ExpressionFilter::new(ColumnSelector::All, op, value.into())?))
    }

    pub fn range(column: &str, low: Number, high: Number) -> Self {
        SearchQuery::Range(RangeFilter { column: column.to_string(), low, high })
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, SearchQuery::MatchAll)
    }

    pub fn is_negated(&self) -> bool {
        matches!(self, SearchQuery::Match(m) if m.negate)
    }

    pub fn column(&self) -> Option<ColumnSelector> {
        match self {
            SearchQuery::MatchAll => None,
            SearchQuery::Match(m) => Some(m.column.clone()),
            SearchQuery::Expression(e) => Some(e.column.clone()),
            SearchQuery::Regex(r) => Some(r.column.clone()),
            SearchQuery::Range(r) => Some(ColumnSelector::Named(r.column.clone())),
        }
    }

    /// Positive predicate on one value; negation is applied by the caller.
    pub fn matches_value(&self, value: &ColumnValue) -> bool {
        match self {
            SearchQuery::MatchAll => true,
            SearchQuery::Match(m) => m.matches(value),
            SearchQuery::Expression(e) => e.matches(value),
            SearchQuery::Regex(r) => r.matches(value),
            SearchQuery::Range(r) => r.matches(value),
        }
    }

    /// True when a record without a value in the column satisfies the leaf.
    pub fn matches_missing(&self) -> bool {
        self.is_negated() != self.matches_value(&ColumnValue::Null)
    }

    /// None when the predicate cannot be answered by a bloom filter at all.
    pub fn bloom_keys(&self) -> Option<BloomKeys> {
        match self {
            SearchQuery::Match(m) if !m.negate => {
                let mut keys = BTreeSet::new();
                let mut wildcard_exists = false;
                for w in &m.words {
                    // blocks index alphanumeric runs, so anything else cannot be probed
                    if w.contains('*') || !w.chars().all(char::is_alphanumeric) {
                        wildcard_exists = true;
                    } else {
                        keys.insert(w.clone());
                    }
                }
                // a single probe has to be present whatever the operator
                let op = if keys.len() == 1 && !wildcard_exists { LogicalOp::And } else { m.op };
                Some(BloomKeys { keys, wildcard_exists, op })
            }
            SearchQuery::Expression(e) if e.op == FilterOp::Equals => match &e.value {
                ColumnValue::Str(_) if e.has_wildcard() => Some(BloomKeys {
                    keys: BTreeSet::new(),
                    wildcard_exists: true,
                    op: LogicalOp::And,
                }),
                ColumnValue::Str(s) if !s.is_empty() => Some(BloomKeys {
                    keys: BTreeSet::from([s.clone()]),
                    wildcard_exists: false,
                    op: LogicalOp::And,
                }),
                _ => None,
            },
            SearchQuery::Regex(_) => Some(BloomKeys {
                keys: BTreeSet::new(),
                wildcard_exists: true,
                op: LogicalOp::And,
            }),
            _ => None,
        }
    }
}

/// Leaves and nested nodes sharing one composition operator.
#[derive(Debug, Clone, Default)]
pub struct SearchCondition {
    pub queries: Vec<SearchQuery>,
    pub nodes: Vec<SearchNode>,
}

impl SearchCondition {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchNodeType {
    MatchAll,     // only needs each record's timestamp
    ColumnValue,  // needs at least one non-timestamp column
    Invalid,      // references columns the segment cannot provide; matches nothing
}

/// A record matches a node if it matches all `and` conditions, any `or` condition and no `exclusion` condition.
#[derive(Debug, Clone, Default)]
pub struct SearchNode {
    pub and: Option<SearchCondition>,
    pub or: Option<SearchCondition>,
    pub exclusion: Option<SearchCondition>,
}

impl SearchNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_all() -> Self {
        SearchNode::new().with_and(SearchQuery::MatchAll)
    }

    pub fn with_and(mut self, query: SearchQuery) -> Self {
        self.and.get_or_insert_with(SearchCondition::default).queries.push(query);
        self
    }

    pub fn with_or(mut self, query: SearchQuery) -> Self {
        self.or.get_or_insert_with(SearchCondition::default).queries.push(query);
        self
    }

    pub fn with_exclusion(mut self, query: SearchQuery) -> Self {
        self.exclusion.get_or_insert_with(SearchCondition::default).queries.push(query);
        self
    }

    pub fn with_and_node(mut self, node: SearchNode) -> Self {
        self.and.get_or_insert_with(SearchCondition::default).nodes.push(node);
        self
    }

    pub fn with_or_node(mut self, node: SearchNode) -> Self {
        self.or.get_or_insert_with(SearchCondition::default).nodes.push(node);
        self
    }

    pub fn with_exclusion_node(mut self, node: SearchNode) -> Self {
        self.exclusion.get_or_insert_with(SearchCondition::default).nodes.push(node);
        self
    }

    /// Conditions in evaluation order.
    pub fn conditions(&self) -> impl Iterator<Item = (&SearchCondition, SearchOp)> {
        [
            (self.and.as_ref(), SearchOp::And),
            (self.or.as_ref(), SearchOp::Or),
            (self.exclusion.as_ref(), SearchOp::Exclusion),
        ]
        .into_iter()
        .filter_map(|(c, op)| c.map(|c| (c, op)))
    }

    pub fn node_type(&self) -> SearchNodeType {
        let column_value = self.conditions().any(|(cond, _)| {
            cond.queries.iter().any(|q| !q.is_match_all())
                || cond.nodes.iter().any(|n| n.node_type() != SearchNodeType::MatchAll)
        });
        if column_value { SearchNodeType::ColumnValue } else { SearchNodeType::MatchAll }
    }

    pub fn is_match_all(&self) -> bool {
        self.node_type() == SearchNodeType::MatchAll
    }

    /// Named columns every matching record must have a value in.
    pub fn required_columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if let Some(cond) = &self.and {
            for q in &cond.queries {
                if let (Some(ColumnSelector::Named(c)), false) = (q.column(), q.matches_missing()) {
                    out.insert(c);
                }
            }
            for n in &cond.nodes {
                out.extend(n.required_columns());
            }
        }
        out
    }

    /// Named columns referenced anywhere under this node.
    pub fn named_columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for (cond, _) in self.conditions() {
            for q in &cond.queries {
                if let Some(ColumnSelector::Named(c)) = q.column() {
                    out.insert(c);
                }
            }
            for n in &cond.nodes {
                out.extend(n.named_columns());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_word_requires_boundaries() {
        assert!(is_sub_word_present("error: disk full", "disk"));
        assert!(is_sub_word_present("disk", "disk"));
        assert!(!is_sub_word_present("diskette", "disk"));
        assert!(is_sub_word_present("a diskette, a disk", "disk"));
    }

    #[test]
    fn match_words_and_or() {
        let and = MatchFilter::new(ColumnSelector::All, vec!["disk".into(), "full".into()], LogicalOp::And).unwrap();
        let or = MatchFilter::new(ColumnSelector::All, vec!["disk".into(), "cpu".into()], LogicalOp::Or).unwrap();
        let v = ColumnValue::from("disk is full");
        assert!(and.matches(&v));
        assert!(or.matches(&v));
        assert!(!and.matches(&ColumnValue::from("disk is empty")));
        assert!(!or.matches(&ColumnValue::Signed(3)));
    }

    #[test]
    fn wildcard_match_word() {
        let m = MatchFilter::new(ColumnSelector::All, vec!["time*".into()], LogicalOp::And).unwrap();
        assert!(m.matches(&ColumnValue::from("request timeout after 3s")));
        assert!(!m.matches(&ColumnValue::from("request failed")));
    }

    #[test]
    fn expression_numeric_and_string() {
        let gt = ExpressionFilter::new(ColumnSelector::named("latency"), FilterOp::GreaterThan, ColumnValue::Signed(10)).unwrap();
        assert!(gt.matches(&ColumnValue::Unsigned(11)));
        assert!(gt.matches(&ColumnValue::from("12.5")));
        assert!(!gt.matches(&ColumnValue::Float(10.0)));
        assert!(!gt.matches(&ColumnValue::from("n/a")));

        let eq = ExpressionFilter::new(ColumnSelector::named("host"), FilterOp::Equals, ColumnValue::from("web-*")).unwrap();
        assert!(eq.matches(&ColumnValue::from("web-01")));
        assert!(!eq.matches(&ColumnValue::from("db-01")));
    }

    #[test]
    fn bloom_keys_skip_wildcards_and_negation() {
        let q = SearchQuery::words("msg", &["disk", "ful*"], LogicalOp::Or).unwrap();
        let keys = q.bloom_keys().unwrap();
        assert!(keys.wildcard_exists);
        assert_eq!(keys.keys.len(), 1);
        assert_eq!(keys.op, LogicalOp::Or);

        let neg = SearchQuery::Match(MatchFilter::new(ColumnSelector::All, vec!["x".into()], LogicalOp::And).unwrap().negated());
        assert!(neg.bloom_keys().is_none());
        assert!(SearchQuery::expression("a", FilterOp::NotEquals, "x").unwrap().bloom_keys().is_none());
    }

    #[test]
    fn node_type_and_columns() {
        let node = SearchNode::match_all();
        assert!(node.is_match_all());
        let node = SearchNode::new()
            .with_and(SearchQuery::expression("host", FilterOp::Equals, "a").unwrap())
            .with_or_node(SearchNode::new().with_and(SearchQuery::range("latency", Number::I64(1), Number::I64(2))));
        assert_eq!(node.node_type(), SearchNodeType::ColumnValue);
        assert_eq!(node.named_columns().into_iter().collect::<Vec<_>>(), vec!["host", "latency"]);
        assert_eq!(node.required_columns().into_iter().collect::<Vec<_>>(), vec!["host"]);
    }

    #[test]
    fn missing_values_only_satisfy_negations_and_null_checks() {
        let neg = SearchQuery::Match(MatchFilter::new(ColumnSelector::named("msg"), vec!["x".into()], LogicalOp::And).unwrap().negated());
        assert!(neg.matches_missing());
        assert!(!SearchQuery::words("msg", &["x"], LogicalOp::And).unwrap().matches_missing());
        assert!(!SearchQuery::expression("msg", FilterOp::NotEquals, "x").unwrap().matches_missing());
        assert!(SearchQuery::Expression(
            ExpressionFilter::new(ColumnSelector::named("msg"), FilterOp::Equals, ColumnValue::Null).unwrap()
        ).matches_missing());
    }
}
