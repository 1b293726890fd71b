//! Ranks catalog tables as replacements for a query whose table does not exist on
//! the target backend.

pub mod session;

use crate::dialect::sqltext::bare_table_name;
use crate::models::TableCatalog;
use crate::similarity::{similarity_ratio, token_overlap};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

pub use session::{ResolutionSession, ResolutionSessions, ResolutionState};

const COLUMN_WEIGHT: f64 = 0.7;
const NAME_WEIGHT: f64 = 0.3;
const MIN_COMBINED_SCORE: f64 = 0.3;
const FUZZY_COLUMN_FLOOR: f64 = 0.7;
const MAX_CANDIDATES: usize = 5;

static STRING_LITERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid literal regex"));
static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([^\]]+)\]|([A-Za-z_][A-Za-z0-9_]*)").expect("valid identifier regex")
});
static TABLE_AND_ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:FROM|JOIN)\s+((?:\[[^\]]+\]|[A-Za-z_][\w$#]*)(?:\.(?:\[[^\]]+\]|[A-Za-z_][\w$#]*))*)(?:\s+(?:AS\s+)?([A-Za-z_]\w*))?",
    )
    .expect("valid table alias regex")
});

const SQL_WORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "as", "on", "join", "inner", "left",
    "right", "outer", "full", "cross", "group", "by", "order", "having", "top", "distinct",
    "case", "when", "then", "else", "end", "is", "null", "in", "between", "like", "asc",
    "desc", "with", "nolock", "union", "all", "exists", "true", "false", "percent", "limit",
    "day", "week", "month", "quarter", "year", "hour", "minute", "second", "d", "ww", "m",
    "q", "yyyy", "h", "n", "s", "dd", "wk", "mm", "qq", "yy", "hh", "mi", "ss",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMatch {
    pub table_name: String,
    pub column_score: f64,
    pub name_score: f64,
    pub combined_score: f64,
}

/// Scores every catalog table against the query's columns and the row label.
pub fn rank(sql_columns: &[String], label: &str, catalog: &TableCatalog) -> Vec<CandidateMatch> {
    let mut candidates: Vec<CandidateMatch> = catalog
        .tables
        .iter()
        .map(|table| {
            let column_score = column_score(sql_columns, &table.columns);
            let name_score = name_score(label, &table.name);
            CandidateMatch {
                table_name: table.name.clone(),
                column_score,
                name_score,
                combined_score: COLUMN_WEIGHT * column_score + NAME_WEIGHT * name_score,
            }
        })
        .filter(|candidate| candidate.combined_score > MIN_COMBINED_SCORE)
        .collect();

    candidates.sort_by(|left, right| {
        right
            .combined_score
            .partial_cmp(&left.combined_score)
            .unwrap_or(Ordering::Equal)
    });
    candidates.truncate(MAX_CANDIDATES);
    candidates
}

/// Average over the referenced columns of the best match each finds in `table_columns`.
pub fn column_score(sql_columns: &[String], table_columns: &[String]) -> f64 {
    if sql_columns.is_empty() {
        return 0.0;
    }
    let total: f64 = sql_columns
        .iter()
        .map(|wanted| {
            if table_columns
                .iter()
                .any(|column| column.eq_ignore_ascii_case(wanted))
            {
                return 1.0;
            }
            table_columns
                .iter()
                .map(|column| similarity_ratio(wanted, column))
                .filter(|ratio| *ratio > FUZZY_COLUMN_FLOOR)
                .fold(0.0, f64::max)
        })
        .sum();
    total / sql_columns.len() as f64
}

pub fn name_score(label: &str, table_name: &str) -> f64 {
    token_overlap(label, table_name)
}

/// Column identifiers a query references, in first-seen order. Function names,
/// keywords, aliases, qualifiers and the tables themselves are left out.
pub fn referenced_columns(sql: &str) -> Vec<String> {
    let text = STRING_LITERAL_RE.replace_all(sql, "''");

    let mut excluded: HashSet<String> = HashSet::new();
    for caps in TABLE_AND_ALIAS_RE.captures_iter(&text) {
        if let Some(table) = caps.get(1) {
            excluded.insert(bare_table_name(table.as_str()).to_lowercase());
        }
        if let Some(alias) = caps.get(2) {
            excluded.insert(alias.as_str().to_lowercase());
        }
    }

    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    let mut previous_word = String::new();
    for caps in IDENTIFIER_RE.captures_iter(&text) {
        let Some(whole) = caps.get(0) else { continue };
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let after_as = previous_word.eq_ignore_ascii_case("as");
        previous_word = name.to_string();

        let rest = text[whole.end()..].trim_start();
        let is_call = rest.starts_with('(');
        let is_qualifier = text[whole.end()..].starts_with('.');
        let lowered = name.to_lowercase();
        if after_as
            || is_call
            || is_qualifier
            || SQL_WORDS.contains(&lowered.as_str())
            || excluded.contains(&lowered)
        {
            continue;
        }
        if seen.insert(lowered) {
            columns.push(name.to_string());
        }
    }
    columns
}
