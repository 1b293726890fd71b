//! Lexical helpers for the pattern-based rewriter. These understand parentheses,
//! quoted literals and bracketed identifiers, nothing more.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("unbalanced parenthesis at byte {0}")]
    UnbalancedParens(usize),
    #[error("unterminated literal starting at byte {0}")]
    UnterminatedLiteral(usize),
}

pub type RuleResult = Result<String, RuleError>;

/// Table reference following `FROM`, optionally schema-qualified or bracketed.
pub static FROM_TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bFROM\s+((?:\[[^\]]+\]|[A-Za-z_][\w$#]*)(?:\.(?:\[[^\]]+\]|[A-Za-z_][\w$#]*))*)",
    )
    .expect("valid from-table regex")
});

const RESERVED_AFTER_TABLE: &[&str] = &[
    "where", "group", "order", "having", "inner", "left", "right", "full", "outer", "cross",
    "join", "on", "union", "with", "except", "intersect", "option", "for", "limit", "into",
];

pub fn is_reserved_after_table(word: &str) -> bool {
    RESERVED_AFTER_TABLE
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(word))
}

/// Strips the schema qualifier and brackets from a table reference.
pub fn bare_table_name(reference: &str) -> &str {
    let last = reference.rsplit('.').next().unwrap_or(reference);
    last.trim_start_matches('[').trim_end_matches(']')
}

/// Replaces the last segment of the first `FROM` table with `replacement`, keeping
/// any schema qualifier and bracket style.
pub fn substitute_from_table(sql: &str, replacement: &str) -> Option<String> {
    let table = FROM_TABLE_RE.captures(sql)?.get(1)?;
    let reference = table.as_str();
    let segment_start = if reference.ends_with(']') {
        reference.rfind('[').unwrap_or(0)
    } else {
        reference.rfind('.').map(|dot| dot + 1).unwrap_or(0)
    };
    let qualifier = &reference[..segment_start];
    let segment = &reference[segment_start..];
    let bracketed = segment.starts_with('[') || replacement.contains(' ');
    let rebuilt = if bracketed {
        format!("{}[{}]", qualifier, replacement)
    } else {
        format!("{}{}", qualifier, replacement)
    };

    let mut out = String::with_capacity(sql.len() + replacement.len());
    out.push_str(&sql[..table.start()]);
    out.push_str(&rebuilt);
    out.push_str(&sql[table.end()..]);
    Some(out)
}

/// Byte offset of the `)` that closes the `(` at `open`.
pub fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    let mut index = open;
    while index < bytes.len() {
        match bytes[index] {
            b'\'' | b'"' => {
                index = skip_quoted(bytes, index)?;
                continue;
            }
            b'[' => {
                index = skip_bracketed(bytes, index)?;
                continue;
            }
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
        index += 1;
    }
    None
}

fn skip_quoted(bytes: &[u8], start: usize) -> Option<usize> {
    let quote = bytes[start];
    let mut index = start + 1;
    while index < bytes.len() {
        if bytes[index] == quote {
            if bytes.get(index + 1) == Some(&quote) {
                index += 2;
                continue;
            }
            return Some(index + 1);
        }
        index += 1;
    }
    None
}

fn skip_bracketed(bytes: &[u8], start: usize) -> Option<usize> {
    bytes[start..]
        .iter()
        .position(|byte| *byte == b']')
        .map(|offset| start + offset + 1)
}

/// Byte ranges of the comma-separated items at paren depth zero.
pub fn split_top_level_ranges(text: &str) -> Result<Vec<(usize, usize)>, RuleError> {
    let bytes = text.as_bytes();
    let mut ranges = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        match bytes[index] {
            b'\'' | b'"' => {
                index = skip_quoted(bytes, index).ok_or(RuleError::UnterminatedLiteral(index))?;
                continue;
            }
            b'[' => {
                index = skip_bracketed(bytes, index).ok_or(RuleError::UnterminatedLiteral(index))?;
                continue;
            }
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(RuleError::UnbalancedParens(index));
                }
            }
            b',' if depth == 0 => {
                ranges.push((start, index));
                start = index + 1;
            }
            _ => {}
        }
        index += 1;
    }
    if depth != 0 {
        return Err(RuleError::UnbalancedParens(text.len()));
    }
    ranges.push((start, text.len()));
    Ok(ranges)
}

pub fn split_top_level(text: &str) -> Result<Vec<String>, RuleError> {
    Ok(split_top_level_ranges(text)?
        .into_iter()
        .map(|(start, end)| text[start..end].trim().to_string())
        .collect())
}

/// First occurrence of `keyword` as a whole word at paren depth zero, outside literals.
pub fn find_top_level_keyword(text: &str, from: usize, keyword: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let needle = keyword.as_bytes();
    let mut depth = 0i32;
    let mut index = from;
    while index < bytes.len() {
        match bytes[index] {
            b'\'' | b'"' => {
                index = skip_quoted(bytes, index)?;
                continue;
            }
            b'[' => {
                index = skip_bracketed(bytes, index)?;
                continue;
            }
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 && starts_with_word(bytes, index, needle) => return Some(index),
            _ => {}
        }
        index += 1;
    }
    None
}

fn starts_with_word(bytes: &[u8], index: usize, needle: &[u8]) -> bool {
    let end = index + needle.len();
    if end > bytes.len() || !bytes[index..end].eq_ignore_ascii_case(needle) {
        return false;
    }
    let before_ok = index == 0 || !is_word_byte(bytes[index - 1]);
    let after_ok = end == bytes.len() || !is_word_byte(bytes[end]);
    before_ok && after_ok
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Rewrites every call matched by `call_re` (which must end in `\(`), innermost
/// arguments first. `rewrite` receives the function name as written and the already
/// rewritten arguments; returning `None` keeps the call as is.
pub fn rewrite_calls<F>(text: &str, call_re: &Regex, rewrite: &F) -> RuleResult
where
    F: Fn(&str, &[String]) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    while let Some(found) = call_re.find_at(text, cursor) {
        let open = found.end() - 1;
        let close = matching_paren(text, open).ok_or(RuleError::UnbalancedParens(open))?;
        let inner = rewrite_calls(&text[open + 1..close], call_re, rewrite)?;
        let args = if inner.trim().is_empty() {
            Vec::new()
        } else {
            split_top_level(&inner)?
        };
        let name = text[found.start()..open].trim_end();

        out.push_str(&text[cursor..found.start()]);
        match rewrite(name, &args) {
            Some(replacement) => out.push_str(&replacement),
            None => {
                out.push_str(&text[found.start()..=open]);
                out.push_str(&inner);
                out.push(')');
            }
        }
        cursor = close + 1;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}
