//! The ordered rewrite rules. Each rule is a pure text transform that leaves its
//! input unchanged when the construct it handles is absent.

use super::sqltext::{
    bare_table_name, find_top_level_keyword, is_reserved_after_table, matching_paren,
    rewrite_calls, split_top_level_ranges, substitute_from_table, RuleResult, FROM_TABLE_RE,
};
use super::{DialectProfile, IntervalUnit};
use crate::models::{Dialect, TableCatalog};
use crate::similarity::similarity_ratio;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

pub struct TranslationContext<'a> {
    pub source: &'static DialectProfile,
    pub target: &'static DialectProfile,
    pub catalog: Option<&'a TableCatalog>,
}

pub struct Rule {
    pub name: &'static str,
    pub apply: fn(&str, &TranslationContext<'_>) -> RuleResult,
}

pub static RULES: [Rule; 11] = [
    Rule { name: "value-alias", apply: value_alias },
    Rule { name: "schema-qualification", apply: schema_qualification },
    Rule { name: "lock-hint", apply: lock_hint },
    Rule { name: "current-timestamp", apply: current_timestamp },
    Rule { name: "date-arithmetic", apply: date_arithmetic },
    Rule { name: "null-coalesce", apply: null_coalesce },
    Rule { name: "inline-conditional", apply: inline_conditional },
    Rule { name: "date-part", apply: date_part },
    Rule { name: "string-case", apply: string_case },
    Rule { name: "table-repair", apply: table_repair },
    Rule { name: "inventory-guard", apply: inventory_guard },
];

const INVENTORY_FAMILY: &[&str] = &["inventory", "stock"];

/// Words that end or continue an expression, so the identifier after them is not an alias.
const EXPRESSION_WORDS: &[&str] = &[
    "and", "as", "asc", "between", "case", "collate", "desc", "distinct", "else", "end", "escape",
    "in", "is", "like", "not", "null", "or", "then", "when",
];

static SELECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSELECT\b").expect("valid select regex"));
static SELECT_MODIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:DISTINCT\b\s*)?(?:TOP\s*(?:\(\s*\d+\s*\)|\d+)(?:\s+PERCENT)?\s*)?")
        .expect("valid select modifier regex")
});
static VALUE_ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bAS\s+|\s)(?:\[value\]|value)$").expect("valid alias regex")
});
static EXPLICIT_ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\sAS\s+(\[[^\]]*\]|"[^"]*"|[A-Za-z_]\w*)$"#).expect("valid alias regex")
});
static BARE_ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)([A-Za-z_]\w*|[\w)\]'"])\s+(\[[^\]]*\]|[A-Za-z_]\w*)$"#).expect("valid alias regex")
});
static ALIAS_AFTER_TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s+(?:AS\s+)?([A-Za-z_]\w*)").expect("valid alias regex")
});
static EXISTING_HINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*WITH\s*\(").expect("valid hint regex"));
static LOCK_HINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*\bWITH\s*\(\s*NOLOCK[^)]*\)").expect("valid lock hint regex")
});
static GETDATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bGETDATE\s*\(\s*\)").expect("valid getdate regex"));
static NOW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bNow\s*\(\s*\)").expect("valid now regex"));
static CURRENT_TIMESTAMP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCURRENT_TIMESTAMP\b").expect("valid timestamp regex"));
static DATE_ARITH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(DATEADD|DATEDIFF)\s*\(\s*(?:'([A-Za-z]+)'|"([A-Za-z]+)"|([A-Za-z]+))\s*,\s*"#)
        .expect("valid date arithmetic regex")
});
static COALESCE_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:ISNULL|COALESCE)\s*\(").expect("valid coalesce regex"));
static NZ_CALL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bNz\s*\(").expect("valid nz regex"));
static AGGREGATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^(SUM|AVG)\s*\(").expect("valid aggregate regex"));
static CASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bCASE\s+WHEN\s+(.+?)\s+THEN\s+(.+?)(?:\s+ELSE\s+(.+?))?\s+END\b")
        .expect("valid case regex")
});
static NESTED_CASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:CASE|WHEN)\b").expect("valid nested case regex"));
static IIF_CALL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bIIf\s*\(").expect("valid iif regex"));
static DATEPART_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bDATEPART\s*\(").expect("valid datepart regex"));
static PART_FUNCTION_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:Year|Month|Day|DatePart)\s*\(").expect("valid part function regex")
});
static UPPER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bUPPER\s*\(").expect("valid upper regex"));
static LOWER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLOWER\s*\(").expect("valid lower regex"));
static UCASE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bUCase\s*\(").expect("valid ucase regex"));
static LCASE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLCase\s*\(").expect("valid lcase regex"));

/// 1. Alias the first select expression as `value`.
pub fn value_alias(sql: &str, _ctx: &TranslationContext<'_>) -> RuleResult {
    let Some(select) = SELECT_RE.find(sql) else {
        return Ok(sql.to_string());
    };
    let modifiers = SELECT_MODIFIER_RE
        .find(&sql[select.end()..])
        .map(|found| found.end())
        .unwrap_or(0);
    let list_start = select.end() + modifiers;
    let list_end = find_top_level_keyword(sql, list_start, "FROM").unwrap_or(sql.len());
    let list = &sql[list_start..list_end];

    let ranges = split_top_level_ranges(list)?;
    let Some(&(first_start, first_end)) = ranges.first() else {
        return Ok(sql.to_string());
    };
    let first = list[first_start..first_end].trim_end();
    let trimmed = first.trim_start();
    if trimmed.is_empty() || trimmed == "*" || trimmed.ends_with(".*") {
        return Ok(sql.to_string());
    }
    if VALUE_ALIAS_RE.is_match(trimmed) {
        return Ok(sql.to_string());
    }

    // An existing alias is renamed rather than followed by a second one.
    let base = list_start + first_start;
    if let Some(alias) = EXPLICIT_ALIAS_RE.captures(first).and_then(|caps| caps.get(1)) {
        return Ok(format!(
            "{}value{}",
            &sql[..base + alias.start()],
            &sql[base + alias.end()..]
        ));
    }
    if let Some(alias) = bare_alias(first) {
        return Ok(format!(
            "{}AS value{}",
            &sql[..base + alias.start],
            &sql[base + alias.end..]
        ));
    }

    let insert_at = base + first.len();
    let mut out = String::with_capacity(sql.len() + 9);
    out.push_str(&sql[..insert_at]);
    out.push_str(" AS value");
    out.push_str(&sql[insert_at..]);
    Ok(out)
}

/// `SUM(x) Revenue`: a trailing identifier that follows a complete operand.
fn bare_alias(expression: &str) -> Option<std::ops::Range<usize>> {
    let caps = BARE_ALIAS_RE.captures(expression)?;
    let before = caps.get(1)?.as_str();
    let alias = caps.get(2)?;
    let word = alias.as_str().trim_matches(|c| c == '[' || c == ']');
    let is_keyword = |text: &str| EXPRESSION_WORDS.iter().any(|keyword| text.eq_ignore_ascii_case(keyword));
    if is_keyword(before) || (!alias.as_str().starts_with('[') && is_keyword(word)) {
        return None;
    }
    Some(alias.range())
}

/// 2. Add or strip the schema qualifier on the `FROM` table.
pub fn schema_qualification(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let out = FROM_TABLE_RE.replace_all(sql, |caps: &Captures<'_>| {
        let whole = &caps[0];
        let table = &caps[1];
        let keyword_len = whole.len() - table.len();
        let keyword = &whole[..keyword_len];
        match (ctx.target.schema_prefix, ctx.source.schema_prefix) {
            (Some(prefix), _) if !table.contains('.') => format!("{}{}{}", keyword, prefix, table),
            (None, Some(prefix)) => {
                let stripped = strip_schema(table, prefix);
                format!("{}{}", keyword, stripped)
            }
            _ => whole.to_string(),
        }
    });
    Ok(out.into_owned())
}

fn strip_schema<'a>(table: &'a str, prefix: &str) -> &'a str {
    let schema = prefix.trim_end_matches('.');
    let bracketed = format!("[{}].", schema);
    for head in [prefix, bracketed.as_str()] {
        let matched = table.len() > head.len()
            && table.get(..head.len()).is_some_and(|start| start.eq_ignore_ascii_case(head));
        if matched {
            return &table[head.len()..];
        }
    }
    table
}

/// 3. Add the row-locking hint after the `FROM` table (and its alias) or remove it.
pub fn lock_hint(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let Some(hint) = ctx.target.lock_hint else {
        return Ok(LOCK_HINT_RE.replace_all(sql, "").into_owned());
    };

    let mut insert_points = Vec::new();
    for caps in FROM_TABLE_RE.captures_iter(sql) {
        let Some(table) = caps.get(1) else { continue };
        let mut position = table.end();
        if let Some(alias) = ALIAS_AFTER_TABLE_RE.captures(&sql[position..]) {
            let word = alias.get(1).map(|m| m.as_str()).unwrap_or_default();
            if !is_reserved_after_table(word) {
                position += alias.get(0).map(|m| m.end()).unwrap_or(0);
            }
        }
        if !EXISTING_HINT_RE.is_match(&sql[position..]) {
            insert_points.push(position);
        }
    }

    let mut out = String::with_capacity(sql.len() + insert_points.len() * (hint.len() + 1));
    let mut cursor = 0;
    for point in insert_points {
        out.push_str(&sql[cursor..point]);
        out.push(' ');
        out.push_str(hint);
        cursor = point;
    }
    out.push_str(&sql[cursor..]);
    Ok(out)
}

/// 4. Swap the "now" function. `CURRENT_TIMESTAMP` is only folded going into Access.
pub fn current_timestamp(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let now = ctx.target.now_function;
    let mut out = match ctx.target.dialect {
        Dialect::Access => GETDATE_RE.replace_all(sql, now).into_owned(),
        Dialect::SqlServer => NOW_RE.replace_all(sql, now).into_owned(),
    };
    for alias in ctx.target.now_aliases {
        if alias.eq_ignore_ascii_case("CURRENT_TIMESTAMP") {
            out = CURRENT_TIMESTAMP_RE.replace_all(&out, now).into_owned();
        }
    }
    Ok(out)
}

/// 5. `DATEADD`/`DATEDIFF` spelling and interval units. Runs after rule 4 so nested
/// "now" arguments are already in the target spelling.
pub fn date_arithmetic(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let target = ctx.target;
    let out = DATE_ARITH_RE.replace_all(sql, |caps: &Captures<'_>| {
        let function = if caps[1].eq_ignore_ascii_case("DATEADD") {
            target.date_add
        } else {
            target.date_diff
        };
        let raw_unit = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let unit = match IntervalUnit::parse(raw_unit) {
            Some(unit) => unit.argument(target.dialect),
            None => raw_unit.to_string(),
        };
        format!("{}({}, ", function, unit)
    });
    Ok(out.into_owned())
}

/// 6. `ISNULL`/`COALESCE` <-> `Nz`. Going into Access, `ISNULL(SUM(x), d)` becomes
/// `SUM(Nz(x, d))`.
pub fn null_coalesce(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let target = ctx.target.null_coalesce;
    match ctx.target.dialect {
        Dialect::Access => rewrite_calls(sql, &COALESCE_CALL_RE, &|name, args| {
            let is_coalesce = name.eq_ignore_ascii_case("COALESCE");
            if args.len() != 2 {
                return None;
            }
            if let Some((aggregate, inner)) = unwrap_aggregate(&args[0]) {
                return Some(format!("{}({}({}, {}))", aggregate, target, inner, args[1]));
            }
            if is_coalesce || name.eq_ignore_ascii_case("ISNULL") {
                return Some(format!("{}({}, {})", target, args[0], args[1]));
            }
            None
        }),
        Dialect::SqlServer => rewrite_calls(sql, &NZ_CALL_RE, &|_, args| match args.len() {
            1 => Some(format!("{}({}, 0)", target, args[0])),
            2 => Some(format!("{}({}, {})", target, args[0], args[1])),
            _ => None,
        }),
    }
}

fn unwrap_aggregate(expression: &str) -> Option<(&str, &str)> {
    let head = AGGREGATE_RE.captures(expression)?;
    let whole = head.get(0)?;
    let open = whole.end() - 1;
    if matching_paren(expression, open)? != expression.len() - 1 {
        return None;
    }
    let name = head.get(1)?.as_str();
    Some((name, expression[open + 1..expression.len() - 1].trim()))
}

/// 7. Single-branch `CASE WHEN` <-> `IIf`. Multi-branch and nested CASE are left alone.
pub fn inline_conditional(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    match ctx.target.inline_if {
        Some(iif) => {
            let out = CASE_RE.replace_all(sql, |caps: &Captures<'_>| {
                let condition = &caps[1];
                let then = &caps[2];
                let otherwise = caps.get(3).map(|m| m.as_str()).unwrap_or("Null");
                if [condition, then, otherwise]
                    .iter()
                    .any(|part| NESTED_CASE_RE.is_match(part))
                {
                    return caps[0].to_string();
                }
                format!("{}({}, {}, {})", iif, condition.trim(), then.trim(), otherwise.trim())
            });
            Ok(out.into_owned())
        }
        None => rewrite_calls(sql, &IIF_CALL_RE, &|_, args| {
            if args.len() != 3 {
                return None;
            }
            Some(format!("CASE WHEN {} THEN {} ELSE {} END", args[0], args[1], args[2]))
        }),
    }
}

/// 8. `DATEPART(year, x)` <-> `Year(x)`, likewise month and day. Other parts keep the
/// generic extract function in the target spelling.
pub fn date_part(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let target = ctx.target;
    match target.dialect {
        Dialect::Access => rewrite_calls(sql, &DATEPART_CALL_RE, &|_, args| {
            if args.len() != 2 {
                return None;
            }
            let unit = IntervalUnit::parse(&args[0])?;
            let standalone = match unit {
                IntervalUnit::Year => target.year_function,
                IntervalUnit::Month => target.month_function,
                IntervalUnit::Day => target.day_function,
                _ => None,
            };
            Some(match standalone {
                Some(function) => format!("{}({})", function, args[1]),
                None => format!("{}({}, {})", target.date_part, unit.argument(target.dialect), args[1]),
            })
        }),
        Dialect::SqlServer => rewrite_calls(sql, &PART_FUNCTION_CALL_RE, &|name, args| {
            let (unit, operand) = match (name.to_ascii_lowercase().as_str(), args.len()) {
                ("year", 1) => (IntervalUnit::Year, &args[0]),
                ("month", 1) => (IntervalUnit::Month, &args[0]),
                ("day", 1) => (IntervalUnit::Day, &args[0]),
                ("datepart", 2) => (IntervalUnit::parse(&args[0])?, &args[1]),
                _ => return None,
            };
            Some(format!("{}({}, {})", target.date_part, unit.argument(target.dialect), operand))
        }),
    }
}

/// 9. `UPPER`/`LOWER` <-> `UCase`/`LCase`.
pub fn string_case(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let (upper_re, lower_re): (&Regex, &Regex) = match ctx.target.dialect {
        Dialect::Access => (&UPPER_RE, &LOWER_RE),
        Dialect::SqlServer => (&UCASE_RE, &LCASE_RE),
    };
    let upper = format!("{}(", ctx.target.upper_function);
    let lower = format!("{}(", ctx.target.lower_function);
    let out = upper_re.replace_all(sql, upper.as_str());
    let out = lower_re.replace_all(&out, lower.as_str());
    Ok(out.into_owned())
}

/// 10. Point the `FROM` table at a catalog entry when it does not exist there.
pub fn table_repair(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let Some(catalog) = ctx.catalog.filter(|catalog| !catalog.is_empty()) else {
        return Ok(sql.to_string());
    };
    let Some(table) = FROM_TABLE_RE.captures(sql).and_then(|caps| caps.get(1)) else {
        return Ok(sql.to_string());
    };
    let reference = table.as_str();
    let bare = bare_table_name(reference);
    if catalog.contains(bare) {
        return Ok(sql.to_string());
    }

    let wanted = bare.to_lowercase();
    let replacement = catalog
        .tables
        .iter()
        .filter(|candidate| {
            let name = candidate.name.to_lowercase();
            name.contains(&wanted) || wanted.contains(&name)
        })
        .fold(None::<(&str, f64)>, |best, candidate| {
            let score = similarity_ratio(bare, &candidate.name);
            match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((candidate.name.as_str(), score)),
            }
        })
        .map(|(name, _)| name)
        .or_else(|| catalog.first().map(|first| first.name.as_str()));
    let Some(replacement) = replacement else {
        return Ok(sql.to_string());
    };

    tracing::debug!(from = %bare, to = %replacement, "repaired table reference");
    Ok(substitute_from_table(sql, replacement).unwrap_or_else(|| sql.to_string()))
}

/// 11. Inventory tables only count rows that still have stock on hand.
pub fn inventory_guard(sql: &str, ctx: &TranslationContext<'_>) -> RuleResult {
    let Some(table) = FROM_TABLE_RE.captures(sql).and_then(|caps| caps.get(1)) else {
        return Ok(sql.to_string());
    };
    let bare = bare_table_name(table.as_str()).to_lowercase();
    if !INVENTORY_FAMILY.iter().any(|family| bare.contains(family)) {
        return Ok(sql.to_string());
    }

    let normalized = normalize_identifier(sql);
    let already_guarded = [ctx.source.stock_column, ctx.target.stock_column]
        .iter()
        .any(|column| normalized.contains(&normalize_identifier(column)));
    if already_guarded {
        return Ok(sql.to_string());
    }

    let predicate = format!("{} > 0", ctx.target.stock_column);
    let body = sql.trim_end().trim_end_matches(';').trim_end();
    let where_at = find_top_level_keyword(body, table.start(), "WHERE");
    let scan_from = where_at.unwrap_or(table.start());
    let tail_at = ["GROUP", "ORDER", "HAVING", "UNION"]
        .iter()
        .filter_map(|keyword| find_top_level_keyword(body, scan_from, keyword))
        .min();

    // The existing condition is parenthesized so an `OR` in it cannot bypass the guard.
    if let Some(where_at) = where_at {
        let condition_end = tail_at.unwrap_or(body.len());
        let condition = body[where_at + "WHERE".len()..condition_end].trim();
        let tail = &body[condition_end..];
        return Ok(if tail.is_empty() {
            format!("{}WHERE {} AND ({})", &body[..where_at], predicate, condition)
        } else {
            format!("{}WHERE {} AND ({}) {}", &body[..where_at], predicate, condition, tail)
        });
    }

    Ok(match tail_at {
        Some(at) => format!("{}WHERE {} {}", &body[..at], predicate, &body[at..]),
        None => format!("{} WHERE {}", body, predicate),
    })
}

fn normalize_identifier(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != '[' && *c != ']')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{ACCESS, SQL_SERVER};

    fn to_access() -> TranslationContext<'static> {
        TranslationContext {
            source: &SQL_SERVER,
            target: &ACCESS,
            catalog: None,
        }
    }

    fn to_sql_server() -> TranslationContext<'static> {
        TranslationContext {
            source: &ACCESS,
            target: &SQL_SERVER,
            catalog: None,
        }
    }

    #[test]
    fn value_alias_only_touches_first_expression() {
        let ctx = to_access();
        assert_eq!(
            value_alias("SELECT SUM(a), COUNT(*) FROM t", &ctx).unwrap(),
            "SELECT SUM(a) AS value, COUNT(*) FROM t"
        );
        assert_eq!(
            value_alias("SELECT TOP 1 total FROM t", &ctx).unwrap(),
            "SELECT TOP 1 total AS value FROM t"
        );
        assert_eq!(
            value_alias("SELECT COUNT(*) as Value FROM t", &ctx).unwrap(),
            "SELECT COUNT(*) as Value FROM t"
        );
        assert_eq!(value_alias("SELECT * FROM t", &ctx).unwrap(), "SELECT * FROM t");
        assert_eq!(
            value_alias("SELECT CASE WHEN a > 0 THEN 1 ELSE 0 END FROM t", &ctx).unwrap(),
            "SELECT CASE WHEN a > 0 THEN 1 ELSE 0 END AS value FROM t"
        );
        assert_eq!(value_alias("SELECT 42", &ctx).unwrap(), "SELECT 42 AS value");
    }

    #[test]
    fn value_alias_renames_an_existing_alias() {
        let ctx = to_sql_server();
        assert_eq!(
            value_alias("SELECT SUM(Total) AS Revenue FROM dbo.Orders", &ctx).unwrap(),
            "SELECT SUM(Total) AS value FROM dbo.Orders"
        );
        assert_eq!(
            value_alias("SELECT SUM(x) Revenue, COUNT(*) n FROM t", &ctx).unwrap(),
            "SELECT SUM(x) AS value, COUNT(*) n FROM t"
        );
        assert_eq!(
            value_alias("SELECT COUNT(*) AS [Open Orders] FROM t", &ctx).unwrap(),
            "SELECT COUNT(*) AS value FROM t"
        );
        assert_eq!(
            value_alias("SELECT o.Total [Order Total] FROM t o", &ctx).unwrap(),
            "SELECT o.Total AS value FROM t o"
        );
        assert_eq!(
            value_alias("SELECT a - b FROM t", &ctx).unwrap(),
            "SELECT a - b AS value FROM t"
        );
    }

    #[test]
    fn schema_prefix_added_and_stripped() {
        assert_eq!(
            schema_qualification("SELECT a FROM Orders", &to_sql_server()).unwrap(),
            "SELECT a FROM dbo.Orders"
        );
        assert_eq!(
            schema_qualification("SELECT a FROM sales.Orders", &to_sql_server()).unwrap(),
            "SELECT a FROM sales.Orders"
        );
        assert_eq!(
            schema_qualification("SELECT a FROM dbo.Orders", &to_access()).unwrap(),
            "SELECT a FROM Orders"
        );
        assert_eq!(
            schema_qualification("SELECT a FROM [dbo].[Order Details]", &to_access()).unwrap(),
            "SELECT a FROM [Order Details]"
        );
    }

    #[test]
    fn lock_hint_follows_alias() {
        assert_eq!(
            lock_hint("SELECT a FROM dbo.Orders o WHERE o.x = 1", &to_sql_server()).unwrap(),
            "SELECT a FROM dbo.Orders o WITH (NOLOCK) WHERE o.x = 1"
        );
        assert_eq!(
            lock_hint("SELECT a FROM dbo.Orders WHERE x = 1", &to_sql_server()).unwrap(),
            "SELECT a FROM dbo.Orders WITH (NOLOCK) WHERE x = 1"
        );
        let hinted = "SELECT a FROM dbo.Orders WITH (NOLOCK)";
        assert_eq!(lock_hint(hinted, &to_sql_server()).unwrap(), hinted);
        assert_eq!(lock_hint(hinted, &to_access()).unwrap(), "SELECT a FROM dbo.Orders");
    }

    #[test]
    fn current_timestamp_alias_only_into_access() {
        assert_eq!(
            current_timestamp("SELECT GETDATE(), CURRENT_TIMESTAMP", &to_access()).unwrap(),
            "SELECT Now(), Now()"
        );
        assert_eq!(
            current_timestamp("SELECT now( ), CURRENT_TIMESTAMP", &to_sql_server()).unwrap(),
            "SELECT GETDATE(), CURRENT_TIMESTAMP"
        );
    }

    #[test]
    fn date_arithmetic_maps_units() {
        assert_eq!(
            date_arithmetic("WHERE d >= DATEADD(day, -30, Now())", &to_access()).unwrap(),
            "WHERE d >= DateAdd('d', -30, Now())"
        );
        assert_eq!(
            date_arithmetic("SELECT DateDiff('ww', a, b)", &to_sql_server()).unwrap(),
            "SELECT DATEDIFF(week, a, b)"
        );
        assert_eq!(
            date_arithmetic("SELECT DATEADD(fortnight, 1, x)", &to_access()).unwrap(),
            "SELECT DateAdd(fortnight, 1, x)"
        );
    }

    #[test]
    fn null_coalesce_unwraps_aggregates_into_access() {
        assert_eq!(
            null_coalesce("SELECT ISNULL(SUM(Total), 0) FROM t", &to_access()).unwrap(),
            "SELECT SUM(Nz(Total, 0)) FROM t"
        );
        assert_eq!(
            null_coalesce("SELECT COALESCE(a, 'n/a'), ISNULL(b, 1)", &to_access()).unwrap(),
            "SELECT Nz(a, 'n/a'), Nz(b, 1)"
        );
        assert_eq!(
            null_coalesce("SELECT COALESCE(a, b, c)", &to_access()).unwrap(),
            "SELECT COALESCE(a, b, c)"
        );
        assert_eq!(
            null_coalesce("SELECT Nz(a), nz(b, 2)", &to_sql_server()).unwrap(),
            "SELECT ISNULL(a, 0), ISNULL(b, 2)"
        );
    }

    #[test]
    fn inline_conditional_round_trips_single_branch() {
        assert_eq!(
            inline_conditional("SUM(CASE WHEN x > 0 THEN x ELSE 0 END)", &to_access()).unwrap(),
            "SUM(IIf(x > 0, x, 0))"
        );
        assert_eq!(
            inline_conditional("SUM(IIf(x > 0, x, 0))", &to_sql_server()).unwrap(),
            "SUM(CASE WHEN x > 0 THEN x ELSE 0 END)"
        );
        let multi = "CASE WHEN a THEN 1 WHEN b THEN 2 ELSE 3 END";
        assert_eq!(inline_conditional(multi, &to_access()).unwrap(), multi);
    }

    #[test]
    fn date_part_maps_to_standalone_functions() {
        assert_eq!(
            date_part("WHERE DATEPART(year, d) = 2024 AND DATEPART(quarter, d) = 1", &to_access())
                .unwrap(),
            "WHERE Year(d) = 2024 AND DatePart('q', d) = 1"
        );
        assert_eq!(
            date_part("WHERE Month(d) = 3 AND DatePart('q', d) = 1", &to_sql_server()).unwrap(),
            "WHERE DATEPART(month, d) = 3 AND DATEPART(quarter, d) = 1"
        );
    }

    #[test]
    fn string_case_functions_swap() {
        assert_eq!(
            string_case("SELECT UPPER(a), lower(b)", &to_access()).unwrap(),
            "SELECT UCase(a), LCase(b)"
        );
        assert_eq!(
            string_case("SELECT UCase(a), LCase(b)", &to_sql_server()).unwrap(),
            "SELECT UPPER(a), LOWER(b)"
        );
    }

    #[test]
    fn table_repair_prefers_substring_then_first_entry() {
        let catalog = TableCatalog::from_names(["Customers", "tblOrders", "OrderLines"]);
        let ctx = TranslationContext {
            source: &ACCESS,
            target: &SQL_SERVER,
            catalog: Some(&catalog),
        };
        assert_eq!(
            table_repair("SELECT a FROM dbo.Orders WHERE 1 = 1", &ctx).unwrap(),
            "SELECT a FROM dbo.tblOrders WHERE 1 = 1"
        );
        assert_eq!(
            table_repair("SELECT a FROM Invoices", &ctx).unwrap(),
            "SELECT a FROM Customers"
        );
        assert_eq!(
            table_repair("SELECT a FROM customers", &ctx).unwrap(),
            "SELECT a FROM customers"
        );
        assert_eq!(
            table_repair("SELECT a FROM Invoices", &to_access()).unwrap(),
            "SELECT a FROM Invoices"
        );
    }

    #[test]
    fn inventory_guard_inserts_predicate() {
        assert_eq!(
            inventory_guard("SELECT COUNT(*) FROM dbo.Inventory WHERE Site = 'A'", &to_sql_server())
                .unwrap(),
            "SELECT COUNT(*) FROM dbo.Inventory WHERE QtyOnHand > 0 AND (Site = 'A')"
        );
        assert_eq!(
            inventory_guard("SELECT COUNT(*) FROM InventoryItems GROUP BY Site", &to_access()).unwrap(),
            "SELECT COUNT(*) FROM InventoryItems WHERE [Qty On Hand] > 0 GROUP BY Site"
        );
        assert_eq!(
            inventory_guard("SELECT COUNT(*) FROM Inventory;", &to_sql_server()).unwrap(),
            "SELECT COUNT(*) FROM Inventory WHERE QtyOnHand > 0"
        );
        let guarded = "SELECT COUNT(*) FROM Inventory WHERE [Qty On Hand] > 0";
        assert_eq!(inventory_guard(guarded, &to_sql_server()).unwrap(), guarded);
        let other = "SELECT COUNT(*) FROM Orders";
        assert_eq!(inventory_guard(other, &to_sql_server()).unwrap(), other);
    }

    #[test]
    fn inventory_guard_keeps_or_conditions_inside_the_guard() {
        assert_eq!(
            inventory_guard(
                "SELECT COUNT(*) FROM dbo.Inventory WHERE Site = 'A' OR Site = 'B' ORDER BY 1",
                &to_sql_server()
            )
            .unwrap(),
            "SELECT COUNT(*) FROM dbo.Inventory WHERE QtyOnHand > 0 AND (Site = 'A' OR Site = 'B') ORDER BY 1"
        );
        assert_eq!(
            inventory_guard(
                "SELECT SUM(Qty) FROM StockLevels WHERE Bin IN (SELECT Bin FROM Bins WHERE a = 1 OR b = 2)",
                &to_access()
            )
            .unwrap(),
            "SELECT SUM(Qty) FROM StockLevels WHERE [Qty On Hand] > 0 AND \
             (Bin IN (SELECT Bin FROM Bins WHERE a = 1 OR b = 2))"
        );
    }
}
