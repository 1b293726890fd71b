//! Turns raw query results into display strings.

use crate::models::MetricRow;
use serde_json::Value;

/// 1 = no query defined, 2 = failed before execution, 3 = empty result set.
const SENTINELS: [i64; 3] = [1, 2, 3];

const PERCENT_KEYWORDS: &[&str] = &["percent", "%", "rate", "ratio", "margin", "conversion", "pct"];
const CURRENCY_KEYWORDS: &[&str] = &[
    "revenue", "sales", "cost", "price", "amount", "spend", "profit", "income", "dollar", "$",
];
const COUNT_KEYWORDS: &[&str] = &["count", "number", "qty", "quantity", "units", "orders", "#"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub display: String,
    /// The previous value was kept over a zero result.
    pub preserved: bool,
}

impl Formatted {
    fn fresh(display: String) -> Self {
        Self {
            display,
            preserved: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Currency,
    Percentage,
    Count,
    Plain,
}

impl Category {
    /// Percent keywords win over currency ones so "Sales Margin" reads as a percentage.
    pub fn classify(label: &str) -> Self {
        let label = label.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|keyword| label.contains(keyword));
        if has_any(PERCENT_KEYWORDS) {
            Self::Percentage
        } else if has_any(CURRENCY_KEYWORDS) {
            Self::Currency
        } else if has_any(COUNT_KEYWORDS) {
            Self::Count
        } else {
            Self::Plain
        }
    }
}

pub fn format(raw: &Value, row: &MetricRow) -> Formatted {
    let number = match numeric(raw) {
        Ok(number) => number,
        Err(verbatim) => return Formatted::fresh(verbatim),
    };

    if is_sentinel(number) && row.value.as_deref().map_or(true, is_sentinel_text) {
        return Formatted::fresh((number as i64).to_string());
    }

    if number == 0.0 {
        if let Some(previous) = row.value.as_deref().filter(|prior| is_non_zero_display(prior)) {
            return Formatted {
                display: previous.to_string(),
                preserved: true,
            };
        }
    }

    let display = match Category::classify(&row.label()) {
        Category::Currency => currency(number),
        Category::Percentage => percentage(number),
        Category::Count => whole(number.round()),
        Category::Plain if number.fract() == 0.0 => whole(number),
        Category::Plain => format!("{:.2}", number),
    };
    Formatted::fresh(display)
}

/// Numeric payloads (including numeric strings and null as zero), or the verbatim text.
fn numeric(raw: &Value) -> Result<f64, String> {
    match raw {
        Value::Null => Ok(0.0),
        Value::Bool(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        Value::Number(number) => number.as_f64().ok_or_else(|| number.to_string()),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite())
            .ok_or_else(|| text.clone()),
        other => Err(other.to_string()),
    }
}

fn is_sentinel(number: f64) -> bool {
    number.fract() == 0.0 && SENTINELS.contains(&(number as i64))
}

fn is_sentinel_text(text: &str) -> bool {
    text.trim()
        .parse::<i64>()
        .map(|number| SENTINELS.contains(&number))
        .unwrap_or(false)
}

fn is_non_zero_display(text: &str) -> bool {
    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    digits
        .parse::<f64>()
        .map(|number| number != 0.0)
        .unwrap_or(false)
}

fn currency(number: f64) -> String {
    let rounded = number.round();
    let sign = if rounded < 0.0 { "-" } else { "" };
    format!("{}${}", sign, group_thousands(rounded.abs() as u64))
}

/// Fractions in `[-1, 1]` are scaled; larger values are taken as already scaled.
fn percentage(number: f64) -> String {
    let scaled = if number.abs() <= 1.0 { number * 100.0 } else { number };
    format!("{:.1}%", scaled)
}

fn whole(number: f64) -> String {
    let value = number as i64;
    value.to_string()
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            out.push(',');
        }
        out.push(digit);
    }
    out
}
