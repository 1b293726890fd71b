pub mod rules;
pub mod sqltext;
pub mod translator;

use crate::models::Dialect;

pub use translator::{adapt, adapt_with_report, Translation};

/// Static description of how a backend spells the constructs the translator rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectProfile {
    pub dialect: Dialect,
    pub now_function: &'static str,
    /// Extra spellings of "now" folded into `now_function` when translating into this dialect.
    pub now_aliases: &'static [&'static str],
    pub null_coalesce: &'static str,
    pub schema_prefix: Option<&'static str>,
    pub lock_hint: Option<&'static str>,
    pub date_add: &'static str,
    pub date_diff: &'static str,
    pub date_part: &'static str,
    pub year_function: Option<&'static str>,
    pub month_function: Option<&'static str>,
    pub day_function: Option<&'static str>,
    pub inline_if: Option<&'static str>,
    pub upper_function: &'static str,
    pub lower_function: &'static str,
    pub stock_column: &'static str,
}

pub static SQL_SERVER: DialectProfile = DialectProfile {
    dialect: Dialect::SqlServer,
    now_function: "GETDATE()",
    now_aliases: &[],
    null_coalesce: "ISNULL",
    schema_prefix: Some("dbo."),
    lock_hint: Some("WITH (NOLOCK)"),
    date_add: "DATEADD",
    date_diff: "DATEDIFF",
    date_part: "DATEPART",
    year_function: None,
    month_function: None,
    day_function: None,
    inline_if: None,
    upper_function: "UPPER",
    lower_function: "LOWER",
    stock_column: "QtyOnHand",
};

pub static ACCESS: DialectProfile = DialectProfile {
    dialect: Dialect::Access,
    now_function: "Now()",
    now_aliases: &["CURRENT_TIMESTAMP"],
    null_coalesce: "Nz",
    schema_prefix: None,
    lock_hint: None,
    date_add: "DateAdd",
    date_diff: "DateDiff",
    date_part: "DatePart",
    year_function: Some("Year"),
    month_function: Some("Month"),
    day_function: Some("Day"),
    inline_if: Some("IIf"),
    upper_function: "UCase",
    lower_function: "LCase",
    stock_column: "[Qty On Hand]",
};

pub fn profile(dialect: Dialect) -> &'static DialectProfile {
    match dialect {
        Dialect::SqlServer => &SQL_SERVER,
        Dialect::Access => &ACCESS,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Quarter,
    Year,
    Hour,
    Minute,
    Second,
}

impl IntervalUnit {
    pub const ALL: [IntervalUnit; 8] = [
        Self::Day,
        Self::Week,
        Self::Month,
        Self::Quarter,
        Self::Year,
        Self::Hour,
        Self::Minute,
        Self::Second,
    ];

    pub fn token(self, dialect: Dialect) -> &'static str {
        match dialect {
            Dialect::SqlServer => match self {
                Self::Day => "day",
                Self::Week => "week",
                Self::Month => "month",
                Self::Quarter => "quarter",
                Self::Year => "year",
                Self::Hour => "hour",
                Self::Minute => "minute",
                Self::Second => "second",
            },
            Dialect::Access => match self {
                Self::Day => "d",
                Self::Week => "ww",
                Self::Month => "m",
                Self::Quarter => "q",
                Self::Year => "yyyy",
                Self::Hour => "h",
                Self::Minute => "n",
                Self::Second => "s",
            },
        }
    }

    /// Accepts either vocabulary plus the common T-SQL abbreviations.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim().trim_matches(|c| c == '\'' || c == '"').to_ascii_lowercase();
        let unit = match token.as_str() {
            "day" | "d" | "dd" => Self::Day,
            "week" | "ww" | "wk" => Self::Week,
            "month" | "m" | "mm" => Self::Month,
            "quarter" | "q" | "qq" => Self::Quarter,
            "year" | "yyyy" | "yy" => Self::Year,
            "hour" | "h" | "hh" => Self::Hour,
            "minute" | "n" | "mi" => Self::Minute,
            "second" | "s" | "ss" => Self::Second,
            _ => return None,
        };
        Some(unit)
    }

    /// The unit as it appears as a function argument: quoted for Access, bare for T-SQL.
    pub fn argument(self, dialect: Dialect) -> String {
        match dialect {
            Dialect::SqlServer => self.token(dialect).to_string(),
            Dialect::Access => format!("'{}'", self.token(dialect)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{profile, IntervalUnit};
    use crate::models::Dialect;

    #[test]
    fn interval_units_map_bijectively() {
        for unit in IntervalUnit::ALL {
            let forward = unit.token(Dialect::Access);
            let back = IntervalUnit::parse(forward).expect("access token parses");
            assert_eq!(back.token(Dialect::SqlServer), unit.token(Dialect::SqlServer));

            let original = unit.token(Dialect::SqlServer);
            let there = IntervalUnit::parse(original).expect("sql server token parses");
            assert_eq!(there, unit);
        }
    }

    #[test]
    fn access_arguments_are_quoted() {
        assert_eq!(IntervalUnit::Year.argument(Dialect::Access), "'yyyy'");
        assert_eq!(IntervalUnit::Minute.argument(Dialect::SqlServer), "minute");
        assert_eq!(IntervalUnit::parse("'ww'"), Some(IntervalUnit::Week));
        assert_eq!(IntervalUnit::parse("fortnight"), None);
    }

    #[test]
    fn profiles_are_keyed_by_dialect() {
        assert_eq!(profile(Dialect::SqlServer).schema_prefix, Some("dbo."));
        assert_eq!(profile(Dialect::Access).lock_hint, None);
        assert_eq!(profile(Dialect::Access).null_coalesce, "Nz");
    }
}
