use super::rules::{TranslationContext, RULES};
use super::{profile, DialectProfile};
use crate::models::TableCatalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub sql: String,
    pub applied_rules: Vec<&'static str>,
}

/// Adapts `sql` to `target`. Never fails: a rule that errors is skipped and the
/// partially rewritten text is carried forward. The result is best effort and
/// unusual SQL shapes may come out wrong.
pub fn adapt(sql: &str, target: &DialectProfile, catalog: Option<&TableCatalog>) -> String {
    adapt_with_report(sql, target, catalog).sql
}

pub fn adapt_with_report(
    sql: &str,
    target: &DialectProfile,
    catalog: Option<&TableCatalog>,
) -> Translation {
    let ctx = TranslationContext {
        source: profile(target.dialect.other()),
        target: profile(target.dialect),
        catalog,
    };

    let mut current = sql.to_string();
    let mut applied_rules = Vec::new();
    if current.trim().is_empty() {
        return Translation {
            sql: current,
            applied_rules,
        };
    }

    for rule in RULES.iter() {
        match (rule.apply)(&current, &ctx) {
            Ok(next) => {
                if next != current {
                    applied_rules.push(rule.name);
                    current = next;
                }
            }
            Err(error) => {
                tracing::debug!(rule = rule.name, error = %error, "translation rule skipped");
            }
        }
    }

    Translation {
        sql: current,
        applied_rules,
    }
}

#[cfg(test)]
mod tests {
    use super::{adapt, adapt_with_report};
    use crate::dialect::{ACCESS, SQL_SERVER};
    use crate::models::TableCatalog;

    const SQL_SERVER_QUERY: &str = "SELECT ISNULL(SUM(o.Total), 0) AS value FROM dbo.Orders o WITH (NOLOCK) \
         WHERE o.OrderDate >= DATEADD(day, -30, GETDATE()) AND UPPER(o.Status) = 'OPEN'";

    #[test]
    fn translates_sql_server_query_into_access() {
        let access = adapt(SQL_SERVER_QUERY, &ACCESS, None);
        assert_eq!(
            access,
            "SELECT SUM(Nz(o.Total, 0)) AS value FROM Orders o \
             WHERE o.OrderDate >= DateAdd('d', -30, Now()) AND UCase(o.Status) = 'OPEN'"
        );
    }

    #[test]
    fn round_trip_restores_schema_and_lock_hint() {
        let access = adapt(SQL_SERVER_QUERY, &ACCESS, None);
        let back = adapt(&access, &SQL_SERVER, None);
        assert!(back.contains("FROM dbo.Orders o WITH (NOLOCK) WHERE"), "{}", back);
        assert!(back.contains("DATEADD(day, -30, GETDATE())"), "{}", back);
        // Aggregate unwrapping does not round-trip to the original shape.
        assert!(back.contains("SUM(ISNULL(o.Total, 0))"), "{}", back);
    }

    #[test]
    fn adapt_is_idempotent() {
        let once = adapt(SQL_SERVER_QUERY, &ACCESS, None);
        assert_eq!(adapt(&once, &ACCESS, None), once);
        let sql_server = adapt(&once, &SQL_SERVER, None);
        assert_eq!(adapt(&sql_server, &SQL_SERVER, None), sql_server);
    }

    #[test]
    fn access_query_gains_alias_schema_and_hint() {
        let report = adapt_with_report(
            "SELECT Count(*) FROM Customers WHERE IIf(Active, 1, 0) = 1",
            &SQL_SERVER,
            None,
        );
        assert_eq!(
            report.sql,
            "SELECT Count(*) AS value FROM dbo.Customers WITH (NOLOCK) \
             WHERE CASE WHEN Active THEN 1 ELSE 0 END = 1"
        );
        assert_eq!(
            report.applied_rules,
            vec!["value-alias", "schema-qualification", "lock-hint", "inline-conditional"]
        );
    }

    #[test]
    fn existing_alias_is_renamed_not_doubled() {
        let sql = "SELECT SUM(Total) AS Revenue FROM dbo.Orders WITH (NOLOCK)";
        let adapted = adapt(sql, &SQL_SERVER, None);
        assert_eq!(adapted, "SELECT SUM(Total) AS value FROM dbo.Orders WITH (NOLOCK)");
        assert_eq!(adapt(&adapted, &SQL_SERVER, None), adapted);

        let access = adapt("SELECT SUM(x) Revenue FROM dbo.Sales", &ACCESS, None);
        assert_eq!(access, "SELECT SUM(x) AS value FROM Sales");
    }

    #[test]
    fn catalog_repair_runs_before_inventory_guard() {
        let catalog = TableCatalog::from_names(["Products", "InventoryItems"]);
        let sql = adapt("SELECT COUNT(*) FROM Inventory", &ACCESS, Some(&catalog));
        assert_eq!(
            sql,
            "SELECT COUNT(*) AS value FROM InventoryItems WHERE [Qty On Hand] > 0"
        );
    }

    #[test]
    fn malformed_sql_is_returned_partially_rewritten() {
        let sql = adapt("SELECT ISNULL(SUM(a), 0 FROM t WHERE d > GETDATE()", &ACCESS, None);
        assert!(sql.contains("Now()"), "{}", sql);
        assert!(sql.contains("ISNULL(SUM(a), 0"), "{}", sql);
    }

    #[test]
    fn empty_sql_passes_through() {
        assert_eq!(adapt("   ", &ACCESS, None), "   ");
    }
}
