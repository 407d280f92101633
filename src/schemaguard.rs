use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use sqlparser::ast::{
    Expr, Query, SelectItem, SetExpr, Statement, TableFactor, Visit, Visitor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::external::ExternalSchema;
use crate::models::ColumnGrant;
use crate::repo::PermissionStore;

/// Decides whether a generated query may touch a division's slice of the
/// tenant's external database. Validation is reject-only: anything the
/// parser or the permission rows cannot positively account for fails.
pub struct SchemaGuard {
    permissions: Arc<dyn PermissionStore>,
}

impl SchemaGuard {
    pub fn new(permissions: Arc<dyn PermissionStore>) -> Self {
        Self { permissions }
    }

    /// Restricts a requested table/column list to the admissible subset.
    ///
    /// No permission row for the table means no access. A wildcard grant
    /// admits the full current column list from the introspected schema;
    /// otherwise the result is the intersection of requested and granted,
    /// and an empty intersection is a denial.
    pub async fn check(
        &self,
        division_id: Uuid,
        table: &str,
        requested: &[String],
        schema: &ExternalSchema,
    ) -> CoreResult<Vec<String>> {
        let permission = self
            .permissions
            .permission_for_table(division_id, table)
            .await?
            .ok_or(CoreError::PermissionDenied)?;

        let schema_columns = schema.get(table).ok_or(CoreError::PermissionDenied)?;

        if permission.columns.is_wildcard() {
            return Ok(schema_columns.clone());
        }

        let granted: &BTreeSet<String> = match &permission.columns {
            ColumnGrant::Only(columns) => columns,
            // A non-"*" marker string grants nothing.
            ColumnGrant::Wildcard(_) => return Err(CoreError::PermissionDenied),
        };

        let requested_set: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
        let intersection: Vec<String> = schema_columns
            .iter()
            .filter(|column| requested_set.contains(column.as_str()))
            .filter(|column| granted.contains(*column))
            .cloned()
            .collect();

        if intersection.is_empty() {
            return Err(CoreError::PermissionDenied);
        }
        Ok(intersection)
    }

    /// Validates a generated statement end to end: exactly one read-only
    /// SELECT, every referenced table and column covered by the division's
    /// grants. Returns the statement unchanged on success; never rewrites.
    pub async fn validate_statement(
        &self,
        sql: &str,
        division_id: Uuid,
        schema: &ExternalSchema,
    ) -> CoreResult<String> {
        let references = collect_references(sql)?;

        for (table, columns) in &references.columns_by_table {
            // A `*` reference stands for every current column of the table.
            let requested: Vec<String> = if columns.contains("*") {
                schema
                    .get(table)
                    .ok_or(CoreError::PermissionDenied)?
                    .clone()
            } else {
                columns.iter().cloned().collect()
            };
            let allowed = self
                .check(division_id, table, &requested, schema)
                .await?;
            let allowed: BTreeSet<&str> = allowed.iter().map(String::as_str).collect();
            if requested.iter().any(|column| !allowed.contains(column.as_str())) {
                return Err(CoreError::PermissionDenied);
            }
        }

        // Tables referenced without any column (e.g. `SELECT count(*)`)
        // still need a permission row.
        for table in &references.tables {
            if !references.columns_by_table.contains_key(table) {
                self.permissions
                    .permission_for_table(division_id, table)
                    .await?
                    .ok_or(CoreError::PermissionDenied)?;
                schema.get(table).ok_or(CoreError::PermissionDenied)?;
            }
        }

        Ok(sql.to_string())
    }
}

#[derive(Debug, Default)]
pub struct StatementReferences {
    /// Base tables referenced anywhere in the statement (CTE names excluded).
    pub tables: BTreeSet<String>,
    /// Columns attributed to their base table.
    pub columns_by_table: BTreeMap<String, BTreeSet<String>>,
}

/// Parses `sql` and extracts its referenced tables and columns, rejecting
/// anything that is not a single read-only SELECT.
pub fn collect_references(sql: &str) -> CoreResult<StatementReferences> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|err| CoreError::unsafe_query(format!("parse error: {err}")))?;

    if statements.len() != 1 {
        return Err(CoreError::unsafe_query("expected exactly one statement"));
    }

    let statement = &statements[0];
    let query = match statement {
        Statement::Query(query) => query,
        _ => return Err(CoreError::unsafe_query("only SELECT statements are allowed")),
    };

    let mut collector = ReferenceCollector::default();
    if let ControlFlow::Break(reason) = query.visit(&mut collector) {
        return Err(CoreError::unsafe_query(reason));
    }

    collector.finish()
}

/// Walks the query AST accumulating table factors, column expressions,
/// wildcards, and CTE names. Breaks on any construct a read-only SELECT
/// has no business containing.
#[derive(Default)]
struct ReferenceCollector {
    cte_names: BTreeSet<String>,
    // (base table, alias) pairs in visit order
    table_factors: Vec<(String, Option<String>)>,
    qualified_columns: Vec<(String, String)>,
    unqualified_columns: Vec<String>,
    saw_unqualified_wildcard: bool,
    qualified_wildcards: Vec<String>,
}

impl Visitor for ReferenceCollector {
    type Break = String;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            return ControlFlow::Break("locking clauses are not allowed".into());
        }
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(normalize(&cte.alias.name.value));
            }
        }
        if let SetExpr::Select(select) = query.body.as_ref() {
            if select.into.is_some() {
                return ControlFlow::Break("SELECT INTO is not allowed".into());
            }
            for item in &select.projection {
                match item {
                    SelectItem::Wildcard(_) => self.saw_unqualified_wildcard = true,
                    SelectItem::QualifiedWildcard(name, _) => {
                        let qualifier = name
                            .0
                            .last()
                            .map(|ident| normalize(&ident.value))
                            .unwrap_or_default();
                        self.qualified_wildcards.push(qualifier);
                    }
                    SelectItem::UnnamedExpr(_) | SelectItem::ExprWithAlias { .. } => {}
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { name, alias, .. } => {
                let base = match name.0.last() {
                    Some(ident) => normalize(&ident.value),
                    None => return ControlFlow::Break("unnamed table reference".into()),
                };
                let alias = alias.as_ref().map(|a| normalize(&a.name.value));
                self.table_factors.push((base, alias));
                ControlFlow::Continue(())
            }
            TableFactor::Derived { .. } | TableFactor::NestedJoin { .. } => {
                ControlFlow::Continue(())
            }
            _ => ControlFlow::Break("unsupported table construct".into()),
        }
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                self.unqualified_columns.push(normalize(&ident.value));
            }
            Expr::CompoundIdentifier(parts) => {
                if parts.len() < 2 {
                    return ControlFlow::Break("malformed column reference".into());
                }
                let qualifier = normalize(&parts[parts.len() - 2].value);
                let column = normalize(&parts[parts.len() - 1].value);
                self.qualified_columns.push((qualifier, column));
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

impl ReferenceCollector {
    fn finish(self) -> CoreResult<StatementReferences> {
        let mut references = StatementReferences::default();

        // alias (or bare table name) → base table, skipping CTE references
        let mut alias_map: BTreeMap<String, String> = BTreeMap::new();
        for (base, alias) in &self.table_factors {
            if self.cte_names.contains(base) {
                continue;
            }
            references.tables.insert(base.clone());
            alias_map.insert(base.clone(), base.clone());
            if let Some(alias) = alias {
                alias_map.insert(alias.clone(), base.clone());
            }
        }

        let single_table = if references.tables.len() == 1 {
            references.tables.iter().next().cloned()
        } else {
            None
        };

        for (qualifier, column) in &self.qualified_columns {
            match alias_map.get(qualifier) {
                Some(base) => {
                    references
                        .columns_by_table
                        .entry(base.clone())
                        .or_default()
                        .insert(column.clone());
                }
                None if self.cte_names.contains(qualifier) => {}
                None => {
                    return Err(CoreError::unsafe_query(format!(
                        "unknown table qualifier: {qualifier}"
                    )))
                }
            }
        }

        for column in &self.unqualified_columns {
            // Unqualified aliases of projected expressions show up here
            // too when reused in ORDER BY; attributing them to the table
            // is harmless since validation only narrows.
            match &single_table {
                Some(table) => {
                    references
                        .columns_by_table
                        .entry(table.clone())
                        .or_default()
                        .insert(column.clone());
                }
                None if references.tables.is_empty() => {}
                None => {
                    return Err(CoreError::unsafe_query(
                        "ambiguous unqualified column across multiple tables",
                    ))
                }
            }
        }

        let mut wildcard_tables: Vec<String> = Vec::new();
        if self.saw_unqualified_wildcard {
            wildcard_tables.extend(references.tables.iter().cloned());
        }
        for qualifier in &self.qualified_wildcards {
            match alias_map.get(qualifier) {
                Some(base) => wildcard_tables.push(base.clone()),
                None if self.cte_names.contains(qualifier) => {}
                None => {
                    return Err(CoreError::unsafe_query(format!(
                        "unknown table qualifier: {qualifier}"
                    )))
                }
            }
        }
        for table in wildcard_tables {
            references
                .columns_by_table
                .entry(table.clone())
                .or_default()
                .insert("*".to_string());
        }

        Ok(references)
    }
}

fn normalize(identifier: &str) -> String {
    identifier.to_lowercase()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::models::DivisionPermission;

    fn refs(sql: &str) -> StatementReferences {
        collect_references(sql).unwrap()
    }

    /// Fixed grant list standing in for the permission table.
    struct StaticPermissions(Vec<DivisionPermission>);

    #[async_trait]
    impl PermissionStore for StaticPermissions {
        async fn permission_for_table(
            &self,
            division_id: Uuid,
            table: &str,
        ) -> anyhow::Result<Option<DivisionPermission>> {
            Ok(self
                .0
                .iter()
                .find(|row| row.division_id == division_id && row.table_name == table)
                .cloned())
        }

        async fn list_for_division(
            &self,
            division_id: Uuid,
        ) -> anyhow::Result<Vec<DivisionPermission>> {
            Ok(self
                .0
                .iter()
                .filter(|row| row.division_id == division_id)
                .cloned()
                .collect())
        }

        async fn upsert(
            &self,
            _division_id: Uuid,
            _table: &str,
            _columns: ColumnGrant,
        ) -> anyhow::Result<DivisionPermission> {
            unreachable!("grants are fixed in these tests")
        }

        async fn delete(&self, _id: Uuid) -> anyhow::Result<bool> {
            unreachable!("grants are fixed in these tests")
        }
    }

    fn grant(division_id: Uuid, table: &str, columns: ColumnGrant) -> DivisionPermission {
        DivisionPermission {
            id: Uuid::new_v4(),
            division_id,
            table_name: table.to_string(),
            columns,
        }
    }

    fn guard_with(rows: Vec<DivisionPermission>) -> SchemaGuard {
        SchemaGuard::new(Arc::new(StaticPermissions(rows)))
    }

    fn sales_schema() -> ExternalSchema {
        let mut schema = ExternalSchema::new();
        schema.insert(
            "sales".to_string(),
            vec!["id".to_string(), "amount".to_string(), "region".to_string()],
        );
        schema
    }

    #[tokio::test]
    async fn column_grant_narrows_to_the_intersection() {
        let division = Uuid::new_v4();
        let guard = guard_with(vec![grant(
            division,
            "sales",
            ColumnGrant::only(["amount", "region"]),
        )]);
        let allowed = guard
            .check(
                division,
                "sales",
                &["id".to_string(), "amount".to_string()],
                &sales_schema(),
            )
            .await
            .unwrap();
        assert_eq!(allowed, vec!["amount".to_string()]);
    }

    #[tokio::test]
    async fn empty_intersection_is_denied() {
        let division = Uuid::new_v4();
        let guard = guard_with(vec![grant(division, "sales", ColumnGrant::only(["region"]))]);
        let err = guard
            .check(division, "sales", &["amount".to_string()], &sales_schema())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied));
    }

    #[tokio::test]
    async fn wildcard_grant_admits_every_schema_column() {
        let division = Uuid::new_v4();
        let guard = guard_with(vec![grant(division, "sales", ColumnGrant::all())]);
        let allowed = guard
            .check(division, "sales", &["id".to_string()], &sales_schema())
            .await
            .unwrap();
        assert_eq!(
            allowed,
            vec!["id".to_string(), "amount".to_string(), "region".to_string()]
        );
    }

    #[tokio::test]
    async fn statement_touching_ungranted_column_is_rejected() {
        let division = Uuid::new_v4();
        let guard = guard_with(vec![grant(
            division,
            "sales",
            ColumnGrant::only(["amount", "region"]),
        )]);
        let err = guard
            .validate_statement("SELECT amount, id FROM sales", division, &sales_schema())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied));
    }

    #[tokio::test]
    async fn statement_within_grant_passes_unchanged() {
        let division = Uuid::new_v4();
        let guard = guard_with(vec![grant(
            division,
            "sales",
            ColumnGrant::only(["amount", "region"]),
        )]);
        let sql = "SELECT amount FROM sales WHERE region = 'EU'";
        let validated = guard
            .validate_statement(sql, division, &sales_schema())
            .await
            .unwrap();
        assert_eq!(validated, sql);
    }

    #[test]
    fn collects_single_table_and_columns() {
        let references = refs("SELECT amount, region FROM sales WHERE region = 'EU'");
        assert!(references.tables.contains("sales"));
        let columns = &references.columns_by_table["sales"];
        assert!(columns.contains("amount"));
        assert!(columns.contains("region"));
    }

    #[test]
    fn rejects_multiple_statements() {
        let err = collect_references("SELECT 1; DROP TABLE sales").unwrap_err();
        assert!(matches!(err, CoreError::UnsafeQuery { .. }));
    }

    #[test]
    fn rejects_dml() {
        for sql in [
            "DELETE FROM sales",
            "UPDATE sales SET amount = 0",
            "INSERT INTO sales VALUES (1)",
            "DROP TABLE sales",
            "CREATE TABLE t (id int)",
        ] {
            let err = collect_references(sql).unwrap_err();
            assert!(matches!(err, CoreError::UnsafeQuery { .. }), "{sql}");
        }
    }

    #[test]
    fn rejects_select_into() {
        let err = collect_references("SELECT amount INTO backup FROM sales").unwrap_err();
        assert!(matches!(err, CoreError::UnsafeQuery { .. }));
    }

    #[test]
    fn rejects_locking_clause() {
        let err = collect_references("SELECT amount FROM sales FOR UPDATE").unwrap_err();
        assert!(matches!(err, CoreError::UnsafeQuery { .. }));
    }

    #[test]
    fn rejects_comment_smuggled_second_statement() {
        let err =
            collect_references("SELECT 1 /* hide */ ; DELETE FROM sales -- gone").unwrap_err();
        assert!(matches!(err, CoreError::UnsafeQuery { .. }));
    }

    #[test]
    fn rejects_ambiguous_unqualified_columns_across_joins() {
        let err = collect_references(
            "SELECT amount FROM sales JOIN refunds ON sales.id = refunds.sale_id",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnsafeQuery { .. }));
    }

    #[test]
    fn resolves_alias_qualified_columns() {
        let references =
            refs("SELECT s.amount, r.reason FROM sales s JOIN refunds r ON s.id = r.sale_id");
        assert!(references.columns_by_table["sales"].contains("amount"));
        assert!(references.columns_by_table["refunds"].contains("reason"));
    }

    #[test]
    fn subquery_tables_are_collected() {
        let references =
            refs("SELECT total FROM (SELECT sum(amount) AS total FROM sales) t");
        assert!(references.tables.contains("sales"));
    }

    #[test]
    fn cte_names_are_not_base_tables() {
        let references = refs(
            "WITH recent AS (SELECT amount FROM sales) SELECT amount FROM recent",
        );
        assert!(references.tables.contains("sales"));
        assert!(!references.tables.contains("recent"));
    }

    #[test]
    fn wildcard_marks_all_columns() {
        let references = refs("SELECT * FROM sales");
        assert!(references.columns_by_table["sales"].contains("*"));
    }

    #[test]
    fn count_star_references_table_without_columns() {
        let references = refs("SELECT count(*) FROM sales");
        assert!(references.tables.contains("sales"));
    }
}
