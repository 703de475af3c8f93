//! Dataset introspection through the warehouse's information schema.

use crate::error::{WarehouseError, WarehouseResult};
use crate::runner::QueryRunner;
use crate::warehouse::{QueryParameter, Row};

/// One column as reported by the information schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub table_name: String,
    pub column_name: String,
    /// 1-based position of the column in its table.
    pub ordinal_position: i64,
    pub is_nullable: bool,
    pub data_type: String,
}

impl ColumnMetadata {
    fn from_row(row: &Row) -> WarehouseResult<Self> {
        let text = |column: &str| {
            row.get_string(column).ok_or_else(|| {
                WarehouseError::Decode(format!("catalog row has no '{}' value", column))
            })
        };
        let ordinal_position = row.get_i64("ordinal_position").ok_or_else(|| {
            WarehouseError::Decode("catalog row has no 'ordinal_position' value".to_string())
        })?;
        Ok(Self {
            table_name: text("table_name")?,
            column_name: text("column_name")?,
            ordinal_position,
            is_nullable: text("is_nullable")?.eq_ignore_ascii_case("YES"),
            data_type: text("data_type")?,
        })
    }
}

/// Read-only catalog queries, run (and costed) through a [`QueryRunner`].
#[derive(Debug, Clone)]
pub struct SchemaIntrospector {
    runner: QueryRunner,
}

impl SchemaIntrospector {
    pub fn new(runner: QueryRunner) -> Self {
        Self { runner }
    }

    fn scope(&self, project: &str, dataset: &str) -> (String, Vec<QueryParameter>) {
        let dialect = self.runner.warehouse().dialect();
        let filter = format!(
            "FROM {} WHERE table_catalog = {} AND table_schema = {}",
            dialect.columns_relation(project, dataset),
            dialect.parameter("project"),
            dialect.parameter("dataset"),
        );
        let params = vec![
            QueryParameter::string("project", project),
            QueryParameter::string("dataset", dataset),
        ];
        (filter, params)
    }

    /// Names of the tables in `project.dataset`, sorted.
    pub async fn list_tables(&self, project: &str, dataset: &str) -> WarehouseResult<Vec<String>> {
        let (scope, params) = self.scope(project, dataset);
        let sql = format!("SELECT DISTINCT table_name {} ORDER BY table_name", scope);

        let mut tables = Vec::new();
        for row in self.runner.run_query_rows(&sql, &params).await? {
            let row = row?;
            if let Some(name) = row.get_string("table_name") {
                tables.push(name);
            }
        }
        Ok(tables)
    }

    /// Columns of `project.dataset.table` in ordinal order. An unknown table
    /// yields an empty list.
    pub async fn list_columns(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> WarehouseResult<Vec<ColumnMetadata>> {
        let dialect = self.runner.warehouse().dialect();
        let (scope, mut params) = self.scope(project, dataset);
        let sql = format!(
            "SELECT table_name, column_name, ordinal_position, is_nullable, data_type {} \
             AND table_name = {} ORDER BY ordinal_position",
            scope,
            dialect.parameter("table_name"),
        );
        params.push(QueryParameter::string("table_name", table));

        self.runner
            .run_query_rows(&sql, &params)
            .await?
            .map(|row| ColumnMetadata::from_row(&row?))
            .collect()
    }
}
