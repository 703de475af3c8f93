//! Warehouse abstraction.
//!
//! Every warehouse call in the crate goes through the [`Warehouse`] trait so
//! the runner, loader and introspector are independent of the backend. Two
//! backends ship with the crate: [`BigQueryWarehouse`] talks to the BigQuery
//! REST API and [`LocalWarehouse`] runs everything in-process on DataFusion.

pub mod bigquery;
pub mod local;

pub use bigquery::BigQueryWarehouse;
pub use local::LocalWarehouse;

use crate::error::{WarehouseError, WarehouseResult};
use arrow::array::Array;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::scalar::ScalarValue;
use serde::Deserialize;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// `(project, dataset, table)` address of a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Typed scalar bound to a named query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
}

impl ParameterValue {
    /// Warehouse type name of the value.
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::String(_) => "STRING",
            ParameterValue::Int64(_) => "INT64",
            ParameterValue::Float64(_) => "FLOAT64",
            ParameterValue::Bool(_) => "BOOL",
        }
    }

    /// Value rendered the way the warehouse API expects it.
    pub fn to_api_string(&self) -> String {
        match self {
            ParameterValue::String(s) => s.clone(),
            ParameterValue::Int64(v) => v.to_string(),
            ParameterValue::Float64(v) => v.to_string(),
            ParameterValue::Bool(v) => v.to_string(),
        }
    }

    pub fn to_scalar(&self) -> ScalarValue {
        match self {
            ParameterValue::String(s) => ScalarValue::Utf8(Some(s.clone())),
            ParameterValue::Int64(v) => ScalarValue::Int64(Some(*v)),
            ParameterValue::Float64(v) => ScalarValue::Float64(Some(*v)),
            ParameterValue::Bool(v) => ScalarValue::Boolean(Some(*v)),
        }
    }
}

/// Named scalar query parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub name: String,
    pub value: ParameterValue,
}

impl QueryParameter {
    pub fn new(name: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, ParameterValue::String(value.into()))
    }

    pub fn int64(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, ParameterValue::Int64(value))
    }

    pub fn float64(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, ParameterValue::Float64(value))
    }

    pub fn bool(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, ParameterValue::Bool(value))
    }
}

impl fmt::Display for QueryParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} = {}",
            self.name,
            self.value.type_name(),
            self.value.to_api_string()
        )
    }
}

/// Resource usage reported for a finished query job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatistics {
    pub bytes_processed: u64,
    pub bytes_billed: u64,
    pub slot_millis: u64,
}

/// A completed query job and its result set.
#[derive(Debug, Clone)]
pub struct QueryJob {
    pub job_id: String,
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub statistics: JobStatistics,
}

impl QueryJob {
    pub fn into_rows(self) -> QueryRows {
        QueryRows::new(self.schema, self.batches)
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    schema: SchemaRef,
    values: Vec<ScalarValue>,
}

impl Row {
    pub fn values(&self) -> &[ScalarValue] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&ScalarValue> {
        let index = self.schema.index_of(column).ok()?;
        self.values.get(index)
    }

    /// String value of `column`, if it is a non-null string.
    pub fn get_string(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            ScalarValue::Utf8(Some(s))
            | ScalarValue::LargeUtf8(Some(s))
            | ScalarValue::Utf8View(Some(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Integer value of `column`, widening any integer type that fits.
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            ScalarValue::Int8(Some(v)) => Some(i64::from(*v)),
            ScalarValue::Int16(Some(v)) => Some(i64::from(*v)),
            ScalarValue::Int32(Some(v)) => Some(i64::from(*v)),
            ScalarValue::Int64(Some(v)) => Some(*v),
            ScalarValue::UInt8(Some(v)) => Some(i64::from(*v)),
            ScalarValue::UInt16(Some(v)) => Some(i64::from(*v)),
            ScalarValue::UInt32(Some(v)) => Some(i64::from(*v)),
            ScalarValue::UInt64(Some(v)) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// Forward-only sequence of result rows.
#[derive(Debug)]
pub struct QueryRows {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    batch_index: usize,
    row_index: usize,
    total_rows: usize,
}

impl QueryRows {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        let total_rows = batches.iter().map(|b| b.num_rows()).sum();
        Self {
            schema,
            batches,
            batch_index: 0,
            row_index: 0,
            total_rows,
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Number of rows in the whole result, independent of iteration.
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }
}

impl Iterator for QueryRows {
    type Item = WarehouseResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let batch = self.batches.get(self.batch_index)?;
            if self.row_index >= batch.num_rows() {
                self.batch_index += 1;
                self.row_index = 0;
                continue;
            }
            let row = self.row_index;
            self.row_index += 1;
            let values = batch
                .columns()
                .iter()
                .map(|column| ScalarValue::try_from_array(column.as_ref() as &dyn Array, row))
                .collect::<Result<Vec<_>, _>>();
            return Some(
                values
                    .map(|values| Row {
                        schema: batch.schema(),
                        values,
                    })
                    .map_err(WarehouseError::from),
            );
        }
    }
}

/// How a load interacts with rows already in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    /// Keep existing rows and add the loaded ones.
    Append,
    /// Replace existing rows with the loaded ones.
    Truncate,
    /// Load only into an empty table; fail otherwise.
    Empty,
}

impl WriteDisposition {
    /// Whether a load with this disposition may add new columns.
    pub fn allows_field_addition(self) -> bool {
        match self {
            WriteDisposition::Append | WriteDisposition::Truncate => true,
            WriteDisposition::Empty => false,
        }
    }

    pub fn api_name(self) -> &'static str {
        match self {
            WriteDisposition::Append => "WRITE_APPEND",
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
            WriteDisposition::Empty => "WRITE_EMPTY",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// Column type of an explicit load schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Int64,
    Float64,
    Bool,
    Date,
    Timestamp,
    Bytes,
}

impl FieldType {
    pub fn api_name(self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Int64 => "INT64",
            FieldType::Float64 => "FLOAT64",
            FieldType::Bool => "BOOL",
            FieldType::Date => "DATE",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Bytes => "BYTES",
        }
    }

    pub fn to_arrow(self) -> DataType {
        match self {
            FieldType::String => DataType::Utf8,
            FieldType::Int64 => DataType::Int64,
            FieldType::Float64 => DataType::Float64,
            FieldType::Bool => DataType::Boolean,
            FieldType::Date => DataType::Date32,
            FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            FieldType::Bytes => DataType::Binary,
        }
    }

    /// Parse a warehouse type name, accepting the legacy aliases.
    pub fn from_api_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "STRING" => Some(FieldType::String),
            "INT64" | "INTEGER" => Some(FieldType::Int64),
            "FLOAT64" | "FLOAT" => Some(FieldType::Float64),
            "BOOL" | "BOOLEAN" => Some(FieldType::Bool),
            "DATE" => Some(FieldType::Date),
            "TIMESTAMP" => Some(FieldType::Timestamp),
            "BYTES" => Some(FieldType::Bytes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
}

impl FieldMode {
    pub fn api_name(self) -> &'static str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
        }
    }
}

/// One column of an explicit load schema.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
}

impl SchemaField {
    pub fn nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
        }
    }

    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Required,
        }
    }

    pub fn to_arrow_field(&self) -> Field {
        Field::new(
            &self.name,
            self.field_type.to_arrow(),
            self.mode == FieldMode::Nullable,
        )
    }
}

/// Arrow schema equivalent of an explicit load schema.
pub fn arrow_schema(fields: &[SchemaField]) -> SchemaRef {
    Arc::new(Schema::new(
        fields
            .iter()
            .map(SchemaField::to_arrow_field)
            .collect::<Vec<_>>(),
    ))
}

/// Format of staged files. Loads always read Parquet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceFormat {
    #[default]
    Parquet,
}

impl SourceFormat {
    pub fn api_name(self) -> &'static str {
        match self {
            SourceFormat::Parquet => "PARQUET",
        }
    }
}

/// Settings of one batch load job.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadJobConfig {
    pub write_disposition: WriteDisposition,
    pub allow_field_addition: bool,
    pub source_format: SourceFormat,
    pub schema: Option<Vec<SchemaField>>,
    pub autodetect: bool,
}

impl LoadJobConfig {
    /// Derive the job settings from the disposition and optional schema:
    /// field addition follows the disposition, and autodetection is on
    /// exactly when no schema is given.
    pub fn new(write_disposition: WriteDisposition, schema: Option<Vec<SchemaField>>) -> Self {
        Self {
            write_disposition,
            allow_field_addition: write_disposition.allows_field_addition(),
            source_format: SourceFormat::Parquet,
            autodetect: schema.is_none(),
            schema,
        }
    }
}

/// SQL conventions of a backend that the crate itself needs when it builds
/// catalog queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    BigQuery,
    DataFusion,
}

impl SqlDialect {
    /// Relation listing the columns of every table in `project.dataset`.
    pub fn columns_relation(self, project: &str, dataset: &str) -> String {
        match self {
            SqlDialect::BigQuery => format!("`{}.{}.INFORMATION_SCHEMA.COLUMNS`", project, dataset),
            SqlDialect::DataFusion => format!("\"{}\".information_schema.columns", project),
        }
    }

    /// Placeholder referencing the named parameter `name`.
    pub fn parameter(self, name: &str) -> String {
        match self {
            SqlDialect::BigQuery => format!("@{}", name),
            SqlDialect::DataFusion => format!("${}", name),
        }
    }
}

/// Operations a warehouse backend provides.
#[async_trait]
pub trait Warehouse: Send + Sync + Debug {
    fn dialect(&self) -> SqlDialect;

    /// Run `sql` with named parameters and wait for the job to finish.
    async fn query(&self, sql: &str, params: &[QueryParameter]) -> WarehouseResult<QueryJob>;

    /// Load the staged object(s) at `uri` into `target` and wait for the
    /// job to finish.
    async fn load_from_uri(
        &self,
        uri: &str,
        target: &TableId,
        config: &LoadJobConfig,
    ) -> WarehouseResult<()>;

    /// Current row count of `target`.
    async fn table_num_rows(&self, target: &TableId) -> WarehouseResult<u64>;

    /// Drop `target`. With `not_found_ok` a missing table is not an error.
    async fn delete_table(&self, target: &TableId, not_found_ok: bool) -> WarehouseResult<()>;

    /// Replace the ordered clustering columns of `target`.
    async fn set_clustering_fields(
        &self,
        target: &TableId,
        fields: &[String],
    ) -> WarehouseResult<()>;
}
