//! BigQuery REST backend.
//!
//! Jobs are submitted with `jobs.insert`, polled with `jobs.get` until they
//! report `DONE`, and query results are paged through `jobs.getQueryResults`.
//! JSON result rows are converted to Arrow using the schema BigQuery returns.

use super::{
    FieldType, JobStatistics, LoadJobConfig, QueryJob, QueryParameter, SqlDialect, TableId,
    Warehouse,
};
use crate::config::BigQueryConfig;
use crate::error::{WarehouseError, WarehouseResult};
use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringArray, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

// REST resources, reduced to the fields this client reads.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    status: JobStatus,
    #[serde(default)]
    statistics: Option<JobStatisticsResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatisticsResource {
    #[serde(default)]
    total_slot_ms: Option<String>,
    #[serde(default)]
    query: Option<QueryStatisticsResource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatisticsResource {
    #[serde(default)]
    total_bytes_processed: Option<String>,
    #[serde(default)]
    total_bytes_billed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultsPage {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<TableSchemaResource>,
    #[serde(default)]
    rows: Vec<RowResource>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TableSchemaResource {
    #[serde(default)]
    fields: Vec<FieldResource>,
}

#[derive(Debug, Deserialize)]
struct FieldResource {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowResource {
    #[serde(default)]
    f: Vec<CellResource>,
}

#[derive(Debug, Deserialize)]
struct CellResource {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    #[serde(default)]
    num_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// BigQuery client authenticated with an OAuth bearer token.
pub struct BigQueryWarehouse {
    client: Client,
    endpoint: String,
    project: String,
    location: String,
    access_token: String,
    poll_interval: Duration,
}

impl fmt::Debug for BigQueryWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryWarehouse")
            .field("endpoint", &self.endpoint)
            .field("project", &self.project)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl BigQueryWarehouse {
    /// Client billing jobs to `project` and running them in `location`.
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        access_token: impl Into<String>,
        config: &BigQueryConfig,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            project: project.into(),
            location: location.into(),
            access_token: access_token.into(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn url(&self, path: &str) -> String {
        format!("{}/bigquery/v2/projects/{}", self.endpoint, path)
    }

    fn table_url(&self, table: &TableId) -> String {
        self.url(&format!(
            "{}/datasets/{}/tables/{}",
            table.project, table.dataset, table.table
        ))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    /// Send `request` and decode the JSON body. Non-2xx responses become
    /// [`WarehouseError::Api`]; an empty body decodes to `Value::Null`.
    async fn send(&self, request: RequestBuilder) -> WarehouseResult<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| WarehouseError::Decode(format!("invalid JSON body: {}", e)))
    }

    async fn insert_job(&self, job: Value) -> WarehouseResult<JobResource> {
        let url = self.url(&format!("{}/jobs", self.project));
        let response = self
            .send(self.request(Method::POST, &url).json(&job))
            .await?;
        decode(response)
    }

    async fn get_job(&self, job_id: &str) -> WarehouseResult<JobResource> {
        let url = self.url(&format!("{}/jobs/{}", self.project, job_id));
        let response = self
            .send(
                self.request(Method::GET, &url)
                    .query(&[("location", self.location.as_str())]),
            )
            .await?;
        decode(response)
    }

    /// Poll `job` until it is done, then surface its error result if any.
    async fn wait_for_job(&self, mut job: JobResource) -> WarehouseResult<JobResource> {
        while job.status.state != "DONE" {
            tokio::time::sleep(self.poll_interval).await;
            job = self.get_job(&job.job_reference.job_id).await?;
        }
        if let Some(error) = &job.status.error_result {
            return Err(WarehouseError::Job {
                job_id: job.job_reference.job_id.clone(),
                reason: error.reason.clone(),
                message: error.message.clone(),
            });
        }
        Ok(job)
    }

    async fn fetch_results(&self, job_id: &str) -> WarehouseResult<(SchemaRef, Vec<RecordBatch>)> {
        let url = self.url(&format!("{}/queries/{}", self.project, job_id));
        let mut page_token: Option<String> = None;
        let mut schema: Option<(SchemaRef, Vec<ColumnKind>)> = None;
        let mut batches = Vec::new();

        loop {
            let mut request = self
                .request(Method::GET, &url)
                .query(&[("location", self.location.as_str())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: QueryResultsPage = decode(self.send(request).await?)?;
            if !page.job_complete {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            if schema.is_none() {
                schema = Some(result_schema(&page.schema.unwrap_or_default()));
            }
            if let Some((arrow_schema, kinds)) = &schema {
                if !page.rows.is_empty() {
                    batches.push(rows_to_batch(arrow_schema, kinds, &page.rows)?);
                }
            }

            match page.page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let (arrow_schema, _) = schema.unwrap_or_else(|| result_schema(&TableSchemaResource::default()));
        Ok((arrow_schema, batches))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> WarehouseResult<T> {
    serde_json::from_value(value).map_err(|e| WarehouseError::Decode(e.to_string()))
}

fn api_error(status: StatusCode, body: &str) -> WarehouseError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.to_string());
    WarehouseError::Api {
        status: status.as_u16(),
        message,
    }
}

fn parse_counter(value: Option<&String>) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn job_statistics(job: &JobResource) -> JobStatistics {
    let Some(stats) = &job.statistics else {
        return JobStatistics::default();
    };
    let query = stats.query.as_ref();
    JobStatistics {
        bytes_processed: parse_counter(query.and_then(|q| q.total_bytes_processed.as_ref())),
        bytes_billed: parse_counter(query.and_then(|q| q.total_bytes_billed.as_ref())),
        slot_millis: parse_counter(stats.total_slot_ms.as_ref()),
    }
}

fn new_job_id(kind: &str) -> String {
    format!("ferry_{}_{}", kind, Uuid::new_v4().simple())
}

fn query_job_request(
    project: &str,
    location: &str,
    job_id: &str,
    sql: &str,
    params: &[QueryParameter],
) -> Value {
    let parameters: Vec<Value> = params
        .iter()
        .map(|param| {
            json!({
                "name": param.name,
                "parameterType": { "type": param.value.type_name() },
                "parameterValue": { "value": param.value.to_api_string() },
            })
        })
        .collect();
    json!({
        "jobReference": {
            "projectId": project,
            "jobId": job_id,
            "location": location,
        },
        "configuration": {
            "query": {
                "query": sql,
                "useLegacySql": false,
                "parameterMode": "NAMED",
                "queryParameters": parameters,
            }
        }
    })
}

fn load_job_request(
    project: &str,
    location: &str,
    job_id: &str,
    uri: &str,
    target: &TableId,
    config: &LoadJobConfig,
) -> Value {
    let mut load = json!({
        "sourceUris": [uri],
        "destinationTable": {
            "projectId": target.project,
            "datasetId": target.dataset,
            "tableId": target.table,
        },
        "sourceFormat": config.source_format.api_name(),
        "writeDisposition": config.write_disposition.api_name(),
        "createDisposition": "CREATE_IF_NEEDED",
        "autodetect": config.autodetect,
    });
    if config.allow_field_addition {
        load["schemaUpdateOptions"] = json!(["ALLOW_FIELD_ADDITION"]);
    }
    if let Some(fields) = &config.schema {
        let fields: Vec<Value> = fields
            .iter()
            .map(|field| {
                json!({
                    "name": field.name,
                    "type": field.field_type.api_name(),
                    "mode": field.mode.api_name(),
                })
            })
            .collect();
        load["schema"] = json!({ "fields": fields });
    }
    json!({
        "jobReference": {
            "projectId": project,
            "jobId": job_id,
            "location": location,
        },
        "configuration": { "load": load }
    })
}

/// How a result column is decoded from its JSON cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int64,
    Float64,
    Bool,
    Date,
    Timestamp,
    /// Strings and everything without a native mapping, kept as text.
    Text,
}

fn result_schema(schema: &TableSchemaResource) -> (SchemaRef, Vec<ColumnKind>) {
    let mut fields = Vec::with_capacity(schema.fields.len());
    let mut kinds = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        let repeated = field.mode.as_deref() == Some("REPEATED");
        let kind = match FieldType::from_api_name(&field.field_type) {
            _ if repeated => ColumnKind::Text,
            Some(FieldType::Int64) => ColumnKind::Int64,
            Some(FieldType::Float64) => ColumnKind::Float64,
            Some(FieldType::Bool) => ColumnKind::Bool,
            Some(FieldType::Date) => ColumnKind::Date,
            Some(FieldType::Timestamp) => ColumnKind::Timestamp,
            Some(FieldType::String) | Some(FieldType::Bytes) | None => ColumnKind::Text,
        };
        let data_type = match kind {
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Date => DataType::Date32,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            ColumnKind::Text => DataType::Utf8,
        };
        let nullable = field.mode.as_deref() != Some("REQUIRED");
        fields.push(Field::new(&field.name, data_type, nullable));
        kinds.push(kind);
    }
    (Arc::new(Schema::new(fields)), kinds)
}

fn cell_text(cell: Option<&CellResource>) -> Option<String> {
    match cell.map(|c| &c.v) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn decode_error(column: &str, value: &str) -> WarehouseError {
    WarehouseError::Decode(format!("column '{}': cannot decode '{}'", column, value))
}

fn rows_to_batch(
    schema: &SchemaRef,
    kinds: &[ColumnKind],
    rows: &[RowResource],
) -> WarehouseResult<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(kinds.len());
    for (index, (field, kind)) in schema.fields().iter().zip(kinds).enumerate() {
        let cells = rows.iter().map(|row| cell_text(row.f.get(index)));
        let column: ArrayRef = match kind {
            ColumnKind::Int64 => {
                let mut builder = Int64Builder::with_capacity(rows.len());
                for cell in cells {
                    match cell {
                        Some(text) => builder.append_value(
                            text.parse().map_err(|_| decode_error(field.name(), &text))?,
                        ),
                        None => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Float64 => {
                let mut builder = Float64Builder::with_capacity(rows.len());
                for cell in cells {
                    match cell {
                        Some(text) => builder.append_value(
                            text.parse().map_err(|_| decode_error(field.name(), &text))?,
                        ),
                        None => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Bool => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for cell in cells {
                    match cell.as_deref() {
                        Some("true") | Some("TRUE") => builder.append_value(true),
                        Some("false") | Some("FALSE") => builder.append_value(false),
                        Some(text) => return Err(decode_error(field.name(), text)),
                        None => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Timestamp => {
                // Timestamps arrive as floating-point seconds since the epoch.
                let mut builder =
                    TimestampMicrosecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
                for cell in cells {
                    match cell {
                        Some(text) => {
                            let secs: f64 =
                                text.parse().map_err(|_| decode_error(field.name(), &text))?;
                            builder.append_value((secs * 1_000_000.0).round() as i64);
                        }
                        None => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Date => {
                let text: StringArray = cells.collect();
                cast(&text, &DataType::Date32)?
            }
            ColumnKind::Text => {
                let mut builder = StringBuilder::with_capacity(rows.len(), rows.len() * 8);
                for cell in cells {
                    builder.append_option(cell);
                }
                Arc::new(builder.finish())
            }
        };
        columns.push(column);
    }
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::BigQuery
    }

    async fn query(&self, sql: &str, params: &[QueryParameter]) -> WarehouseResult<QueryJob> {
        let job_id = new_job_id("query");
        let request = query_job_request(&self.project, &self.location, &job_id, sql, params);
        let job = self.wait_for_job(self.insert_job(request).await?).await?;
        let (schema, batches) = self.fetch_results(&job.job_reference.job_id).await?;
        Ok(QueryJob {
            statistics: job_statistics(&job),
            job_id: job.job_reference.job_id,
            schema,
            batches,
        })
    }

    async fn load_from_uri(
        &self,
        uri: &str,
        target: &TableId,
        config: &LoadJobConfig,
    ) -> WarehouseResult<()> {
        let job_id = new_job_id("load");
        let request =
            load_job_request(&self.project, &self.location, &job_id, uri, target, config);
        let job = self.wait_for_job(self.insert_job(request).await?).await?;
        info!(
            job_id = %job.job_reference.job_id,
            uri,
            table = %target,
            disposition = %config.write_disposition,
            "Load job finished"
        );
        Ok(())
    }

    async fn table_num_rows(&self, target: &TableId) -> WarehouseResult<u64> {
        let url = self.table_url(target);
        let table: TableResource = decode(self.send(self.request(Method::GET, &url)).await?)?;
        Ok(parse_counter(table.num_rows.as_ref()))
    }

    async fn delete_table(&self, target: &TableId, not_found_ok: bool) -> WarehouseResult<()> {
        let url = self.table_url(target);
        match self.send(self.request(Method::DELETE, &url)).await {
            Ok(_) => Ok(()),
            Err(e) if not_found_ok && e.is_not_found() => {
                debug!(table = %target, "Table already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_clustering_fields(
        &self,
        target: &TableId,
        fields: &[String],
    ) -> WarehouseResult<()> {
        let url = self.table_url(target);
        let body = json!({ "clustering": { "fields": fields } });
        self.send(self.request(Method::PATCH, &url).json(&body))
            .await?;
        Ok(())
    }
}
