//! Apache Doris destination
//!
//! Loads batches with Stream Load and follows schema changes with light
//! schema change statements.
//!
//! # Stream Load
//!
//! ```text
//! PUT http://{fe}/api/{db}/{table}/_stream_load
//!   label: <batch label>
//!   format: json
//!   read_json_by_line: true
//!   hidden_columns: __DORIS_DELETE_SIGN__
//!        │
//!        ▼  307 Temporary Redirect (Location: http://{be}/...)
//! PUT http://{be}/api/{db}/{table}/_stream_load   (same headers and body)
//! ```
//!
//! The redirect is followed by hand so the `Authorization` header survives
//! the hop to the BE.
//!
//! # Status mapping
//!
//! | Response | Outcome |
//! |----------|---------|
//! | `Success`, `Publish Timeout` | applied |
//! | `Label Already Exists` + `FINISHED` | already applied |
//! | `Label Already Exists` + `RUNNING` | retriable |
//! | `Fail` | rejected, unless the message names a transient condition |
//! | HTTP 5xx, timeouts, connection errors | retriable |

use super::{Destination, DestinationCapabilities, LoadOutcome, LoadStatus, RowRejection};
use crate::error::{ConnectorError, ConnectorResult};
use crate::loader::{LoadBatch, DELETE_SIGN};
use crate::types::{DestinationTable, SensitiveString};
use async_trait::async_trait;
use base64::Engine;
use binlake_cdc::{ColumnChange, ColumnDef, SqlType};
use metrics::counter;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, EXPECT, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// FE → BE redirects followed per request.
const MAX_REDIRECTS: usize = 3;

/// Doris VARCHAR limit in bytes.
const MAX_VARCHAR: u64 = 65533;

/// `Fail` messages that clear up on their own.
const TRANSIENT_FAILURES: &[&str] = &[
    "timeout",
    "timed out",
    "too many versions",
    "busy",
    "try again",
    "publish",
    "memory exceed",
    "-235",
];

#[derive(Debug, Clone)]
pub struct DorisConfig {
    /// FE HTTP endpoints (`host:port`), tried in turn
    pub fe_nodes: Vec<String>,
    pub user: String,
    pub password: SensitiveString,
    pub request_timeout: Duration,
}

impl DorisConfig {
    pub fn new(fe_nodes: Vec<String>, user: impl Into<String>) -> Self {
        Self {
            fe_nodes,
            user: user.into(),
            password: SensitiveString::default(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_password(mut self, password: impl Into<SensitiveString>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> ConnectorResult<()> {
        if self.fe_nodes.is_empty() {
            return Err(ConnectorError::config("at least one Doris FE node is required"));
        }
        for node in &self.fe_nodes {
            url::Url::parse(&format!("http://{}", node))
                .map_err(|e| ConnectorError::config(format!("invalid FE node '{}': {}", node, e)))?;
        }
        Ok(())
    }
}

/// Stream Load response body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StreamLoadResponse {
    pub txn_id: Option<i64>,
    pub label: String,
    pub status: String,
    pub message: Option<String>,
    pub existing_job_status: Option<String>,
    pub number_total_rows: u64,
    pub number_loaded_rows: u64,
    pub number_filtered_rows: u64,
    pub load_time_ms: u64,
    #[serde(rename = "ErrorURL")]
    pub error_url: Option<String>,
}

impl StreamLoadResponse {
    /// Map the load status onto an outcome or a classified error.
    pub fn outcome(&self) -> ConnectorResult<LoadOutcome> {
        let message = self.message.clone().unwrap_or_default();
        match self.status.as_str() {
            "Success" | "Publish Timeout" => {
                let rejections = match (&self.error_url, self.number_filtered_rows) {
                    (Some(url), n) if n > 0 => vec![RowRejection {
                        row: None,
                        reason: format!("{} row(s) filtered, see {}", n, url),
                    }],
                    _ => Vec::new(),
                };
                Ok(LoadOutcome {
                    status: LoadStatus::Applied,
                    rows_loaded: self.number_loaded_rows,
                    rows_filtered: self.number_filtered_rows,
                    rejections,
                })
            }
            "Label Already Exists" => match self.existing_job_status.as_deref() {
                Some("FINISHED") | Some("VISIBLE") => Ok(LoadOutcome::already_applied()),
                status => Err(ConnectorError::transient(format!(
                    "label {} is still {}",
                    self.label,
                    status.unwrap_or("in progress")
                ))),
            },
            "Fail" => {
                let lower = message.to_ascii_lowercase();
                if TRANSIENT_FAILURES.iter().any(|m| lower.contains(m)) {
                    Err(ConnectorError::transient(message))
                } else {
                    Err(ConnectorError::rejected(message, self.error_url.clone()))
                }
            }
            other => Err(ConnectorError::fatal(format!(
                "unexpected stream load status '{}': {}",
                other, message
            ))),
        }
    }
}

/// Doris column type for a MySQL type.
///
/// Character lengths are in characters upstream and bytes in Doris, so they
/// are scaled for 4-byte UTF-8.
pub fn doris_type(sql_type: &SqlType) -> String {
    match sql_type {
        SqlType::Int { bytes, unsigned } => match (*bytes, *unsigned) {
            (1, false) => "TINYINT",
            (1, true) | (2, false) => "SMALLINT",
            (2, true) | (3, _) | (4, false) => "INT",
            (4, true) | (8, false) => "BIGINT",
            _ => "LARGEINT",
        }
        .to_string(),
        SqlType::Decimal { precision, scale } => {
            format!("DECIMAL({},{})", (*precision).min(38), scale)
        }
        SqlType::Float => "FLOAT".to_string(),
        SqlType::Double => "DOUBLE".to_string(),
        SqlType::Char { len } if u64::from(*len) * 4 <= 255 => format!("CHAR({})", len * 4),
        SqlType::Char { len } | SqlType::Varchar { len } => {
            let bytes = u64::from(*len) * 4;
            if bytes <= MAX_VARCHAR {
                format!("VARCHAR({})", bytes)
            } else {
                "STRING".to_string()
            }
        }
        SqlType::Date => "DATE".to_string(),
        SqlType::DateTime { fsp } | SqlType::Timestamp { fsp } => format!("DATETIME({})", fsp),
        SqlType::Year => "SMALLINT".to_string(),
        SqlType::Bit { bits } if *bits <= 63 => "BIGINT".to_string(),
        SqlType::Bit { .. } => "LARGEINT".to_string(),
        SqlType::Text { .. }
        | SqlType::Binary { .. }
        | SqlType::Varbinary { .. }
        | SqlType::Blob { .. }
        | SqlType::Time { .. }
        | SqlType::Json
        | SqlType::Enum { .. }
        | SqlType::Set { .. }
        | SqlType::Other { .. } => "STRING".to_string(),
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn default_clause(column: &ColumnDef) -> String {
    let Some(default) = column.default.as_deref() else {
        return String::new();
    };
    let upper = default.to_ascii_uppercase();
    if upper == "NULL" {
        return String::new();
    }
    if upper.starts_with("CURRENT_TIMESTAMP") {
        return format!(" DEFAULT {}", default);
    }
    let bare = default
        .strip_prefix('\'')
        .and_then(|d| d.strip_suffix('\''))
        .unwrap_or(default);
    format!(" DEFAULT \"{}\"", bare.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Light schema change statements for compatible `changes`.
pub fn alter_statements(
    table: &DestinationTable,
    changes: &[ColumnChange],
) -> ConnectorResult<Vec<String>> {
    let target = format!("{}.{}", quote_ident(&table.database), quote_ident(&table.table));
    changes
        .iter()
        .map(|change| match change {
            ColumnChange::Add { column } => Ok(format!(
                "ALTER TABLE {} ADD COLUMN {} {} NULL{}",
                target,
                quote_ident(&column.name),
                doris_type(&column.sql_type),
                default_clause(column)
            )),
            ColumnChange::Widen { to, .. } => Ok(format!(
                "ALTER TABLE {} MODIFY COLUMN {} {} {}",
                target,
                quote_ident(&to.name),
                doris_type(&to.sql_type),
                if to.primary_key { "KEY NOT NULL" } else { "NULL" }
            )),
            other => Err(ConnectorError::schema(format!(
                "{} cannot be applied to {}",
                other, table
            ))),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Stream Load destination.
#[derive(Debug)]
pub struct DorisDestination {
    config: DorisConfig,
    client: reqwest::Client,
    auth: HeaderValue,
    next_fe: AtomicUsize,
}

impl DorisDestination {
    pub fn new(config: DorisConfig) -> ConnectorResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConnectorError::config(format!("http client: {}", e)))?;
        let credentials = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            config.user,
            config.password.expose_secret()
        ));
        let mut auth = HeaderValue::from_str(&format!("Basic {}", credentials))
            .map_err(|e| ConnectorError::config(format!("invalid credentials: {}", e)))?;
        auth.set_sensitive(true);
        Ok(Self {
            config,
            client,
            auth,
            next_fe: AtomicUsize::new(0),
        })
    }

    fn fe(&self) -> &str {
        let i = self.next_fe.load(Ordering::Relaxed) % self.config.fe_nodes.len();
        &self.config.fe_nodes[i]
    }

    /// Move to the next FE after a connection failure.
    fn rotate_fe(&self) {
        if self.config.fe_nodes.len() > 1 {
            let previous = self.next_fe.fetch_add(1, Ordering::Relaxed);
            warn!(
                failed = %self.config.fe_nodes[previous % self.config.fe_nodes.len()],
                next = %self.fe(),
                "Switching Doris FE node"
            );
        }
    }

    fn load_headers(&self, label: &str) -> ConnectorResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.auth.clone());
        headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        headers.insert(
            "label",
            HeaderValue::from_str(label)
                .map_err(|e| ConnectorError::fatal(format!("invalid label '{}': {}", label, e)))?,
        );
        headers.insert("format", HeaderValue::from_static("json"));
        headers.insert("read_json_by_line", HeaderValue::from_static("true"));
        headers.insert("hidden_columns", HeaderValue::from_static(DELETE_SIGN));
        Ok(headers)
    }

    async fn stream_load(&self, batch: &LoadBatch, body: Vec<u8>) -> ConnectorResult<StreamLoadResponse> {
        let headers = self.load_headers(&batch.label)?;
        let mut url = format!(
            "http://{}/api/{}/{}/_stream_load",
            self.fe(),
            batch.table.database,
            batch.table.table
        );

        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .put(&url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await
                .inspect_err(|e| {
                    if e.is_connect() {
                        self.rotate_fe();
                    }
                })?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ConnectorError::fatal("redirect without Location header"))?;
                debug!(label = %batch.label, location, "Following stream load redirect");
                url = location.to_string();
                continue;
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ConnectorError::Auth(format!(
                    "Doris rejected credentials for user '{}'",
                    self.config.user
                )));
            }
            let text = response.text().await?;
            if status.is_server_error() {
                return Err(ConnectorError::transient(format!("HTTP {}: {}", status, text)));
            }
            if !status.is_success() {
                return Err(ConnectorError::fatal(format!("HTTP {}: {}", status, text)));
            }
            return serde_json::from_str(&text).map_err(|e| {
                ConnectorError::transient(format!("unreadable stream load response ({}): {}", e, text))
            });
        }
        Err(ConnectorError::fatal(format!(
            "more than {} redirects for {}",
            MAX_REDIRECTS, batch.label
        )))
    }

    async fn execute(&self, database: &str, stmt: &str) -> ConnectorResult<()> {
        let url = format!("http://{}/api/query/default_cluster/{}", self.fe(), database);
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, self.auth.clone())
            .json(&serde_json::json!({ "stmt": stmt }))
            .send()
            .await
            .inspect_err(|e| {
                if e.is_connect() {
                    self.rotate_fe();
                }
            })?;
        let status = response.status();
        let text = response.text().await?;
        if status.is_server_error() {
            return Err(ConnectorError::transient(format!("HTTP {}: {}", status, text)));
        }
        if !status.is_success() {
            return Err(ConnectorError::fatal(format!("HTTP {}: {}", status, text)));
        }
        let reply: QueryResponse = serde_json::from_str(&text)?;
        if reply.code == 0 {
            return Ok(());
        }
        // replays after a crash between alter and checkpoint
        if reply.msg.contains("already exists") || reply.msg.contains("Nothing is changed") {
            debug!(stmt, msg = %reply.msg, "Schema change already in place");
            return Ok(());
        }
        Err(ConnectorError::schema(format!("{}: {}", stmt, reply.msg)))
    }
}

#[async_trait]
impl Destination for DorisDestination {
    async fn load(&self, batch: &LoadBatch) -> ConnectorResult<LoadOutcome> {
        let body = batch.to_json_lines()?;
        let bytes = body.len();
        let started = Instant::now();
        let response = self.stream_load(batch, body).await?;
        let outcome = response.outcome();

        match &outcome {
            Ok(o) => {
                counter!("binlake.doris.loads", "status" => format!("{:?}", o.status)).increment(1);
                counter!("binlake.doris.rows").increment(o.rows_loaded);
                info!(
                    table = %batch.table,
                    label = %batch.label,
                    txn_id = ?response.txn_id,
                    status = ?o.status,
                    rows = o.rows_loaded,
                    filtered = o.rows_filtered,
                    bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Stream load finished"
                );
                if o.rows_filtered > 0 {
                    warn!(
                        table = %batch.table,
                        label = %batch.label,
                        filtered = o.rows_filtered,
                        error_url = ?response.error_url,
                        "Stream load filtered rows"
                    );
                }
            }
            Err(e) => {
                counter!("binlake.doris.loads", "status" => "failed").increment(1);
                warn!(
                    table = %batch.table,
                    label = %batch.label,
                    status = %response.status,
                    error = %e,
                    "Stream load failed"
                );
            }
        }
        outcome
    }

    async fn alter_table(
        &self,
        table: &DestinationTable,
        changes: &[ColumnChange],
    ) -> ConnectorResult<()> {
        for stmt in alter_statements(table, changes)? {
            info!(table = %table, stmt = %stmt, "Applying light schema change");
            self.execute(&table.database, &stmt).await?;
        }
        Ok(())
    }

    fn capabilities(&self) -> DestinationCapabilities {
        DestinationCapabilities {
            atomic_batches: true,
            label_dedup: true,
            max_batch_rows: None,
        }
    }
}
