//! PostgREST transport for Wigg: read-only catalog introspection, the upsert
//! and row-count calls of the write path, retry classification, and
//! credential role decoding.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use reqwest::{header, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use wigg_core::{Payload, DEFAULT_SCHEMA};

pub const CRATE_NAME: &str = "wigg-storage";

/// Role reported when a credential cannot be decoded.
pub const UNKNOWN_ROLE: &str = "unknown";

const INFORMATION_SCHEMA_PROFILE: &str = "information_schema";
const PG_CATALOG_PROFILE: &str = "pg_catalog";

/// Characters left literal in query values, on top of the unreserved set.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'*')
    .remove(b'(')
    .remove(b')')
    .remove(b',')
    .remove(b':');

static RETRYABLE_STATUS_IN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(429|5\d{2})\b").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: u16) -> RetryDisposition {
    match StatusCode::from_u16(status) {
        Ok(status) if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

/// Pulls a rate-limit or server-error status out of free-form error text.
pub fn status_from_message(message: &str) -> Option<u16> {
    RETRYABLE_STATUS_IN_TEXT
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry_index` (zero-based): the base delay
    /// doubled per retry, capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry_index: usize) -> Duration {
        let factor = u32::try_from(retry_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Reads the `role` claim of a compact three-part token without verifying it.
/// Anything malformed yields [`UNKNOWN_ROLE`].
pub fn decode_role(token: &str) -> String {
    role_claim(token).unwrap_or_else(|| UNKNOWN_ROLE.to_string())
}

fn role_claim(token: &str) -> Option<String> {
    let parts: Vec<&str> = token.trim().split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let segment = parts[1];
    let padding = (4 - segment.len() % 4) % 4;
    let padded = format!("{segment}{}", "=".repeat(padding));
    let bytes = URL_SAFE.decode(padded).ok()?;
    let claims: JsonValue = serde_json::from_slice(&bytes).ok()?;
    claims.get("role")?.as_str().map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableRow {
    #[serde(default = "default_schema")]
    pub table_schema: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColumnRow {
    pub column_name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub is_nullable: Option<String>,
    #[serde(default)]
    pub column_default: Option<String>,
    #[serde(default)]
    pub ordinal_position: Option<i64>,
}

/// One (constraint, column) pair; multi-column constraints appear as
/// consecutive rows in the constraint's declared column order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConstraintColumnRow {
    pub constraint_name: String,
    pub constraint_type: String,
    pub column_name: String,
}

#[derive(Debug, Deserialize)]
struct ConstraintRow {
    constraint_name: String,
    constraint_type: String,
}

#[derive(Debug, Deserialize)]
struct KeyUsageRow {
    constraint_name: String,
    column_name: String,
    #[serde(default)]
    ordinal_position: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NamespaceRow {
    oid: JsonValue,
}

#[derive(Debug, Deserialize)]
struct RelationSecurityRow {
    relname: String,
    #[serde(default)]
    relrowsecurity: bool,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("catalog http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding catalog rows from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write endpoint returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("write request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding write response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl WriteError {
    /// Status carried by the error, falling back to one mentioned in its text.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            WriteError::Status { status, .. } => Some(*status),
            WriteError::Request(err) => err
                .status()
                .map(|status| status.as_u16())
                .or_else(|| status_from_message(&err.to_string())),
            WriteError::Decode(_) => None,
            WriteError::Message(message) => status_from_message(message),
        }
    }
}

/// Response of one upsert call. Counts are `None` when the backend does not
/// report them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertResponse {
    pub inserted: Option<u64>,
    pub updated: Option<u64>,
    pub returned_rows: usize,
}

/// Read-only catalog introspection.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Base tables outside the system schemas, ordered by schema then name.
    async fn list_tables(&self) -> Result<Vec<TableRow>, CatalogError>;

    /// Columns of `schema.table` in declaration order.
    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnRow>, CatalogError>;

    async fn list_constraint_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ConstraintColumnRow>, CatalogError>;

    /// Row-security flag per table name within `schema`.
    async fn list_row_security(&self, schema: &str) -> Result<BTreeMap<String, bool>, CatalogError>;
}

/// Data endpoint of a single table.
#[async_trait]
pub trait TableWriter: Send + Sync {
    async fn upsert(
        &self,
        schema: &str,
        table: &str,
        on_conflict: &[String],
        rows: &[Payload],
    ) -> Result<UpsertResponse, WriteError>;

    async fn count_rows(&self, schema: &str, table: &str) -> Result<u64, WriteError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
        }
    }
}

/// PostgREST client authenticated with a service credential.
#[derive(Debug, Clone)]
pub struct PostgrestClient {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl PostgrestClient {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let http = builder.build().context("building reqwest client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn relation_url(&self, relation: &str, params: &[(&str, String)]) -> String {
        let url = format!("{}/rest/v1/{relation}", self.base_url);
        let query = encode_query(params);
        if query.is_empty() {
            url
        } else {
            format!("{url}?{query}")
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .header(header::ACCEPT, "application/json")
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        relation: &str,
        params: &[(&str, String)],
        profile: &str,
    ) -> Result<Vec<T>, CatalogError> {
        let url = self.relation_url(relation, params);
        let span = info_span!("catalog_read", relation, profile);
        async move {
            let resp = self
                .request(Method::GET, &url)
                .header("Accept-Profile", profile)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(CatalogError::HttpStatus {
                    status: status.as_u16(),
                    url,
                    body,
                });
            }
            let bytes = resp.bytes().await?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(Vec::new());
            }
            let rows: Vec<T> =
                serde_json::from_slice(&bytes).map_err(|source| CatalogError::Decode { url, source })?;
            debug!(rows = rows.len(), "catalog rows fetched");
            Ok(rows)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl CatalogSource for PostgrestClient {
    async fn list_tables(&self) -> Result<Vec<TableRow>, CatalogError> {
        self.get_rows(
            "tables",
            &[
                ("select", "table_schema,table_name".to_string()),
                ("table_type", "eq.BASE TABLE".to_string()),
                ("table_schema", "not.in.(pg_catalog,information_schema)".to_string()),
                ("order", "table_schema,table_name".to_string()),
            ],
            INFORMATION_SCHEMA_PROFILE,
        )
        .await
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnRow>, CatalogError> {
        self.get_rows(
            "columns",
            &[
                (
                    "select",
                    "column_name,data_type,is_nullable,column_default,ordinal_position".to_string(),
                ),
                ("table_schema", format!("eq.{schema}")),
                ("table_name", format!("eq.{table}")),
                ("order", "ordinal_position".to_string()),
            ],
            INFORMATION_SCHEMA_PROFILE,
        )
        .await
    }

    async fn list_constraint_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ConstraintColumnRow>, CatalogError> {
        let constraints: Vec<ConstraintRow> = self
            .get_rows(
                "table_constraints",
                &[
                    ("select", "constraint_name,table_name,constraint_type".to_string()),
                    ("table_schema", format!("eq.{schema}")),
                    ("table_name", format!("eq.{table}")),
                    ("constraint_type", "in.(PRIMARY KEY,UNIQUE)".to_string()),
                ],
                INFORMATION_SCHEMA_PROFILE,
            )
            .await?;
        let key_usage: Vec<KeyUsageRow> = self
            .get_rows(
                "key_column_usage",
                &[
                    ("select", "constraint_name,column_name,ordinal_position".to_string()),
                    ("table_schema", format!("eq.{schema}")),
                    ("table_name", format!("eq.{table}")),
                    ("order", "ordinal_position".to_string()),
                ],
                INFORMATION_SCHEMA_PROFILE,
            )
            .await?;

        Ok(join_constraint_columns(constraints, key_usage))
    }

    async fn list_row_security(&self, schema: &str) -> Result<BTreeMap<String, bool>, CatalogError> {
        let namespaces: Vec<NamespaceRow> = self
            .get_rows(
                "pg_namespace",
                &[
                    ("select", "oid".to_string()),
                    ("nspname", format!("eq.{schema}")),
                    ("limit", "1".to_string()),
                ],
                PG_CATALOG_PROFILE,
            )
            .await?;
        let Some(namespace) = namespaces.first() else {
            return Ok(BTreeMap::new());
        };
        let oid = match &namespace.oid {
            JsonValue::String(oid) => oid.clone(),
            other => other.to_string(),
        };

        let relations: Vec<RelationSecurityRow> = self
            .get_rows(
                "pg_class",
                &[
                    ("select", "relname,relrowsecurity".to_string()),
                    ("relkind", "eq.r".to_string()),
                    ("relnamespace", format!("eq.{oid}")),
                ],
                PG_CATALOG_PROFILE,
            )
            .await?;

        Ok(relations
            .into_iter()
            .map(|row| (row.relname, row.relrowsecurity))
            .collect())
    }
}

#[async_trait]
impl TableWriter for PostgrestClient {
    async fn upsert(
        &self,
        schema: &str,
        table: &str,
        on_conflict: &[String],
        rows: &[Payload],
    ) -> Result<UpsertResponse, WriteError> {
        let url = self.relation_url(table, &[("on_conflict", on_conflict.join(","))]);
        let span = info_span!("table_upsert", schema, table, rows = rows.len());
        async move {
            let resp = self
                .request(Method::POST, &url)
                .header("Content-Profile", schema)
                .header("Prefer", "resolution=merge-duplicates,return=representation")
                .json(rows)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                return Err(WriteError::Status {
                    status: status.as_u16(),
                    message,
                });
            }
            let bytes = resp.bytes().await?;
            let returned: Vec<JsonValue> = if bytes.iter().all(u8::is_ascii_whitespace) {
                Vec::new()
            } else {
                serde_json::from_slice(&bytes)?
            };
            Ok(UpsertResponse {
                inserted: None,
                updated: None,
                returned_rows: returned.len(),
            })
        }
        .instrument(span)
        .await
    }

    async fn count_rows(&self, schema: &str, table: &str) -> Result<u64, WriteError> {
        let url = self.relation_url(table, &[("select", "*".to_string())]);
        let resp = self
            .request(Method::HEAD, &url)
            .header("Accept-Profile", schema)
            .header("Prefer", "count=exact")
            .send()
            .instrument(info_span!("table_count", schema, table))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WriteError::Status {
                status: status.as_u16(),
                message: format!("row count probe for {schema}.{table}"),
            });
        }
        resp.headers()
            .get(header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| WriteError::Message(format!("no row total in content-range for {table}")))
    }
}

/// Groups key-usage rows under their constraint, ordered by each column's
/// position within the constraint.
fn join_constraint_columns(
    constraints: Vec<ConstraintRow>,
    key_usage: Vec<KeyUsageRow>,
) -> Vec<ConstraintColumnRow> {
    let mut by_constraint: HashMap<String, Vec<(i64, String)>> = HashMap::new();
    for row in key_usage {
        by_constraint
            .entry(row.constraint_name)
            .or_default()
            .push((row.ordinal_position.unwrap_or(0), row.column_name));
    }

    let mut joined = Vec::new();
    for constraint in constraints {
        let mut columns = by_constraint
            .get(&constraint.constraint_name)
            .cloned()
            .unwrap_or_default();
        columns.sort_by_key(|(position, _)| *position);
        for (_, column_name) in columns {
            joined.push(ConstraintColumnRow {
                constraint_name: constraint.constraint_name.clone(),
                constraint_type: constraint.constraint_type.clone(),
                column_name,
            });
        }
    }
    joined
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={}", utf8_percent_encode(value, QUERY_VALUE)))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}
