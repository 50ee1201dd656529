//! Schema discovery, resilient upserts and the seed pipeline that drives them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use strsim::normalized_levenshtein;
use thiserror::Error;
use tokio::sync::OnceCell;
use uuid::Uuid;
use wigg_adapters::RecordSource;
use wigg_core::{
    CandidateMoment, CanonicalField, ColumnDescriptor, ConstraintInfo, ConstraintKind, Payload,
    SchemaMapping, UpsertOutcome, DEFAULT_SCHEMA, ELEVATED_ROLE, PREFERRED_UNIQUE_KEYS,
};
use wigg_storage::{
    classify_status, decode_role, BackoffPolicy, CatalogError, CatalogSource, ColumnRow,
    ConstraintColumnRow, HttpClientConfig, PostgrestClient, RetryDisposition, TableRow,
    TableWriter, UpsertResponse, WriteError,
};

pub const CRATE_NAME: &str = "wigg-sync";

pub const TABLE_MATCH_THRESHOLD: f64 = 70.0;
pub const COLUMN_MATCH_THRESHOLD: f64 = 78.0;
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DRY_RUN_SAMPLE: usize = 3;

static SEMANTIC_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)moment|hook|seed").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Run log handed to each component instead of a process-global logger.
pub trait RunLog: Send + Sync {
    fn record(&self, level: LogLevel, message: &str);

    fn info(&self, message: &str) {
        self.record(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.record(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.record(LogLevel::Error, message);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl RunLog for TracingLog {
    fn record(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => tracing::info!(target: "wigg", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "wigg", "{message}"),
            LogLevel::Error => tracing::error!(target: "wigg", "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Captures entries in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.level == level)
            .map(|entry| entry.message)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries()
            .iter()
            .any(|entry| entry.message.contains(needle))
    }
}

impl RunLog for MemoryLog {
    fn record(&self, level: LogLevel, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry {
                level,
                message: message.to_string(),
            });
    }
}

/// Backoff waits go through this so tests can observe them without sleeping.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

// Fuzzy scoring on a 0-100 scale.

const MIN_PARTIAL_LEN: usize = 3;

pub fn normalize_for_match(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b) * 100.0
}

fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sorted = |s: &str| {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    ratio(&sorted(a), &sorted(b))
}

fn token_set_ratio(a: &str, b: &str) -> f64 {
    let left: BTreeSet<&str> = a.split_whitespace().collect();
    let right: BTreeSet<&str> = b.split_whitespace().collect();
    let shared = left.intersection(&right).copied().collect::<Vec<_>>().join(" ");
    let only_left = left.difference(&right).copied().collect::<Vec<_>>().join(" ");
    let only_right = right.difference(&left).copied().collect::<Vec<_>>().join(" ");

    if !shared.is_empty() && (only_left.is_empty() || only_right.is_empty()) {
        return 100.0;
    }

    let combine = |rest: &str| match (shared.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => shared.clone(),
        (false, false) => format!("{shared} {rest}"),
    };
    let with_left = combine(&only_left);
    let with_right = combine(&only_right);

    let mut best = ratio(&with_left, &with_right);
    if !shared.is_empty() {
        best = best
            .max(ratio(&shared, &with_left))
            .max(ratio(&shared, &with_right));
    }
    best
}

fn partial_ratio(shorter: &str, longer: &str) -> f64 {
    let short: Vec<char> = shorter.chars().collect();
    let long: Vec<char> = longer.chars().collect();
    if short.len() < MIN_PARTIAL_LEN || short.len() > long.len() {
        return 0.0;
    }
    let needle: String = short.iter().collect();
    long.windows(short.len())
        .map(|window| ratio(&needle, &window.iter().collect::<String>()))
        .fold(0.0, f64::max)
}

/// Token-aware similarity of two identifiers, 0 to 100.
///
/// Takes the best of a plain edit-distance ratio and token sort/set ratios
/// (scaled by 0.95). When one side is at least 1.5 times longer, a best-window
/// partial ratio also competes, scaled by 0.9 (0.6 from 8 times longer). The
/// partial window ignores needles shorter than three characters, so a short
/// column such as `id` never matches by substring alone.
pub fn weighted_ratio(a: &str, b: &str) -> f64 {
    let a = normalize_for_match(a);
    let b = normalize_for_match(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let base = ratio(&a, &b);
    let len_a = a.chars().count() as f64;
    let len_b = b.chars().count() as f64;
    let len_ratio = len_a.max(len_b) / len_a.min(len_b);
    let token_set = token_set_ratio(&a, &b);

    if len_ratio < 1.5 {
        return base
            .max(token_sort_ratio(&a, &b) * 0.95)
            .max(token_set * 0.95);
    }

    let scale = if len_ratio < 8.0 { 0.9 } else { 0.6 };
    let (shorter, longer) = if len_a <= len_b { (&a, &b) } else { (&b, &a) };
    base.max(partial_ratio(shorter, longer) * scale)
        .max(token_set * 0.95 * scale)
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no table resolves for requested name '{desired}'")]
    TableNotFound { desired: String },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Resolves a logical table name to a concrete table, its column mapping and
/// its upsert key.
///
/// The table list and row-security map are fetched at most once per
/// instance; columns and constraints are fetched on every `discover` call.
pub struct SchemaDiscoverer {
    catalog: Arc<dyn CatalogSource>,
    log: Arc<dyn RunLog>,
    tables: OnceCell<Vec<TableRow>>,
    row_security: OnceCell<BTreeMap<String, bool>>,
}

impl SchemaDiscoverer {
    pub fn new(catalog: Arc<dyn CatalogSource>, log: Arc<dyn RunLog>) -> Self {
        Self {
            catalog,
            log,
            tables: OnceCell::new(),
            row_security: OnceCell::new(),
        }
    }

    pub async fn discover(&self, desired: &str) -> Result<SchemaMapping, DiscoveryError> {
        let tables = self.tables().await?;
        let Some(table) = select_table(desired, tables) else {
            self.log.error(&format!(
                "[Discovery] no table resolves for '{desired}' among {} candidates",
                tables.len()
            ));
            return Err(DiscoveryError::TableNotFound {
                desired: desired.to_string(),
            });
        };
        let schema = table.table_schema.clone();
        let name = table.table_name.clone();

        let columns = self.catalog.list_columns(&schema, &name).await?;
        let constraint_rows = self.catalog.list_constraint_columns(&schema, &name).await?;
        let row_security_enabled = self
            .row_security()
            .await?
            .get(&name)
            .copied()
            .unwrap_or(false);

        let column_names: Vec<String> = columns.iter().map(|c| c.column_name.clone()).collect();
        let column_mapping = build_column_mapping(&column_names);
        let raw_constraints = group_constraints(&constraint_rows);
        let unique = select_unique_key(&raw_constraints, &column_mapping);

        let (unique_constraint_name, on_conflict_columns) = match unique {
            Some((constraint, columns)) => (Some(constraint), columns),
            None => (None, Vec::new()),
        };

        let mapping = SchemaMapping {
            schema,
            table: name,
            columns: columns
                .iter()
                .map(|row| (row.column_name.clone(), column_descriptor(row)))
                .collect(),
            column_mapping,
            unique_constraint_name,
            on_conflict_columns,
            row_security_enabled,
            raw_constraints,
        };

        self.log.info(&format!(
            "[Discovery] table={} unique={} on_conflict=[{}] rls={}",
            mapping.full_table_name(),
            mapping.unique_constraint_name.as_deref().unwrap_or("none"),
            mapping.on_conflict_columns.join(","),
            mapping.row_security_enabled
        ));
        if !mapping.supports_upsert() {
            self.log.warn(&format!(
                "[Discovery] {} has no usable unique key; upserts are disabled",
                mapping.full_table_name()
            ));
        }
        Ok(mapping)
    }

    async fn tables(&self) -> Result<&Vec<TableRow>, CatalogError> {
        self.tables
            .get_or_try_init(|| async { self.catalog.list_tables().await })
            .await
    }

    async fn row_security(&self) -> Result<&BTreeMap<String, bool>, CatalogError> {
        self.row_security
            .get_or_try_init(|| async { self.catalog.list_row_security(DEFAULT_SCHEMA).await })
            .await
    }
}

fn column_descriptor(row: &ColumnRow) -> ColumnDescriptor {
    ColumnDescriptor {
        name: row.column_name.clone(),
        data_type: row.data_type.clone(),
        nullable: row
            .is_nullable
            .as_deref()
            .map_or(true, |flag| flag.eq_ignore_ascii_case("YES")),
        default_expr: row.column_default.clone(),
    }
}

/// Exact case-insensitive name, then fuzzy match in the default schema, then
/// the first default-schema table whose name looks like it holds moments.
pub fn select_table<'a>(desired: &str, tables: &'a [TableRow]) -> Option<&'a TableRow> {
    if let Some(exact) = tables
        .iter()
        .find(|t| t.table_name.eq_ignore_ascii_case(desired))
    {
        return Some(exact);
    }

    let public = || tables.iter().filter(|t| t.table_schema == DEFAULT_SCHEMA);

    let mut best: Option<(&TableRow, f64)> = None;
    for table in public() {
        let score = weighted_ratio(desired, &table.table_name);
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((table, score));
        }
    }
    if let Some((table, score)) = best {
        if score >= TABLE_MATCH_THRESHOLD {
            return Some(table);
        }
    }

    public().find(|t| SEMANTIC_TABLE.is_match(&t.table_name))
}

/// Maps every canonical field onto at most one column; each column is claimed
/// at most once, first claim wins.
///
/// Fields are resolved in order: canonical name, then synonyms, then the best
/// fuzzy match among unclaimed columns. A column named exactly after some
/// canonical field is never a fuzzy candidate; it belongs to that field.
pub fn build_column_mapping(columns: &[String]) -> IndexMap<CanonicalField, Option<String>> {
    let mut by_lower: HashMap<String, &String> = HashMap::new();
    for column in columns {
        by_lower.entry(column.to_lowercase()).or_insert(column);
    }
    let reserved: HashSet<&str> = CanonicalField::ALL
        .iter()
        .filter_map(|field| by_lower.get(field.as_str()).map(|column| column.as_str()))
        .collect();

    let mut mapping: IndexMap<CanonicalField, Option<String>> = IndexMap::new();
    let mut claimed: HashSet<&str> = HashSet::new();

    for field in CanonicalField::ALL {
        let named = std::iter::once(field.as_str())
            .chain(field.synonyms().iter().copied())
            .filter_map(|candidate| by_lower.get(candidate))
            .find(|column| !claimed.contains(column.as_str()))
            .map(|column| column.as_str());

        let matched = named.or_else(|| {
            let wanted = field.human_readable();
            let mut best: Option<(&str, f64)> = None;
            for column in columns
                .iter()
                .map(String::as_str)
                .filter(|c| !claimed.contains(c) && !reserved.contains(c))
            {
                let score = weighted_ratio(&wanted, column);
                if best.map_or(true, |(_, top)| score > top) {
                    best = Some((column, score));
                }
            }
            best.filter(|(_, score)| *score >= COLUMN_MATCH_THRESHOLD)
                .map(|(column, _)| column)
        });

        if let Some(column) = matched {
            claimed.insert(column);
        }
        mapping.insert(field, matched.map(str::to_string));
    }

    mapping
}

/// Groups flattened constraint rows by constraint name, keeping declaration
/// order. Constraint kinds other than primary key and unique are dropped.
pub fn group_constraints(rows: &[ConstraintColumnRow]) -> IndexMap<String, ConstraintInfo> {
    let mut grouped: IndexMap<String, ConstraintInfo> = IndexMap::new();
    for row in rows {
        let Some(kind) = ConstraintKind::parse(&row.constraint_type) else {
            continue;
        };
        grouped
            .entry(row.constraint_name.clone())
            .or_insert_with(|| ConstraintInfo {
                kind,
                columns: Vec::new(),
            })
            .columns
            .push(row.column_name.clone());
    }
    grouped
}

/// Picks the conflict key: the first preferred field combination that exactly
/// equals a declared constraint, otherwise the first constraint made up solely
/// of mapped columns.
pub fn select_unique_key(
    constraints: &IndexMap<String, ConstraintInfo>,
    mapping: &IndexMap<CanonicalField, Option<String>>,
) -> Option<(String, Vec<String>)> {
    for combination in PREFERRED_UNIQUE_KEYS {
        let resolved: Option<Vec<String>> = combination
            .iter()
            .map(|field| mapping.get(field).cloned().flatten())
            .collect();
        let Some(resolved) = resolved else {
            continue;
        };
        if let Some((name, info)) = constraints.iter().find(|(_, info)| info.columns == resolved) {
            return Some((name.clone(), info.columns.clone()));
        }
    }

    let mapped: HashSet<&str> = mapping.values().flatten().map(String::as_str).collect();
    constraints
        .iter()
        .find(|(_, info)| {
            !info.columns.is_empty() && info.columns.iter().all(|c| mapped.contains(c.as_str()))
        })
        .map(|(name, info)| (name.clone(), info.columns.clone()))
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("row-level security is enabled on {table} and role '{role}' is not service_role")]
    SecurityPrecondition { table: String, role: String },
    #[error("{table} has no usable unique key; refusing a plain insert")]
    NoUsableKey { table: String },
    #[error("upsert still failing with status {status} after {attempts} attempts")]
    TransientWrite {
        attempts: usize,
        status: u16,
        #[source]
        source: WriteError,
    },
    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriterOptions {
    pub dry_run: bool,
    pub backoff: BackoffPolicy,
}

/// Idempotent batch upserts against one discovered table.
pub struct ResilientWriter {
    table: Arc<dyn TableWriter>,
    mapping: Arc<SchemaMapping>,
    role: String,
    options: WriterOptions,
    log: Arc<dyn RunLog>,
    sleeper: Arc<dyn Sleeper>,
}

impl ResilientWriter {
    pub fn new(
        table: Arc<dyn TableWriter>,
        mapping: Arc<SchemaMapping>,
        role: impl Into<String>,
        options: WriterOptions,
        log: Arc<dyn RunLog>,
    ) -> Self {
        Self {
            table,
            mapping,
            role: role.into(),
            options,
            log,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn mapping(&self) -> &SchemaMapping {
        &self.mapping
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn is_dry_run(&self) -> bool {
        self.options.dry_run
    }

    pub async fn upsert_candidates(
        &self,
        candidates: &[CandidateMoment],
    ) -> Result<UpsertOutcome, UpsertError> {
        let table = self.mapping.full_table_name();
        let mut payloads = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let payload = candidate.to_payload(&self.mapping);
            if payload.is_empty() {
                self.log.warn(&format!(
                    "skipping candidate {}: no fields map to columns of {table}",
                    candidate.source_id
                ));
                continue;
            }
            payloads.push(payload);
        }
        if self.mapping.supports_upsert() {
            let submitted = payloads.len();
            payloads = collapse_by_conflict_key(payloads, &self.mapping.on_conflict_columns);
            if payloads.len() < submitted {
                self.log.info(&format!(
                    "collapsed {submitted} payloads to {} distinct conflict keys for {table}",
                    payloads.len()
                ));
            }
        }
        if payloads.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        if self.options.dry_run {
            let sample = &payloads[..payloads.len().min(DRY_RUN_SAMPLE)];
            self.log.info(&format!(
                "DRY-RUN would upsert {} rows into {table} on_conflict=[{}] sample={}",
                payloads.len(),
                self.mapping.on_conflict_columns.join(","),
                serde_json::to_string(sample).unwrap_or_default()
            ));
            return Ok(UpsertOutcome::default());
        }

        if self.mapping.row_security_enabled && self.role != ELEVATED_ROLE {
            self.log.error(&format!(
                "refusing write to {table}: row-level security is on and role is '{}'",
                self.role
            ));
            return Err(UpsertError::SecurityPrecondition {
                table,
                role: self.role.clone(),
            });
        }

        if !self.mapping.supports_upsert() {
            self.log
                .error(&format!("refusing write to {table}: no usable unique key"));
            return Err(UpsertError::NoUsableKey { table });
        }

        let before = self.probe_row_count().await;
        let response = self.execute_with_retry(&payloads).await?;
        let after = self.probe_row_count().await;

        let inserted = response
            .inserted
            .unwrap_or_else(|| after.saturating_sub(before));
        let updated = response
            .updated
            .unwrap_or_else(|| (payloads.len() as u64).saturating_sub(inserted));

        self.log.info(&format!(
            "upserted {} rows into {table}: inserted={inserted} updated={updated}",
            payloads.len()
        ));
        Ok(UpsertOutcome { inserted, updated })
    }

    async fn probe_row_count(&self) -> u64 {
        match self
            .table
            .count_rows(&self.mapping.schema, &self.mapping.table)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                self.log.warn(&format!(
                    "row count probe on {} failed, treating as 0: {err}",
                    self.mapping.full_table_name()
                ));
                0
            }
        }
    }

    async fn execute_with_retry(&self, payloads: &[Payload]) -> Result<UpsertResponse, UpsertError> {
        let policy = self.options.backoff;
        let max_attempts = policy.max_attempts.max(1);
        let table = self.mapping.full_table_name();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let err = match self
                .table
                .upsert(
                    &self.mapping.schema,
                    &self.mapping.table,
                    &self.mapping.on_conflict_columns,
                    payloads,
                )
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            let status = err.status_code();
            let retryable = status
                .map(|code| classify_status(code) == RetryDisposition::Retryable)
                .unwrap_or(false);

            match status {
                Some(status) if retryable => {
                    if attempt >= max_attempts {
                        self.log.error(&format!(
                            "upsert into {table} gave up after {attempt} attempts, last status {status}: {err}"
                        ));
                        return Err(UpsertError::TransientWrite {
                            attempts: attempt,
                            status,
                            source: err,
                        });
                    }
                    let delay = policy.delay_for_attempt(attempt - 1);
                    self.log.warn(&format!(
                        "upsert into {table} returned status {status}, retrying with backoff {:.1}s (attempt {attempt}/{max_attempts})",
                        delay.as_secs_f64()
                    ));
                    self.sleeper.sleep(delay).await;
                }
                _ => {
                    self.log.error(&format!(
                        "upsert into {table} failed (status {}, role {}): {err}",
                        status.map_or_else(|| "n/a".to_string(), |s| s.to_string()),
                        self.role
                    ));
                    return Err(UpsertError::Write(err));
                }
            }
        }
    }
}

/// Keeps one payload per conflict-key tuple: the last one seen, placed where
/// that key first appeared. A single upsert statement cannot touch the same
/// row twice.
pub fn collapse_by_conflict_key(payloads: Vec<Payload>, on_conflict: &[String]) -> Vec<Payload> {
    let mut by_key: IndexMap<String, Payload> = IndexMap::with_capacity(payloads.len());
    for payload in payloads {
        let key = Value::Array(
            on_conflict
                .iter()
                .map(|column| payload.get(column).cloned().unwrap_or(Value::Null))
                .collect(),
        )
        .to_string();
        by_key.insert(key, payload);
    }
    by_key.into_values().collect()
}

#[derive(Debug, Clone)]
pub struct SeedConfig {
    pub supabase_url: String,
    pub service_key: String,
    pub moment_table: String,
    pub dry_run: bool,
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SeedConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let supabase_url = required("SUPABASE_URL");
        let service_key = required("SUPABASE_SERVICE_KEY");

        let (supabase_url, service_key) = match (supabase_url, service_key) {
            (Some(url), Some(key)) => (url, key),
            (url, key) => {
                let mut missing = Vec::new();
                if url.is_none() {
                    missing.push("SUPABASE_URL");
                }
                if key.is_none() {
                    missing.push("SUPABASE_SERVICE_KEY");
                }
                bail!(
                    "missing required environment variables: {}",
                    missing.join(", ")
                );
            }
        };

        let parsed = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Ok(Self {
            supabase_url,
            service_key,
            moment_table: lookup("MOMENT_TABLE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "moments_seed".to_string()),
            dry_run: lookup("WIGG_DRY_RUN")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            max_attempts: usize::try_from(parsed("WIGG_MAX_ATTEMPTS", 5)).unwrap_or(5),
            base_backoff_ms: parsed("WIGG_BASE_BACKOFF_MS", 1000),
            http_timeout_secs: parsed("WIGG_HTTP_TIMEOUT_SECS", 15),
            user_agent: lookup("WIGG_USER_AGENT").unwrap_or_else(|| "wigg-seed/0.1".to_string()),
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: MAX_BACKOFF,
        }
    }

    pub fn http_client(&self) -> Result<PostgrestClient> {
        PostgrestClient::new(
            self.supabase_url.clone(),
            self.service_key.clone(),
            HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
                user_agent: Some(self.user_agent.clone()),
            },
        )
    }

    pub fn role(&self) -> String {
        decode_role(&self.service_key)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed_batches: usize,
    pub candidates: usize,
    pub inserted: u64,
    pub updated: u64,
    pub dry_run: bool,
}

pub struct SeedPipeline {
    writer: ResilientWriter,
    source: Box<dyn RecordSource>,
    log: Arc<dyn RunLog>,
}

impl SeedPipeline {
    pub fn new(writer: ResilientWriter, source: Box<dyn RecordSource>, log: Arc<dyn RunLog>) -> Self {
        Self {
            writer,
            source,
            log,
        }
    }

    /// Writes every non-empty batch in source order; the first writer error
    /// aborts the run.
    pub async fn run_once(&self) -> Result<SeedRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let batches = self
            .source
            .load_batches()
            .with_context(|| format!("loading batches from {}", self.source.source_id()))?;

        let mut totals = UpsertOutcome::default();
        let mut processed_batches = 0usize;
        let mut candidates = 0usize;

        for batch in &batches {
            processed_batches += 1;
            candidates += batch.candidates.len();
            if batch.candidates.is_empty() {
                continue;
            }
            let outcome = self
                .writer
                .upsert_candidates(&batch.candidates)
                .await
                .with_context(|| format!("writing candidates from {}", batch.origin_id))?;
            totals = totals.merge(outcome);
        }

        self.log.info(&format!(
            "run {run_id} finished: batches={processed_batches} candidates={candidates} inserted={} updated={}",
            totals.inserted, totals.updated
        ));

        Ok(SeedRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            processed_batches,
            candidates,
            inserted: totals.inserted,
            updated: totals.updated,
            dry_run: self.writer.is_dry_run(),
        })
    }
}

fn warn_on_role(role: &str, log: &dyn RunLog) {
    if role != ELEVATED_ROLE {
        log.warn(&format!(
            "credential role is '{role}', not {ELEVATED_ROLE}; writes to row-secured tables will be refused"
        ));
    }
}

pub async fn discover_from_config(config: &SeedConfig) -> Result<SchemaMapping> {
    let log: Arc<dyn RunLog> = Arc::new(TracingLog);
    warn_on_role(&config.role(), log.as_ref());
    let client = Arc::new(config.http_client()?);
    let discoverer = SchemaDiscoverer::new(client, log);
    discoverer
        .discover(&config.moment_table)
        .await
        .with_context(|| format!("discovering table for '{}'", config.moment_table))
}

pub async fn run_seed_once(
    config: &SeedConfig,
    source: Box<dyn RecordSource>,
) -> Result<SeedRunSummary> {
    let log: Arc<dyn RunLog> = Arc::new(TracingLog);
    let role = config.role();
    warn_on_role(&role, log.as_ref());

    let client = Arc::new(config.http_client()?);
    let discoverer = SchemaDiscoverer::new(client.clone(), log.clone());
    let mapping = discoverer
        .discover(&config.moment_table)
        .await
        .with_context(|| format!("discovering table for '{}'", config.moment_table))?;

    let writer = ResilientWriter::new(
        client,
        Arc::new(mapping),
        role,
        WriterOptions {
            dry_run: config.dry_run,
            backoff: config.backoff(),
        },
        log.clone(),
    );
    SeedPipeline::new(writer, source, log).run_once().await
}
