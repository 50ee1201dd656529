//! Core domain model for the Wigg moment seeder: canonical fields, discovered
//! schema mappings, and the candidate records written into them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "wigg-core";

/// Role carried by credentials that bypass row-level security.
pub const ELEVATED_ROLE: &str = "service_role";

/// Schema searched by fuzzy and semantic table resolution.
pub const DEFAULT_SCHEMA: &str = "public";

pub const MINUTE_MIN: i32 = 0;
pub const MINUTE_MAX: i32 = 180;

/// Column payload sent to the data endpoint, keyed by real column name.
pub type Payload = Map<String, Value>;

/// Backend-agnostic attribute names of a candidate moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    ContentTitle,
    Season,
    Episode,
    Minute,
    SourceUrl,
    SourceType,
    SourceSubreddit,
    SourceKind,
    SourceId,
    Score,
    Confidence,
    Quote,
    CreatedUtc,
    Status,
}

impl CanonicalField {
    /// Every canonical field in mapping order.
    pub const ALL: [CanonicalField; 14] = [
        CanonicalField::ContentTitle,
        CanonicalField::Season,
        CanonicalField::Episode,
        CanonicalField::Minute,
        CanonicalField::SourceUrl,
        CanonicalField::SourceType,
        CanonicalField::SourceSubreddit,
        CanonicalField::SourceKind,
        CanonicalField::SourceId,
        CanonicalField::Score,
        CanonicalField::Confidence,
        CanonicalField::Quote,
        CanonicalField::CreatedUtc,
        CanonicalField::Status,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::ContentTitle => "content_title",
            CanonicalField::Season => "season",
            CanonicalField::Episode => "episode",
            CanonicalField::Minute => "minute",
            CanonicalField::SourceUrl => "source_url",
            CanonicalField::SourceType => "source_type",
            CanonicalField::SourceSubreddit => "source_subreddit",
            CanonicalField::SourceKind => "source_kind",
            CanonicalField::SourceId => "source_id",
            CanonicalField::Score => "score",
            CanonicalField::Confidence => "confidence",
            CanonicalField::Quote => "quote",
            CanonicalField::CreatedUtc => "created_utc",
            CanonicalField::Status => "status",
        }
    }

    /// Alternative column names tried after the canonical name itself.
    pub fn synonyms(self) -> &'static [&'static str] {
        match self {
            CanonicalField::ContentTitle => &["title", "show_title", "name", "series_title"],
            CanonicalField::Season => &["season_number", "season_num"],
            CanonicalField::Episode => &["ep", "episode_number", "episode_num"],
            CanonicalField::Minute => &["minute_mark", "minute_offset", "minute_at"],
            CanonicalField::SourceUrl => &["url", "permalink"],
            CanonicalField::SourceType => &["type"],
            CanonicalField::SourceSubreddit => &["subreddit"],
            CanonicalField::SourceKind => &["kind"],
            CanonicalField::SourceId => &["external_id", "reddit_id"],
            CanonicalField::Score => &["upvotes"],
            CanonicalField::Confidence => &["confidence_score"],
            CanonicalField::Quote => &["excerpt", "snippet"],
            CanonicalField::CreatedUtc => &["created_at", "timestamp_utc"],
            CanonicalField::Status => &["state"],
        }
    }

    /// Space-separated form used for fuzzy column matching.
    pub fn human_readable(self) -> String {
        self.as_str().replace('_', " ")
    }
}

impl std::fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical field combinations tried as upsert keys, most specific first.
pub const PREFERRED_UNIQUE_KEYS: &[&[CanonicalField]] = &[
    &[
        CanonicalField::SourceId,
        CanonicalField::ContentTitle,
        CanonicalField::Season,
        CanonicalField::Episode,
        CanonicalField::Minute,
    ],
    &[
        CanonicalField::SourceId,
        CanonicalField::ContentTitle,
        CanonicalField::Episode,
    ],
    &[CanonicalField::SourceId, CanonicalField::ContentTitle],
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: Option<String>,
    pub nullable: bool,
    pub default_expr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
}

impl ConstraintKind {
    /// Parses the catalog's `constraint_type` text; other constraint kinds yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PRIMARY KEY" => Some(ConstraintKind::PrimaryKey),
            "UNIQUE" => Some(ConstraintKind::Unique),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub kind: ConstraintKind,
    /// Columns in the constraint's declared order.
    pub columns: Vec<String>,
}

/// Result of discovering one table: where it lives, how canonical fields map
/// onto its columns, and which declared key (if any) makes upserts safe.
///
/// `on_conflict_columns` is non-empty only when every listed column exists in
/// `columns` and together they form the constraint named by
/// `unique_constraint_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub schema: String,
    pub table: String,
    pub columns: IndexMap<String, ColumnDescriptor>,
    pub column_mapping: IndexMap<CanonicalField, Option<String>>,
    pub unique_constraint_name: Option<String>,
    pub on_conflict_columns: Vec<String>,
    pub row_security_enabled: bool,
    pub raw_constraints: IndexMap<String, ConstraintInfo>,
}

impl SchemaMapping {
    pub fn full_table_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    pub fn supports_upsert(&self) -> bool {
        !self.on_conflict_columns.is_empty()
    }

    pub fn column_for(&self, field: CanonicalField) -> Option<&str> {
        self.column_mapping
            .get(&field)
            .and_then(|column| column.as_deref())
    }

    pub fn with_row_security(self, enabled: bool) -> Self {
        Self {
            row_security_enabled: enabled,
            ..self
        }
    }
}

/// A hook moment extracted from source text, ready to be mapped onto a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMoment {
    pub content_title: String,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub minute: Option<i32>,
    pub source_url: String,
    pub source_type: String,
    pub source_subreddit: String,
    pub source_kind: String,
    pub source_id: String,
    pub score: i64,
    pub confidence: f64,
    pub quote: String,
    pub created_utc: i64,
    pub status: String,
}

impl CandidateMoment {
    pub fn field_value(&self, field: CanonicalField) -> Value {
        match field {
            CanonicalField::ContentTitle => Value::from(self.content_title.clone()),
            CanonicalField::Season => Value::from(self.season),
            CanonicalField::Episode => Value::from(self.episode),
            CanonicalField::Minute => Value::from(self.minute.map(clamp_minute)),
            CanonicalField::SourceUrl => Value::from(self.source_url.clone()),
            CanonicalField::SourceType => Value::from(self.source_type.clone()),
            CanonicalField::SourceSubreddit => Value::from(self.source_subreddit.clone()),
            CanonicalField::SourceKind => Value::from(self.source_kind.clone()),
            CanonicalField::SourceId => Value::from(self.source_id.clone()),
            CanonicalField::Score => Value::from(self.score),
            CanonicalField::Confidence => Value::from(self.confidence),
            CanonicalField::Quote => Value::from(self.quote.clone()),
            CanonicalField::CreatedUtc => Value::from(self.created_utc),
            CanonicalField::Status => Value::from(self.status.clone()),
        }
    }

    /// Builds the column payload for `mapping`. Fields without a resolved
    /// column are left out entirely rather than written as null.
    pub fn to_payload(&self, mapping: &SchemaMapping) -> Payload {
        let mut payload = Payload::new();
        for (field, column) in &mapping.column_mapping {
            let Some(column) = column else {
                continue;
            };
            payload.insert(column.clone(), self.field_value(*field));
        }
        payload
    }
}

/// Insert/update counts of one write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertOutcome {
    pub fn merge(self, other: UpsertOutcome) -> Self {
        Self {
            inserted: self.inserted + other.inserted,
            updated: self.updated + other.updated,
        }
    }
}

pub fn clamp_minute(minute: i32) -> i32 {
    minute.clamp(MINUTE_MIN, MINUTE_MAX)
}
