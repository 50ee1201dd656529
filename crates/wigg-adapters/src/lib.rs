//! Record sources: turn exported discussion threads into candidate hook moments.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wigg_core::{clamp_minute, CandidateMoment};

pub const CRATE_NAME: &str = "wigg-adapters";

pub const REDDIT_SOURCE_ID: &str = "reddit";
pub const NEEDS_REVIEW_STATUS: &str = "needs_review";

const MAX_COMMENTS_PER_SUBMISSION: usize = 200;
const SNIPPET_LENGTH: usize = 240;
const MAX_CONFIDENCE: f64 = 0.95;

const HOOK_PHRASES: &[&str] = &[
    "gets good",
    "get good",
    "picks up",
    "clicks",
    "worth it after",
    "starts being good",
    "really starts",
    "turns around",
    "hooks you",
    "it hooked me at",
    "kept watching after",
];

static SEASON_EPISODE_SHORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bS(\d{1,2})E(\d{1,3})\b").expect("static regex"));
static SEASON_EPISODE_LONG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSeason\s*(\d{1,2})\s*Episode\s*(\d{1,3})\b").expect("static regex")
});
static SEASON_X_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})x(\d{1,3})\b").expect("static regex"));
static EPISODE_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bEp(?:isode)?\s*(\d{1,3})\b").expect("static regex"));
static MINUTE_MARKS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)\b(\d{1,3})\s*min(?:ute)?s?\b").expect("static regex"),
        Regex::new(r"(?i)\bat\s*(\d{1,3})\s*min\b").expect("static regex"),
    ]
});
static BRACKETED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[.*?\]").expect("static regex"));
static PARENTHESISED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(.*?\)").expect("static regex"));
static QUESTION_PHRASING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)when does|does|get good|when will|when did|it get good|does it|worth it|pick up|picks up",
    )
    .expect("static regex")
});
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Candidates extracted from one source thread, written together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateBatch {
    pub origin_id: String,
    pub candidates: Vec<CandidateMoment>,
}

pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Batches in source order; one per thread.
    fn load_batches(&self) -> Result<Vec<CandidateBatch>, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionDump {
    pub submissions: Option<Vec<SourceSubmission>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSubmission {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub comments: Vec<SourceComment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceComment {
    pub id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub created_utc: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMoment {
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub minute: Option<i32>,
    pub confidence: f64,
    pub quote: String,
}

/// Reads an exported JSON dump of Reddit submissions and their comments.
#[derive(Debug, Clone)]
pub struct RedditDumpSource {
    path: PathBuf,
    since: Option<DateTime<Utc>>,
}

impl RedditDumpSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            since: None,
        }
    }

    /// Drops submissions created before `since`.
    pub fn with_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for RedditDumpSource {
    fn source_id(&self) -> &'static str {
        REDDIT_SOURCE_ID
    }

    fn load_batches(&self) -> Result<Vec<CandidateBatch>, AdapterError> {
        let dump: SubmissionDump = read_json_file(&self.path)?;
        let submissions = dump.submissions.ok_or_else(|| {
            AdapterError::Message(format!("{} has no submissions array", self.path.display()))
        })?;
        let since_ts = self.since.map(|since| since.timestamp());
        Ok(submissions
            .iter()
            .filter(|submission| {
                since_ts.map_or(true, |since| (submission.created_utc as i64) >= since)
            })
            .map(|submission| CandidateBatch {
                origin_id: submission.id.clone(),
                candidates: candidates_for_submission(submission),
            })
            .collect())
    }
}

pub fn load_submission_dump(path: impl AsRef<Path>) -> Result<SubmissionDump> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Moments from the submission text first, then from up to 200 comments.
/// Comment confidence gets a bonus from the comment's score.
pub fn candidates_for_submission(submission: &SourceSubmission) -> Vec<CandidateMoment> {
    let content_title = normalize_show_title(&submission.title);
    let mut candidates = Vec::new();

    let text = format!("{}\n{}", submission.title, submission.selftext);
    for moment in extract_moments(&text) {
        let confidence = moment.confidence;
        candidates.push(build_candidate(
            &content_title,
            moment,
            confidence,
            SourceRef {
                kind: "submission",
                id: &submission.id,
                permalink: &submission.permalink,
                subreddit: &submission.subreddit,
                score: submission.score,
                created_utc: submission.created_utc,
            },
        ));
    }

    for comment in submission.comments.iter().take(MAX_COMMENTS_PER_SUBMISSION) {
        let bonus = comment.score.clamp(0, 50) as f64 / 400.0;
        for moment in extract_moments(&comment.body) {
            let confidence = (moment.confidence + bonus).min(MAX_CONFIDENCE);
            candidates.push(build_candidate(
                &content_title,
                moment,
                confidence,
                SourceRef {
                    kind: "comment",
                    id: &comment.id,
                    permalink: &comment.permalink,
                    subreddit: &comment.subreddit,
                    score: comment.score,
                    created_utc: comment.created_utc,
                },
            ));
        }
    }

    candidates
}

struct SourceRef<'a> {
    kind: &'static str,
    id: &'a str,
    permalink: &'a str,
    subreddit: &'a str,
    score: i64,
    created_utc: f64,
}

fn build_candidate(
    content_title: &str,
    moment: ExtractedMoment,
    confidence: f64,
    source: SourceRef<'_>,
) -> CandidateMoment {
    CandidateMoment {
        content_title: content_title.to_string(),
        season: moment.season,
        episode: moment.episode,
        minute: moment.minute,
        source_url: format!("https://www.reddit.com{}", source.permalink),
        source_type: REDDIT_SOURCE_ID.to_string(),
        source_subreddit: source.subreddit.to_string(),
        source_kind: source.kind.to_string(),
        source_id: source.id.to_string(),
        score: source.score,
        confidence: (confidence * 1000.0).round() / 1000.0,
        quote: moment.quote,
        created_utc: source.created_utc as i64,
        status: NEEDS_REVIEW_STATUS.to_string(),
    }
}

/// Finds season/episode and minute references in free text.
///
/// Each season/episode hit becomes one moment sharing the averaged minute;
/// text with only minute hits yields a single minute-only moment.
pub fn extract_moments(text: &str) -> Vec<ExtractedMoment> {
    let lowered = text.to_lowercase();
    let has_hook_phrase = HOOK_PHRASES.iter().any(|phrase| lowered.contains(phrase));

    let mut hits: Vec<(Option<i32>, Option<i32>)> = Vec::new();
    for pattern in [&*SEASON_EPISODE_SHORT, &*SEASON_EPISODE_LONG, &*SEASON_X_EPISODE] {
        for caps in pattern.captures_iter(text) {
            hits.push((capture_number(&caps, 1), capture_number(&caps, 2)));
        }
    }
    for caps in EPISODE_ONLY.captures_iter(text) {
        hits.push((None, capture_number(&caps, 1)));
    }

    let minutes: Vec<i32> = MINUTE_MARKS
        .iter()
        .flat_map(|pattern| {
            pattern
                .captures_iter(text)
                .filter_map(|caps| capture_number(&caps, 1))
                .collect::<Vec<_>>()
        })
        .collect();

    if hits.is_empty() && minutes.is_empty() {
        return Vec::new();
    }

    let minute = if minutes.is_empty() {
        None
    } else {
        let total: i64 = minutes.iter().map(|m| i64::from(*m)).sum();
        Some(clamp_minute((total / minutes.len() as i64) as i32))
    };
    let base_confidence = if has_hook_phrase { 0.5 } else { 0.3 };
    let confidence = if minute.is_some() {
        (base_confidence + 0.1_f64).min(MAX_CONFIDENCE)
    } else {
        base_confidence
    };
    let quote = snippet(text);

    if hits.is_empty() {
        hits.push((None, None));
    }
    hits.into_iter()
        .map(|(season, episode)| ExtractedMoment {
            season,
            episode,
            minute,
            confidence,
            quote: quote.clone(),
        })
        .collect()
}

fn capture_number(caps: &regex::Captures<'_>, index: usize) -> Option<i32> {
    caps.get(index).and_then(|m| m.as_str().parse().ok())
}

/// Isolates a show name from a "when does X get good?" style title.
pub fn normalize_show_title(title: &str) -> String {
    let text = BRACKETED.replace_all(title, "");
    let text = PARENTHESISED.replace_all(&text, "");
    let text = text.replace('?', " ");
    let text = QUESTION_PHRASING.replace_all(&text, " ");
    let text = WHITESPACE.replace_all(&text, " ");
    let text = text.trim_matches(|c: char| matches!(c, ' ' | '-' | ':' | '.'));

    text.split(' ')
        .filter(|word| !word.is_empty())
        .map(capitalize_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize_word(word: &str) -> String {
    let has_cased = word.chars().any(char::is_alphabetic);
    let all_upper = has_cased && !word.chars().any(char::is_lowercase);
    if all_upper {
        return word.to_string();
    }
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Whitespace-collapsed excerpt, truncated to 240 characters.
pub fn snippet(text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(text, " ");
    let collapsed = collapsed.trim();
    if collapsed.chars().count() > SNIPPET_LENGTH {
        let mut cut: String = collapsed.chars().take(SNIPPET_LENGTH - 1).collect();
        cut.push('…');
        cut
    } else {
        collapsed.to_string()
    }
}
