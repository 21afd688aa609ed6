//! Indexing job records and the partial progress events that update them.
//!
//! A [`JobHandle`] is the client's view of one server-side indexing run.
//! Full snapshots arrive from the REST endpoints as [`JobRecord`]s and are
//! normalised into handles; incremental [`ProgressEvent`]s arrive from the
//! live channel and are merged field by field with [`JobHandle::merge`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of files found under the root after exclusions.
pub const STAT_FILES_DISCOVERED: &str = "filesDiscovered";

/// Number of files successfully parsed.
pub const STAT_FILES_PARSED: &str = "filesParsed";

/// Number of files skipped (unsupported or unreadable).
pub const STAT_FILES_SKIPPED: &str = "filesSkipped";

/// Number of code chunks produced by the chunker.
pub const STAT_CHUNKS_PRODUCED: &str = "chunksProduced";

/// Number of documents written to the vector index.
pub const STAT_DOCUMENTS_INDEXED: &str = "documentsIndexed";

/// Number of embeddings computed.
pub const STAT_EMBEDDINGS_GENERATED: &str = "embeddingsGenerated";

/// Number of per-file errors. Only present on full snapshots.
pub const STAT_ERROR_COUNT: &str = "errorCount";

/// Counters carried by live progress events.
pub const PROGRESS_COUNTERS: [&str; 6] = [
    STAT_FILES_DISCOVERED,
    STAT_FILES_PARSED,
    STAT_FILES_SKIPPED,
    STAT_CHUNKS_PRODUCED,
    STAT_DOCUMENTS_INDEXED,
    STAT_EMBEDDINGS_GENERATED,
];

/// Progress value at which a job is finished regardless of status.
pub const COMPLETE_PERCENT: u8 = 100;

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an indexing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    /// The backend reports successful runs as `SUCCESS`.
    #[serde(alias = "SUCCESS")]
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the job can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Client-side record of one indexing job.
///
/// Deserializes from the backend's job JSON through [`JobRecord`], which
/// tolerates the field-name variants different endpoints use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "JobRecord")]
pub struct JobHandle {
    pub id: JobId,
    pub status: JobStatus,
    /// Completion percentage in `0..=100`.
    pub progress_percent: u8,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    /// Named counters (see the `STAT_*` constants).
    pub stats: BTreeMap<String, u64>,
}

impl JobHandle {
    /// A freshly observed job with nothing known beyond its id.
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            progress_percent: 0,
            started_at: None,
            ended_at: None,
            stats: BTreeMap::new(),
        }
    }

    /// A job is terminal once it reports 100% or a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.progress_percent >= COMPLETE_PERCENT || self.status.is_terminal()
    }

    /// Look up a named counter.
    pub fn stat(&self, name: &str) -> Option<u64> {
        self.stats.get(name).copied()
    }

    /// Overwrite the fields present in `event`, leaving every other field
    /// untouched.
    pub fn merge(&mut self, event: &ProgressEvent) {
        if let Some(status) = event.status {
            self.status = status;
        }
        if let Some(percent) = event.percent {
            self.progress_percent = percent;
        }
        for (name, value) in &event.counters {
            self.stats.insert((*name).to_string(), *value);
        }
    }
}

/// Raw job JSON as returned by the `jobs` endpoints.
///
/// Counters may be nested under `stats` or appear at the top level; the
/// top-level values win when both are present.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default, alias = "progressPercent")]
    pub progress: Option<f64>,
    #[serde(default, alias = "startTime")]
    pub started_at: Option<Timestamp>,
    #[serde(default, alias = "endTime")]
    pub ended_at: Option<Timestamp>,
    #[serde(default)]
    pub stats: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<JobRecord> for JobHandle {
    type Error = CoreError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        let status = record.status.unwrap_or(JobStatus::Pending);

        let progress_percent = match record.progress {
            Some(value) => validate_percent(value)?,
            None if status == JobStatus::Completed => COMPLETE_PERCENT,
            None => 0,
        };

        let mut stats = BTreeMap::new();
        for (name, value) in record.stats.iter().flatten() {
            if let Some(count) = as_count(value) {
                stats.insert(name.clone(), count);
            }
        }
        for name in PROGRESS_COUNTERS.iter().chain(std::iter::once(&STAT_ERROR_COUNT)) {
            if let Some(count) = record.extra.get(*name).and_then(as_count) {
                stats.insert((*name).to_string(), count);
            }
        }

        Ok(Self {
            id: record.id,
            status,
            progress_percent,
            started_at: record.started_at,
            ended_at: record.ended_at,
            stats,
        })
    }
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// Progress message exactly as it arrives on the live channel.
///
/// Every field is optional; unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProgressEvent {
    pub job_id: Option<JobId>,
    pub status: Option<JobStatus>,
    pub percent: Option<f64>,
    pub files_discovered: Option<u64>,
    pub files_parsed: Option<u64>,
    pub files_skipped: Option<u64>,
    pub chunks_produced: Option<u64>,
    pub documents_indexed: Option<u64>,
    pub embeddings_generated: Option<u64>,
}

/// A validated partial update for a single job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressEvent {
    /// Job the event was published for, when the server says so.
    pub job_id: Option<JobId>,
    pub status: Option<JobStatus>,
    pub percent: Option<u8>,
    /// Counters present in the message, keyed by `STAT_*` name.
    pub counters: BTreeMap<&'static str, u64>,
}

impl ProgressEvent {
    /// Parse and validate one live-channel payload.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let raw: RawProgressEvent =
            serde_json::from_str(text).map_err(|e| CoreError::Malformed(e.to_string()))?;
        Self::try_from(raw)
    }

    /// Whether applying this event finishes the job.
    pub fn is_terminal(&self) -> bool {
        self.percent.is_some_and(|p| p >= COMPLETE_PERCENT)
            || self.status.is_some_and(JobStatus::is_terminal)
    }
}

impl TryFrom<RawProgressEvent> for ProgressEvent {
    type Error = CoreError;

    fn try_from(raw: RawProgressEvent) -> Result<Self, Self::Error> {
        let percent = raw.percent.map(validate_percent).transpose()?;

        let counters = [
            (STAT_FILES_DISCOVERED, raw.files_discovered),
            (STAT_FILES_PARSED, raw.files_parsed),
            (STAT_FILES_SKIPPED, raw.files_skipped),
            (STAT_CHUNKS_PRODUCED, raw.chunks_produced),
            (STAT_DOCUMENTS_INDEXED, raw.documents_indexed),
            (STAT_EMBEDDINGS_GENERATED, raw.embeddings_generated),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect();

        Ok(Self {
            job_id: raw.job_id,
            status: raw.status,
            percent,
            counters,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Validate a completion percentage and truncate it to a whole number.
///
/// Values above 100 are clamped to 100. Fractions are rounded down so only
/// a report of at least 100 reads as complete.
pub fn validate_percent(value: f64) -> Result<u8, CoreError> {
    if value.is_nan() || value < 0.0 {
        return Err(CoreError::Validation(format!(
            "Progress percent must be a non-negative number, got {value}"
        )));
    }
    Ok(value.min(100.0).floor() as u8)
}

fn as_count(value: &serde_json::Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f.round() as u64)
    })
}
