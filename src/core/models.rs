use crate::core::error::{ErrorKind, PipelineError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub url: String,
    pub title: String,
    pub source_id: String,
    pub category: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: Option<String>,
    pub body_text: String,
}

/// Dialogue covering one article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSegment {
    pub article_ref: String,
    pub article_title: String,
    /// Position of the source article in the input list, 0-based.
    pub ordinal: usize,
    pub dialogue_text: String,
    pub summary_text: String,
}

/// Connective narration: opening, one transition per adjacent segment pair, closing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeFramework {
    pub opening_text: String,
    pub transitions: Vec<String>,
    pub closing_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeScript {
    pub full_text: String,
    pub segment_count: usize,
    pub source_article_refs: Vec<String>,
    pub segments: Vec<ScriptSegment>,
}

/// One published episode as it appears in the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode_id: String,
    pub guid: String,
    pub title: String,
    pub description: String,
    pub publish_date: DateTime<Utc>,
    pub duration_seconds: Option<u64>,
    pub file_size_bytes: u64,
    pub audio_url: String,
    #[serde(default)]
    pub episode_number: Option<u32>,
    #[serde(default)]
    pub author: Option<String>,
}

impl EpisodeRecord {
    pub fn episode_id_for(show_name: &str, date: NaiveDate) -> String {
        format!("{}-{}", slugify(show_name), date.format("%Y-%m-%d"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collect,
    Dedup,
    Script,
    Audio,
    Feed,
    Upload,
    Record,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::Dedup => "dedup",
            Stage::Script => "script",
            Stage::Audio => "audio",
            Stage::Feed => "feed",
            Stage::Upload => "upload",
            Stage::Record => "record",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub millis: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(stage: Stage, err: &PipelineError) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one run. Paths and URLs are only set for artifacts that exist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub episode_id: Option<String>,
    pub articles_collected: usize,
    pub articles_used: usize,
    pub completed_stages: Vec<Stage>,
    pub script_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub job_path: Option<PathBuf>,
    pub feed_path: Option<PathBuf>,
    pub script_url: Option<String>,
    pub audio_url: Option<String>,
    pub feed_url: Option<String>,
    pub timings: Vec<StageTiming>,
    pub duration_millis: u64,
    pub error: Option<ErrorDetail>,
}

impl PipelineResult {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }
}

/// Lowercase ASCII slug used in object keys and episode ids.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "show".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("The Daily Byte"), "the-daily-byte");
        assert_eq!(slugify("  AI & Security: Weekly!  "), "ai-security-weekly");
        assert_eq!(slugify("日本"), "show");
    }

    #[test]
    fn test_episode_id_is_date_partitioned() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(
            EpisodeRecord::episode_id_for("Signal Check", date),
            "signal-check-2026-03-09"
        );
    }

    #[test]
    fn test_result_serializes_error_kind() {
        let result = PipelineResult {
            error: Some(ErrorDetail::new(
                Stage::Audio,
                &PipelineError::Timeout {
                    what: "job".to_string(),
                    waited_secs: 5,
                },
            )),
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"]["kind"], "timeout");
        assert_eq!(json["error"]["stage"], "audio");
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    }
}
