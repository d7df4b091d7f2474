//! Conversation records, evaluation scores, and sessions.
//!
//! A `ConversationRecord` is the unit of tracked history: one test
//! case's trip through the pipeline, immutable once appended to the
//! current `Session`. Sessions are persisted one file per run and
//! compared across runs by the tracker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Aggregate score at or above this value marks a conversation
/// successful (0-10 scale).
pub const SUCCESS_THRESHOLD: f64 = 7.0;

/// One tool dispatched to the worker, with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub success: bool,
}

impl ToolInvocation {
    /// Records a successful invocation.
    pub fn succeeded(tool: impl Into<String>, arguments: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            result: Some(result),
            error: None,
            success: true,
        }
    }

    /// Records a failed invocation.
    pub fn failed(tool: impl Into<String>, arguments: serde_json::Value, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            result: None,
            error: Some(error.into()),
            success: false,
        }
    }

    /// Human-readable outcome line, used when asking the resolution
    /// service for a follow-up message.
    pub fn outcome_summary(&self) -> String {
        if self.success {
            let result = self
                .result
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "null".to_string());
            format!("Tool {} executed successfully: {}", self.tool, result)
        } else {
            format!(
                "Tool {} failed: {}",
                self.tool,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// Rubric-keyed quality scores plus the judge's qualitative notes.
///
/// The rubric's criterion names are configuration, not structure: the
/// map holds whatever criteria the harness was configured with, and the
/// aggregate is the arithmetic mean over them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationScores {
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
}

impl EvaluationScores {
    /// Issue entry recorded when the judge's reply cannot be parsed.
    pub const PARSE_FAILURE_ISSUE: &'static str = "evaluation parsing failed";

    /// Sentinel scores substituted when evaluation parsing fails:
    /// no criteria (aggregate 0) and a distinct, reportable issue.
    pub fn parsing_failed() -> Self {
        Self {
            scores: BTreeMap::new(),
            issues: vec![Self::PARSE_FAILURE_ISSUE.to_string()],
            improvements: Vec::new(),
        }
    }

    /// Arithmetic mean over the rubric criteria; 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.values().sum::<f64>() / self.scores.len() as f64
    }

    /// Parses a judge reply against the configured rubric.
    ///
    /// The reply is expected to be a JSON object, possibly wrapped in
    /// markdown code fences. Each rubric criterion is read as a number
    /// (missing criteria score 0); `issues` and `improvements` arrays
    /// are carried over. Any reply that does not parse into an object
    /// yields the sentinel instead: evaluation-parsing failure must be
    /// visible in the report but must never crash the run.
    pub fn parse_reply(content: &str, rubric: &[String]) -> Self {
        let stripped = content.replace("```json", "").replace("```", "");
        let Ok(value) = serde_json::from_str::<serde_json::Value>(stripped.trim()) else {
            return Self::parsing_failed();
        };
        if !value.is_object() {
            return Self::parsing_failed();
        }

        let mut scores = BTreeMap::new();
        for criterion in rubric {
            let score = value.get(criterion).and_then(|v| v.as_f64()).unwrap_or(0.0);
            scores.insert(criterion.clone(), score);
        }

        Self {
            scores,
            issues: string_array(&value, "issues"),
            improvements: string_array(&value, "improvements"),
        }
    }
}

/// Reads a string array field, ignoring non-string entries.
fn string_array(value: &serde_json::Value, field: &str) -> Vec<String> {
    value
        .get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// The unit of tracked history: one test case through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationRecord {
    /// Stable test-case identifier, when the case declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_intent: Option<String>,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    #[serde(default)]
    pub evaluation: EvaluationScores,
    pub avg_score: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl ConversationRecord {
    /// A record for a conversation that failed before evaluation:
    /// aggregate score 0, success false, the error preserved.
    pub fn failed(
        case_id: Option<String>,
        input: impl Into<String>,
        expected_intent: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            case_id,
            input: input.into(),
            expected_intent,
            tool_invocations: Vec::new(),
            final_response: None,
            evaluation: EvaluationScores::default(),
            avg_score: 0.0,
            success: false,
            error: Some(error.into()),
            timestamp: now_timestamp(),
        }
    }
}

/// One harness run's ordered collection of conversation records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub label: String,
    pub created_at: String,
    #[serde(default)]
    pub records: Vec<ConversationRecord>,
}

impl Session {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            created_at: now_timestamp(),
            records: Vec::new(),
        }
    }

    /// Mean aggregate score across all records; 0 for an empty session.
    pub fn mean_score(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().map(|r| r.avg_score).sum::<f64>() / self.records.len() as f64
    }

    pub fn success_count(&self) -> usize {
        self.records.iter().filter(|r| r.success).count()
    }
}

/// Current UTC time as an RFC 3339 string.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
