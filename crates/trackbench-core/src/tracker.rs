//! Session tracking, reporting, and run-over-run comparison.
//!
//! Records append to an in-memory session which is flushed to one
//! `session-<token>.json` file per run. The token is a UTC timestamp
//! formatted so lexicographic filename order equals chronological
//! order, which makes "most recent N sessions" a filename sort.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use trackbench_proto::{ConversationRecord, Session, SUCCESS_THRESHOLD};

/// Errors persisting or loading sessions.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Accumulates conversation records for the current run.
pub struct SessionTracker {
    session: Session,
    dir: PathBuf,
}

impl SessionTracker {
    pub fn new(dir: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            session: Session::new(label),
            dir: dir.into(),
        }
    }

    /// Appends a record to the current session. Append-only; records
    /// are never mutated afterwards.
    pub fn track(&mut self, record: ConversationRecord) {
        debug!(input = %record.input, score = record.avg_score, "Tracking conversation");
        self.session.records.push(record);
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Flushes the session to `session-<token>.json` and returns the
    /// written path.
    pub fn save(&self) -> Result<PathBuf, TrackerError> {
        std::fs::create_dir_all(&self.dir)?;
        let token = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let path = self.dir.join(format!("session-{token}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&self.session)?)?;
        info!(path = %path.display(), records = self.session.records.len(), "Session saved");
        Ok(path)
    }

    /// Writes the flat per-run results file (the record list alone).
    pub fn save_results(&self, path: impl AsRef<Path>) -> Result<(), TrackerError> {
        std::fs::write(
            path.as_ref(),
            serde_json::to_string_pretty(&self.session.records)?,
        )?;
        Ok(())
    }

    /// Builds the ranked actionable report for the current session.
    pub fn report(&self, top_issues: usize) -> Report {
        Report::from_session(&self.session, top_issues)
    }

    /// Compares the current session against a previously saved one.
    ///
    /// Read-only on both sides. Records align by case id when both
    /// carry one, falling back to exact input text; records present on
    /// only one side are reported as additions or removals.
    pub fn compare_with_previous(
        &self,
        previous_path: impl AsRef<Path>,
    ) -> Result<SessionComparison, TrackerError> {
        let content = std::fs::read_to_string(previous_path.as_ref())?;
        let previous: Session = serde_json::from_str(&content)?;
        Ok(SessionComparison::between(&previous, &self.session))
    }

    /// Lists saved session files in chronological (= lexicographic)
    /// order.
    pub fn session_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, TrackerError> {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(dir.as_ref()) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("session-") && n.ends_with(".json"))
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        files.sort();
        Ok(files)
    }
}

/// Aggregated view of one session, ranked most-actionable first.
#[derive(Debug, Clone)]
pub struct Report {
    pub total: usize,
    pub successes: usize,
    /// Percentage of successful conversations.
    pub success_rate: f64,
    pub mean_score: f64,
    /// Per-criterion averages across all records.
    pub criterion_averages: Vec<(String, f64)>,
    /// Issue frequency, sorted descending, truncated to top-N.
    pub top_issues: Vec<(String, usize)>,
    /// Below-threshold records, worst first.
    pub needs_attention: Vec<AttentionEntry>,
}

/// One below-threshold record with its actionable notes.
#[derive(Debug, Clone)]
pub struct AttentionEntry {
    pub case_id: Option<String>,
    pub input: String,
    pub avg_score: f64,
    pub issues: Vec<String>,
    pub improvements: Vec<String>,
    pub error: Option<String>,
}

impl Report {
    fn from_session(session: &Session, top_issues: usize) -> Self {
        let total = session.records.len();
        let successes = session.success_count();
        let success_rate = if total == 0 {
            0.0
        } else {
            successes as f64 / total as f64 * 100.0
        };

        // Union of criteria across all records; a record missing a
        // criterion contributes 0 to its average.
        let mut criterion_sums: BTreeMap<String, f64> = BTreeMap::new();
        for record in &session.records {
            for (name, score) in &record.evaluation.scores {
                *criterion_sums.entry(name.clone()).or_insert(0.0) += score;
            }
        }
        let criterion_averages = criterion_sums
            .into_iter()
            .map(|(name, sum)| (name, if total == 0 { 0.0 } else { sum / total as f64 }))
            .collect();

        let mut issue_counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &session.records {
            for issue in &record.evaluation.issues {
                *issue_counts.entry(issue.clone()).or_insert(0) += 1;
            }
        }
        let mut top: Vec<(String, usize)> = issue_counts.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(top_issues);

        let mut needs_attention: Vec<AttentionEntry> = session
            .records
            .iter()
            .filter(|r| !r.success)
            .map(|r| AttentionEntry {
                case_id: r.case_id.clone(),
                input: r.input.clone(),
                avg_score: r.avg_score,
                issues: r.evaluation.issues.clone(),
                improvements: r.evaluation.improvements.clone(),
                error: r.error.clone(),
            })
            .collect();
        needs_attention.sort_by(|a, b| {
            a.avg_score
                .partial_cmp(&b.avg_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Self {
            total,
            successes,
            success_rate,
            mean_score: session.mean_score(),
            criterion_averages,
            top_issues: top,
            needs_attention,
        }
    }

    /// Renders the report as display text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Actionable Report ===");
        let _ = writeln!(out, "Total conversations: {}", self.total);
        let _ = writeln!(
            out,
            "Successful (>={SUCCESS_THRESHOLD:.0}/10): {} ({:.1}%)",
            self.successes, self.success_rate
        );
        let _ = writeln!(out, "Average score: {:.1}/10", self.mean_score);

        if !self.criterion_averages.is_empty() {
            let _ = writeln!(out, "\n=== Category Breakdown ===");
            for (name, avg) in &self.criterion_averages {
                let _ = writeln!(out, "{name}: {avg:.1}/10");
            }
        }

        if !self.top_issues.is_empty() {
            let _ = writeln!(out, "\n=== Most Frequent Issues ===");
            for (issue, count) in &self.top_issues {
                let _ = writeln!(out, "- {issue} ({count} times)");
            }
        }

        if !self.needs_attention.is_empty() {
            let _ = writeln!(out, "\n=== Needs Attention (worst first) ===");
            for entry in &self.needs_attention {
                let _ = writeln!(out, "[{:.1}/10] \"{}\"", entry.avg_score, entry.input);
                if let Some(error) = &entry.error {
                    let _ = writeln!(out, "    error: {error}");
                }
                for issue in &entry.issues {
                    let _ = writeln!(out, "    issue: {issue}");
                }
                for improvement in &entry.improvements {
                    let _ = writeln!(out, "    improve: {improvement}");
                }
            }
        }

        out
    }
}

/// Result of comparing two sessions.
#[derive(Debug, Clone)]
pub struct SessionComparison {
    /// Records present in both sessions, with score deltas.
    pub deltas: Vec<CaseDelta>,
    /// Inputs present only in the current session.
    pub additions: Vec<String>,
    /// Inputs present only in the previous session.
    pub removals: Vec<String>,
    pub previous_mean: f64,
    pub current_mean: f64,
    pub mean_delta: f64,
}

/// Score movement for one matched record.
#[derive(Debug, Clone)]
pub struct CaseDelta {
    pub input: String,
    pub previous: f64,
    pub current: f64,
    pub delta: f64,
}

impl SessionComparison {
    fn between(previous: &Session, current: &Session) -> Self {
        struct PrevEntry<'a> {
            record: &'a ConversationRecord,
            used: bool,
        }

        let mut pool: Vec<PrevEntry<'_>> = previous
            .records
            .iter()
            .map(|record| PrevEntry {
                record,
                used: false,
            })
            .collect();

        let mut deltas = Vec::new();
        let mut additions = Vec::new();

        for record in &current.records {
            // Prefer the stable id; fall back to exact input text.
            let matched_idx = pool
                .iter()
                .position(|entry| {
                    !entry.used
                        && record.case_id.is_some()
                        && entry.record.case_id == record.case_id
                })
                .or_else(|| {
                    pool.iter()
                        .position(|entry| !entry.used && entry.record.input == record.input)
                });

            match matched_idx.map(|idx| &mut pool[idx]) {
                Some(entry) => {
                    entry.used = true;
                    deltas.push(CaseDelta {
                        input: record.input.clone(),
                        previous: entry.record.avg_score,
                        current: record.avg_score,
                        delta: record.avg_score - entry.record.avg_score,
                    });
                }
                None => additions.push(record.input.clone()),
            }
        }

        let removals = pool
            .iter()
            .filter(|entry| !entry.used)
            .map(|entry| entry.record.input.clone())
            .collect();

        let previous_mean = previous.mean_score();
        let current_mean = current.mean_score();

        Self {
            deltas,
            additions,
            removals,
            previous_mean,
            current_mean,
            mean_delta: current_mean - previous_mean,
        }
    }

    /// Renders the comparison as display text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Session Comparison ===");
        let _ = writeln!(
            out,
            "Average score: {:.1} -> {:.1} ({:+.1})",
            self.previous_mean, self.current_mean, self.mean_delta
        );

        for delta in &self.deltas {
            let _ = writeln!(
                out,
                "{:+.1} [{:.1} -> {:.1}] \"{}\"",
                delta.delta, delta.previous, delta.current, delta.input
            );
        }
        for input in &self.additions {
            let _ = writeln!(out, "added: \"{input}\"");
        }
        for input in &self.removals {
            let _ = writeln!(out, "removed: \"{input}\"");
        }

        out
    }
}
