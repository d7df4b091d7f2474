//! Sequential suite execution.
//!
//! Test cases run strictly one at a time with a fixed delay between
//! them for external rate limiting. The per-case boundary is absolute:
//! `run_case` cannot fail, and an optional overall deadline turns an
//! overrunning conversation into a failed record rather than an error.

use std::time::Duration;

use tracing::info;

use trackbench_proto::ConversationRecord;

use crate::cases::TestCase;
use crate::pipeline::ConversationPipeline;
use crate::tracker::SessionTracker;

/// Suite-level timing options.
#[derive(Debug, Clone)]
pub struct SuiteOptions {
    /// Delay between consecutive cases.
    pub inter_case_delay: Duration,
    /// Optional overall deadline per conversation.
    pub conversation_timeout: Option<Duration>,
}

impl Default for SuiteOptions {
    fn default() -> Self {
        Self {
            inter_case_delay: Duration::from_millis(1000),
            conversation_timeout: None,
        }
    }
}

/// Runs every case through the pipeline, tracking each record.
///
/// The observer is called after each case with its index and record;
/// the CLI uses it to drive progress display.
pub async fn run_suite(
    pipeline: &ConversationPipeline<'_>,
    cases: &[TestCase],
    tracker: &mut SessionTracker,
    options: &SuiteOptions,
    mut observer: impl FnMut(usize, &ConversationRecord),
) {
    for (index, case) in cases.iter().enumerate() {
        let record = match options.conversation_timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, pipeline.run_case(case)).await {
                    Ok(record) => record,
                    Err(_) => ConversationRecord::failed(
                        case.id.clone(),
                        &case.input,
                        case.expected_intent.clone(),
                        format!("conversation deadline of {}s exceeded", deadline.as_secs()),
                    ),
                }
            }
            None => pipeline.run_case(case).await,
        };

        info!(
            input = %case.input,
            score = record.avg_score,
            success = record.success,
            "Case finished"
        );
        observer(index, &record);
        tracker.track(record);

        if index + 1 < cases.len() {
            tokio::time::sleep(options.inter_case_delay).await;
        }
    }
}
