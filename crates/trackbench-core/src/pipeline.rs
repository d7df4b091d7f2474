//! The conversation pipeline state machine.
//!
//! One test case moves through intent resolution, zero-or-more tool
//! executions, an optional follow-up round, and evaluation, ending in a
//! `ConversationRecord`. Each stage returns a result value and the
//! pipeline branches on it at the stage boundary: a tool failure is
//! recorded and execution continues; a service failure fails the
//! conversation; nothing a single conversation does can abort the
//! suite.

use std::time::Duration;

use tracing::{debug, info, warn};

use trackbench_adapters::{ChatApi, ChatError, ToolTransport};
use trackbench_proto::{
    now_timestamp, AssistantReply, ChatMessage, ChatRequest, ConversationRecord,
    EvaluationScores, ToolCallRequest, ToolInvocation, ToolSpec, SUCCESS_THRESHOLD,
};

use crate::cases::TestCase;
use crate::config::RubricCriterion;

/// Settings the pipeline needs from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Model for the resolution and follow-up rounds.
    pub model: String,
    /// Model for the evaluation round.
    pub eval_model: String,
    /// Instruction text for the resolution round.
    pub system_prompt: String,
    /// Declared tool catalog sent with resolution requests.
    pub tools: Vec<ToolSpec>,
    /// Evaluation rubric.
    pub rubric: Vec<RubricCriterion>,
    /// Per-RPC-call timeout.
    pub rpc_timeout: Duration,
}

/// A stage failure that fails the whole conversation.
///
/// Tool-level failures never appear here; they become failed
/// `ToolInvocation`s and the conversation continues.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("intent resolution failed: {0}")]
    Intent(#[source] ChatError),

    #[error("follow-up resolution failed: {0}")]
    FollowUp(#[source] ChatError),

    #[error("evaluation failed: {0}")]
    Evaluation(#[source] ChatError),
}

/// Drives one conversation per test case.
pub struct ConversationPipeline<'a> {
    chat: &'a dyn ChatApi,
    transport: &'a dyn ToolTransport,
    settings: PipelineSettings,
}

impl<'a> ConversationPipeline<'a> {
    pub fn new(
        chat: &'a dyn ChatApi,
        transport: &'a dyn ToolTransport,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            chat,
            transport,
            settings,
        }
    }

    /// Runs one test case to a record.
    ///
    /// Never fails: a stage error produces a failed record with
    /// aggregate score 0 so the suite can continue.
    pub async fn run_case(&self, case: &TestCase) -> ConversationRecord {
        info!(input = %case.input, "Testing conversation");

        match self.try_run(case).await {
            Ok(record) => record,
            Err(e) => {
                warn!(input = %case.input, error = %e, "Conversation failed");
                ConversationRecord::failed(
                    case.id.clone(),
                    &case.input,
                    case.expected_intent.clone(),
                    e.to_string(),
                )
            }
        }
    }

    async fn try_run(&self, case: &TestCase) -> Result<ConversationRecord, StageError> {
        let reply = self.resolve_intent(&case.input).await?;

        let mut invocations = Vec::with_capacity(reply.tool_calls.len());
        for call in &reply.tool_calls {
            let invocation = self.execute_tool(call).await;
            debug!(
                tool = %invocation.tool,
                success = invocation.success,
                "Tool invocation finished"
            );
            invocations.push(invocation);
        }

        let final_response = if reply.has_content() {
            reply.content.clone()
        } else if invocations.is_empty() {
            None
        } else {
            self.follow_up(&case.input, &invocations).await?
        };

        let evaluation = self
            .evaluate(case, &invocations, final_response.as_deref())
            .await?;
        let avg_score = evaluation.mean();

        Ok(ConversationRecord {
            case_id: case.id.clone(),
            input: case.input.clone(),
            expected_intent: case.expected_intent.clone(),
            tool_invocations: invocations,
            final_response,
            evaluation,
            avg_score,
            success: avg_score >= SUCCESS_THRESHOLD,
            error: None,
            timestamp: now_timestamp(),
        })
    }

    /// Resolution round: input + instruction text + declared catalog.
    async fn resolve_intent(&self, input: &str) -> Result<AssistantReply, StageError> {
        let request = ChatRequest::new(
            &self.settings.model,
            vec![
                ChatMessage::system(&self.settings.system_prompt),
                ChatMessage::user(input),
            ],
            0.1,
        )
        .with_tools(self.settings.tools.clone());

        self.chat.complete(request).await.map_err(StageError::Intent)
    }

    /// Dispatches one requested tool call through the RPC channel.
    ///
    /// Argument payloads arrive JSON-encoded; a payload that fails to
    /// decode is this call's failure, not the conversation's.
    async fn execute_tool(&self, call: &ToolCallRequest) -> ToolInvocation {
        let name = &call.function.name;
        let arguments = match call.function.decode_arguments() {
            Ok(arguments) => arguments,
            Err(e) => {
                return ToolInvocation::failed(
                    name,
                    serde_json::Value::String(call.function.arguments.clone()),
                    format!("invalid tool arguments: {e}"),
                );
            }
        };

        match self
            .transport
            .call_tool(name, arguments.clone(), self.settings.rpc_timeout)
            .await
        {
            Ok(result) => ToolInvocation::succeeded(name, arguments, result),
            Err(e) => ToolInvocation::failed(name, arguments, e.to_string()),
        }
    }

    /// Follow-up round: asks for a final user-facing message from the
    /// tool outcomes when resolution produced no free text.
    async fn follow_up(
        &self,
        input: &str,
        invocations: &[ToolInvocation],
    ) -> Result<Option<String>, StageError> {
        let mut messages = vec![ChatMessage::user(input)];
        for invocation in invocations {
            messages.push(ChatMessage::assistant(invocation.outcome_summary()));
        }
        messages.push(ChatMessage::user(
            "Based on these results, provide a clear, user-friendly response.",
        ));

        let request = ChatRequest::new(&self.settings.model, messages, 0.3);
        let reply = self.chat.complete(request).await.map_err(StageError::FollowUp)?;
        Ok(reply.content)
    }

    /// Evaluation round against the configured rubric.
    ///
    /// A service failure fails the conversation; an unparsable judge
    /// reply does not, yielding the sentinel scores with a distinct
    /// issue so the report shows it.
    async fn evaluate(
        &self,
        case: &TestCase,
        invocations: &[ToolInvocation],
        final_response: Option<&str>,
    ) -> Result<EvaluationScores, StageError> {
        let request = ChatRequest::new(
            &self.settings.eval_model,
            vec![
                ChatMessage::system(
                    "You are evaluating a DAW assistant conversation. Respond with valid JSON only.",
                ),
                ChatMessage::user(self.evaluation_prompt(case, invocations, final_response)),
            ],
            0.1,
        );

        let reply = self
            .chat
            .complete(request)
            .await
            .map_err(StageError::Evaluation)?;

        let rubric_names: Vec<String> =
            self.settings.rubric.iter().map(|c| c.name.clone()).collect();
        let content = reply.content.unwrap_or_default();
        let scores = EvaluationScores::parse_reply(&content, &rubric_names);
        if scores.issues.iter().any(|i| i == EvaluationScores::PARSE_FAILURE_ISSUE) {
            warn!(input = %case.input, "Evaluation reply was not parsable JSON");
        }
        Ok(scores)
    }

    fn evaluation_prompt(
        &self,
        case: &TestCase,
        invocations: &[ToolInvocation],
        final_response: Option<&str>,
    ) -> String {
        let tools_executed = if invocations.is_empty() {
            "none".to_string()
        } else {
            invocations
                .iter()
                .map(|i| {
                    format!("{} ({})", i.tool, if i.success { "success" } else { "failed" })
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let criteria = self
            .settings
            .rubric
            .iter()
            .enumerate()
            .map(|(n, c)| format!("{}. {}: {}", n + 1, c.name, c.prompt))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Evaluate this DAW assistant conversation:\n\n\
             User asked: \"{}\"\n\
             Expected intent: {}\n\
             Tools executed: {}\n\
             Assistant response: \"{}\"\n\n\
             Rate on a 0-10 scale:\n{}\n\n\
             Also identify:\n\
             - Issues (if any), as an \"issues\" array\n\
             - Improvements needed (if any), as an \"improvements\" array\n\n\
             Respond with JSON only.",
            case.input,
            case.expected_intent.as_deref().unwrap_or("unspecified"),
            tools_executed,
            final_response.unwrap_or("No response"),
            criteria,
        )
    }
}
