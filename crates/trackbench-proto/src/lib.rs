//! # trackbench-proto
//!
//! Shared types for the trackbench harness.
//!
//! This crate provides the foundational data shapes used across all
//! trackbench crates, including:
//! - The JSON-RPC envelope spoken to the tool worker over stdio
//! - Chat-completions request/response types for the resolution and
//!   evaluation services
//! - Conversation records, evaluation scores, and sessions

mod chat;
mod record;
mod rpc;

pub use chat::{
    AssistantReply, ChatChoice, ChatCompletion, ChatMessage, ChatRequest, FunctionCall,
    ToolCallRequest, ToolFunction, ToolSpec,
};
pub use record::{
    now_timestamp, ConversationRecord, EvaluationScores, Session, ToolInvocation,
    SUCCESS_THRESHOLD,
};
pub use rpc::{RpcErrorBody, RpcRequest, RpcResponse, ToolCallParams, JSONRPC_VERSION, TOOLS_CALL_METHOD};
