//! # trackbench-adapters
//!
//! Adapters to the harness's external collaborators:
//! - `worker`: supervises the long-lived tool worker process
//! - `rpc`: correlated request/response exchange over the worker's stdio
//! - `chat`: OpenAI-style chat-completions client for the resolution
//!   and evaluation services

mod chat;
mod rpc;
mod worker;

pub use chat::{ChatApi, ChatClient, ChatError, api_key_from_env, API_KEY_ENV, DEFAULT_BASE_URL};
pub use rpc::{RpcChannel, RpcError, ToolTransport, DEFAULT_CALL_TIMEOUT};
pub use worker::{SupervisorError, WorkerCommand, WorkerSupervisor};
