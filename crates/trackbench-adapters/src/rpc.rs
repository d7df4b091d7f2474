//! Correlated RPC over the worker's stdio streams.
//!
//! Requests go out one JSON object per line on the worker's stdin; a
//! router task scans every stdout line, parses it tolerantly, and
//! settles the single pending call whose id matches. Each call's
//! settlement handler lives in an explicit id-keyed map, entered on
//! send and removed exactly once at settlement, so later, unrelated
//! traffic on the shared stream can never re-trigger a finished call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use trackbench_proto::{RpcRequest, RpcResponse};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Errors surfaced by a single RPC call.
///
/// These are recovered at the tool-invocation level: a failed or
/// timed-out call becomes a failed `ToolInvocation`, never a pipeline
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No matching response arrived within the call's timeout window.
    #[error("tool call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The worker answered with an error member.
    #[error("{0}")]
    Worker(String),

    /// The worker's output stream closed with the call still pending.
    #[error("worker stream closed")]
    ChannelClosed,

    /// Writing the request to the worker's stdin failed.
    #[error("failed to write request: {0}")]
    Write(#[from] std::io::Error),

    /// The request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Seam through which the pipeline dispatches tool invocations.
///
/// `RpcChannel` is the production implementation; pipeline tests use
/// scripted fakes.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Invokes the named tool on the worker and awaits its result.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError>;
}

type Settlement = oneshot::Sender<Result<serde_json::Value, RpcError>>;
type PendingMap = Arc<StdMutex<HashMap<u64, Settlement>>>;

/// Correlated request/response channel over the worker's stdio.
///
/// Supports any number of outstanding calls; responses are matched
/// solely by id. One response settles at most one call.
pub struct RpcChannel {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl RpcChannel {
    /// Creates a channel over the worker's stdin and a stream of its
    /// stdout lines, and spawns the response router.
    pub fn new(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        lines: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        tokio::spawn(route_responses(lines, Arc::clone(&pending)));

        Self {
            writer: Mutex::new(Box::new(writer)),
            pending,
            // Seeded from the wall clock so ids stay unique across
            // channel rebuilds against the same worker.
            next_id: AtomicU64::new(epoch_millis()),
        }
    }

    /// Sends a `tools/call` request and awaits the matching response.
    ///
    /// Exactly one of three outcomes occurs: the result payload, the
    /// worker's error message, or a timeout. In every case the call's
    /// pending entry is gone afterwards; a response arriving after a
    /// timeout finds no entry and is ignored.
    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::tool_call(id, name, arguments);
        let line = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        // Register before writing so a fast response cannot race the insert.
        if self.insert_pending(id, tx).is_none() {
            return Err(RpcError::ChannelClosed);
        }

        if let Err(e) = self.write_line(&line).await {
            self.remove_pending(id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.remove_pending(id);
                Err(RpcError::ChannelClosed)
            }
            Err(_) => {
                self.remove_pending(id);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    fn insert_pending(&self, id: u64, tx: Settlement) -> Option<()> {
        self.pending.lock().ok().map(|mut p| {
            p.insert(id, tx);
        })
    }

    fn remove_pending(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&id);
        }
    }
}

/// Routes worker stdout lines to their pending calls.
///
/// Non-protocol lines are skipped; responses whose id matches nothing
/// are dropped. When the line stream closes (worker exit), every call
/// still pending settles with `ChannelClosed`.
async fn route_responses(mut lines: mpsc::UnboundedReceiver<String>, pending: PendingMap) {
    while let Some(line) = lines.recv().await {
        let Some(response) = RpcResponse::parse_line(&line) else {
            continue;
        };
        let Some(id) = response.id else {
            continue;
        };

        let sender = pending.lock().ok().and_then(|mut p| p.remove(&id));
        let Some(sender) = sender else {
            debug!(id, "No pending call for response id, ignoring");
            continue;
        };

        let outcome = match response.error {
            Some(err) => Err(RpcError::Worker(err.message)),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        };
        // The caller may have timed out between removal and send; that
        // is the caller's settlement, not ours.
        let _ = sender.send(outcome);
    }

    if let Ok(mut p) = pending.lock() {
        for (_, sender) in p.drain() {
            let _ = sender.send(Err(RpcError::ChannelClosed));
        }
    }
}

#[async_trait]
impl ToolTransport for RpcChannel {
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        self.call(name, arguments, timeout).await
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Builds a channel whose requests land in a duplex pipe and whose
    /// responses the test feeds in by hand.
    fn test_channel() -> (RpcChannel, mpsc::UnboundedSender<String>, tokio::io::DuplexStream) {
        let (writer, request_stream) = tokio::io::duplex(4096);
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        (RpcChannel::new(writer, line_rx), line_tx, request_stream)
    }

    async fn read_request(stream: &mut tokio::io::DuplexStream) -> RpcRequest {
        use tokio::io::AsyncBufReadExt;
        let mut reader = tokio::io::BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_call_resolves_on_matching_response() {
        let (channel, line_tx, mut requests) = test_channel();

        let call = tokio::spawn(async move {
            channel
                .call("list_tracks", json!({}), Duration::from_secs(1))
                .await
        });

        let request = read_request(&mut requests).await;
        assert_eq!(request.method, "tools/call");
        assert_eq!(request.params.name, "list_tracks");

        line_tx
            .send(format!(
                r#"{{"id":{},"result":{{"tracks":["Bass","Drums"]}}}}"#,
                request.id
            ))
            .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["tracks"][1], "Drums");
    }

    #[tokio::test]
    async fn test_call_rejects_on_error_response() {
        let (channel, line_tx, mut requests) = test_channel();

        let call = tokio::spawn(async move {
            let outcome = channel
                .call("track_mute", json!({"track": 9}), Duration::from_secs(1))
                .await;
            (outcome, channel.pending_calls())
        });

        let request = read_request(&mut requests).await;
        line_tx
            .send(format!(
                r#"{{"id":{},"error":{{"message":"no such track"}}}}"#,
                request.id
            ))
            .unwrap();

        let (outcome, pending) = call.await.unwrap();
        match outcome {
            Err(RpcError::Worker(message)) => assert_eq!(message, "no such track"),
            other => panic!("expected worker error, got {other:?}"),
        }
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_call_times_out_and_clears_pending() {
        let (channel, _line_tx, _requests) = test_channel();

        let outcome = channel
            .call("play", json!({}), Duration::from_millis(50))
            .await;

        assert!(matches!(outcome, Err(RpcError::Timeout(_))));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_ignored() {
        let (channel, line_tx, mut requests) = test_channel();

        let outcome = channel
            .call("stop", json!({}), Duration::from_millis(50))
            .await;
        assert!(matches!(outcome, Err(RpcError::Timeout(_))));

        let request = read_request(&mut requests).await;
        line_tx
            .send(format!(r#"{{"id":{},"result":"late"}}"#, request.id))
            .unwrap();

        // A later, correctly-matched call must not be disturbed.
        let call = tokio::spawn(async move {
            channel
                .call("set_tempo", json!({"bpm": 128}), Duration::from_secs(1))
                .await
        });
        let request = read_request(&mut requests).await;
        line_tx
            .send(format!(r#"{{"id":{},"result":"ok"}}"#, request.id))
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_unmatched_and_malformed_lines_do_not_settle() {
        let (channel, line_tx, mut requests) = test_channel();

        let call = tokio::spawn(async move {
            channel
                .call("list_tracks", json!({}), Duration::from_secs(1))
                .await
        });

        let request = read_request(&mut requests).await;
        // Diagnostic noise, an unrelated id, and a notification first.
        line_tx.send("Registered 230 tools".to_string()).unwrap();
        line_tx.send("{broken json".to_string()).unwrap();
        line_tx
            .send(r#"{"id":999999,"result":"someone else"}"#.to_string())
            .unwrap();
        line_tx
            .send(r#"{"method":"log","params":{}}"#.to_string())
            .unwrap();
        line_tx
            .send(format!(r#"{{"id":{},"result":42}}"#, request.id))
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_concurrent_calls_settle_independently() {
        let (channel, line_tx, mut requests) = test_channel();
        let channel = Arc::new(channel);

        let first = {
            let channel = Arc::clone(&channel);
            tokio::spawn(
                async move { channel.call("play", json!({}), Duration::from_secs(1)).await },
            )
        };
        let first_request = read_request(&mut requests).await;

        let second = {
            let channel = Arc::clone(&channel);
            tokio::spawn(
                async move { channel.call("stop", json!({}), Duration::from_secs(1)).await },
            )
        };
        let second_request = read_request(&mut requests).await;
        assert_ne!(first_request.id, second_request.id);

        // Answer out of order.
        line_tx
            .send(format!(r#"{{"id":{},"result":"second"}}"#, second_request.id))
            .unwrap();
        line_tx
            .send(format!(r#"{{"id":{},"result":"first"}}"#, first_request.id))
            .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_close_settles_pending_calls() {
        let (channel, line_tx, mut requests) = test_channel();

        let call = tokio::spawn(async move {
            channel
                .call("list_tracks", json!({}), Duration::from_secs(5))
                .await
        });
        let _ = read_request(&mut requests).await;

        drop(line_tx);

        assert!(matches!(call.await.unwrap(), Err(RpcError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_no_listener_leak_across_settlements() {
        let (channel, line_tx, mut requests) = test_channel();
        let channel = Arc::new(channel);

        for i in 0..5 {
            let handle = {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move {
                    channel
                        .call("list_tracks", json!({}), Duration::from_millis(200))
                        .await
                })
            };
            let request = read_request(&mut requests).await;
            if i % 2 == 0 {
                line_tx
                    .send(format!(r#"{{"id":{},"result":null}}"#, request.id))
                    .unwrap();
            }
            // Odd iterations settle by timeout.
            let _ = handle.await.unwrap();
        }

        assert_eq!(channel.pending_calls(), 0);
    }
}
