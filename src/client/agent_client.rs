//! Outbound A2A client — the broker's delegation arm.
//!
//! Everything wire-facing lives here: the [`RpcChannel`] seam (one unary
//! call, one streaming call, envelopes handled inside the channel), the
//! HTTP implementation with monotonically increasing request ids, a
//! pull-based server-sent-event decoder that understands the broker's
//! `done` frame, and well-known card discovery.
//!
//! Retry policy: transport errors, timeouts, and HTTP 5xx are retried
//! with a short backoff; JSON-RPC protocol errors are not (the peer
//! understood the request and refused it). Delegation responses must be a
//! Task or a Message; anything else is an invalid agent response.

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::types::{
    AgentCard, GetTaskParams, JsonRpcId, JsonRpcRequest, JsonRpcResponse, ListTasksParams,
    ListTasksResponse, Message, SendMessageParams, SendMessageResponse, StreamEvent, Task,
    TaskIdParams,
};

use super::endpoints::AgentEndpoint;

/// Request timeout for standalone clients not wired to a broker config.
/// Broker-internal delegation passes its configured timeout instead.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Well-known card paths probed during discovery, newest first.
pub const CARD_PATHS: [&str; 2] = ["/.well-known/agent-card.json", "/.well-known/agent.json"];

// ---------------------------------------------------------------------------
// RpcChannel
// ---------------------------------------------------------------------------

/// The wire seam: envelope construction, transport, and envelope
/// unwrapping all live behind it, so the typed client only ever sees
/// `result` values and [`StreamEvent`]s.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Perform one unary call and return the response envelope's `result`.
    /// A JSON-RPC error envelope surfaces as [`BrokerError::JsonRpc`].
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BrokerResult<serde_json::Value>;

    /// Open a streaming call.
    async fn open_stream(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BrokerResult<EventStream>;
}

/// JSON-RPC 2.0 over HTTP POST.
///
/// Request ids are a per-channel incrementing counter, which makes peer
/// logs correlate trivially with the channel's own call order.
pub struct HttpChannel {
    client: reqwest::Client,
    url: String,
    bearer: Option<String>,
    next_id: AtomicI64,
}

impl HttpChannel {
    /// Create a channel for an endpoint URL with the given per-request
    /// timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
            bearer: None,
            next_id: AtomicI64::new(1),
        }
    }

    /// Create a channel for a registered endpoint, attaching its bearer
    /// credential (when the auth ref resolved to one) to every request.
    pub fn for_endpoint(
        endpoint: &AgentEndpoint,
        bearer: Option<String>,
        timeout: Duration,
    ) -> Self {
        let mut channel = Self::new(endpoint.url.clone(), timeout);
        channel.bearer = bearer;
        channel
    }

    /// The endpoint URL this channel targets.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn envelope(&self, method: &str, params: serde_json::Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))),
            method: method.to_string(),
            params: Some(params),
        }
    }

    async fn post(
        &self,
        envelope: &JsonRpcRequest,
        streaming: bool,
    ) -> BrokerResult<reqwest::Response> {
        let mut request = self.client.post(&self.url).json(envelope);
        if streaming {
            request = request.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        if let Some(ref token) = self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout(format!("call to {} timed out", self.url))
            } else {
                BrokerError::Transport(format!("call to {} failed: {}", self.url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RpcChannel for HttpChannel {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BrokerResult<serde_json::Value> {
        let envelope = self.envelope(method, params);
        let response = self.post(&envelope, false).await?;
        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidJson(format!("response envelope: {}", e)))?;
        unwrap_envelope(parsed)
    }

    async fn open_stream(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BrokerResult<EventStream> {
        let envelope = self.envelope(method, params);
        let response = self.post(&envelope, true).await?;
        Ok(EventStream::from_response(response))
    }
}

/// Extract `result` from a response envelope, surfacing error envelopes.
fn unwrap_envelope(response: JsonRpcResponse) -> BrokerResult<serde_json::Value> {
    if let Some(error) = response.error {
        return Err(BrokerError::JsonRpc {
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }
    response.result.ok_or_else(|| {
        BrokerError::InvalidJson("response envelope has neither 'result' nor 'error'".to_string())
    })
}

// ---------------------------------------------------------------------------
// EventStream — pull-based SSE consumption
// ---------------------------------------------------------------------------

/// Accumulates raw bytes and yields complete SSE frames, where a frame is
/// everything up to a blank line (`\n\n` or `\r\n\r\n`).
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Drain the next complete frame, if a boundary has arrived.
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let lf = find_subslice(&self.buffer, b"\n\n");
        let crlf = find_subslice(&self.buffer, b"\r\n\r\n");
        let (pos, sep) = match (lf, crlf) {
            (Some(a), Some(b)) if b < a => (b, 4),
            (Some(a), _) => (a, 2),
            (None, Some(b)) => (b, 4),
            (None, None) => return None,
        };
        let frame: Vec<u8> = self.buffer.drain(..pos).collect();
        self.buffer.drain(..sep);
        Some(frame)
    }

    /// Whatever is left once the body ends (a frame the server never
    /// terminated with a blank line).
    fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            self.buffer.clear();
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// What one decoded frame means for the consumer.
enum FrameOutcome {
    /// A payload-bearing event (or a decode failure worth surfacing).
    Event(BrokerResult<StreamEvent>),
    /// The broker's end-of-stream marker frame.
    EndOfStream,
    /// Keep-alive comments, empty data, unnamed housekeeping frames.
    Skip,
}

/// Decode one frame: gather the `event` name and all `data` lines
/// (joined per SSE semantics), then interpret the payload.
fn decode_frame(frame: &[u8]) -> FrameOutcome {
    let text = String::from_utf8_lossy(frame);
    let mut event_name: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comments (leading ':') and fields like `id:`/`retry:` carry
        // nothing the broker protocol uses.
    }

    if event_name == Some("done") {
        return FrameOutcome::EndOfStream;
    }

    let data = data_lines.join("\n");
    if data.trim().is_empty() {
        return FrameOutcome::Skip;
    }

    match decode_payload(&data) {
        Ok(Some(event)) => FrameOutcome::Event(Ok(event)),
        Ok(None) => FrameOutcome::Skip,
        Err(e) => FrameOutcome::Event(Err(e)),
    }
}

/// A frame's data is a JSON-RPC success envelope whose `result` carries
/// the event; error envelopes and bare event objects are also handled.
fn decode_payload(data: &str) -> BrokerResult<Option<StreamEvent>> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| BrokerError::InvalidJson(format!("event frame: {}", e)))?;

    if let Some(error) = value.get("error") {
        return Err(BrokerError::JsonRpc {
            code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(-32603),
            message: error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
            data: error.get("data").cloned(),
        });
    }

    let payload = match value.get("result") {
        Some(result) if result.is_null() => return Ok(None),
        Some(result) => result.clone(),
        None => value,
    };
    serde_json::from_value(payload)
        .map(Some)
        .map_err(|e| BrokerError::InvalidJson(format!("event payload: {}", e)))
}

/// A pull-based stream of A2A events.
///
/// Decoding happens on demand in [`next`](Self::next) — no background
/// task, no intermediate channel; dropping the stream drops the
/// connection. The stream ends after the broker's `done` frame or when
/// the body closes.
pub struct EventStream {
    body: Pin<Box<dyn Stream<Item = BrokerResult<Vec<u8>>> + Send>>,
    decoder: SseDecoder,
    finished: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    fn from_response(response: reqwest::Response) -> Self {
        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| BrokerError::Transport(format!("event stream read failed: {}", e)))
        });
        Self {
            body: Box::pin(body),
            decoder: SseDecoder::default(),
            finished: false,
        }
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<BrokerResult<StreamEvent>> {
        while !self.finished {
            // Drain frames already buffered before touching the socket.
            while let Some(frame) = self.decoder.next_frame() {
                match decode_frame(&frame) {
                    FrameOutcome::Event(result) => return Some(result),
                    FrameOutcome::EndOfStream => {
                        self.finished = true;
                        return None;
                    }
                    FrameOutcome::Skip => {}
                }
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    let trailing = self.decoder.flush()?;
                    if let FrameOutcome::Event(result) = decode_frame(&trailing) {
                        return Some(result);
                    }
                    return None;
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Card discovery
// ---------------------------------------------------------------------------

/// Fetch a peer's agent card, probing the well-known paths in
/// [`CARD_PATHS`] order (older path only on a 404 from the newer one).
pub async fn resolve_card(base_url: &str) -> BrokerResult<AgentCard> {
    resolve_card_with(&reqwest::Client::new(), base_url).await
}

/// Card discovery over a caller-supplied `reqwest::Client`.
pub async fn resolve_card_with(
    client: &reqwest::Client,
    base_url: &str,
) -> BrokerResult<AgentCard> {
    let base = base_url.trim_end_matches('/');
    let mut not_found = None;

    for path in CARD_PATHS {
        let url = format!("{}{}", base, path);
        let response = client.get(&url).send().await.map_err(|e| {
            BrokerError::Transport(format!("card fetch from {} failed: {}", url, e))
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            not_found = Some(BrokerError::Http {
                status: 404,
                body: String::new(),
            });
            continue;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        return response
            .json::<AgentCard>()
            .await
            .map_err(|e| BrokerError::InvalidJson(format!("agent card from {}: {}", url, e)));
    }

    Err(not_found
        .unwrap_or_else(|| BrokerError::Transport("no card endpoint responded".to_string())))
}

// ---------------------------------------------------------------------------
// AgentClient
// ---------------------------------------------------------------------------

/// Typed client for one A2A endpoint.
pub struct AgentClient {
    channel: Box<dyn RpcChannel>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient").finish_non_exhaustive()
    }
}

impl AgentClient {
    /// Create a client for a JSON-RPC endpoint URL with the standalone
    /// default timeout.
    pub fn from_endpoint_url(url: &str) -> Self {
        Self::with_channel(Box::new(HttpChannel::new(url, DEFAULT_REQUEST_TIMEOUT)))
    }

    /// Create a client for a registered endpoint with broker-configured
    /// timeout and credentials.
    pub fn for_endpoint(
        endpoint: &AgentEndpoint,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self::with_channel(Box::new(HttpChannel::for_endpoint(
            endpoint,
            bearer_token,
            timeout,
        )))
    }

    /// Create a client over a custom channel.
    pub fn with_channel(channel: Box<dyn RpcChannel>) -> Self {
        Self {
            channel,
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Create a client by resolving a peer's card and targeting its
    /// advertised endpoint URL.
    pub async fn discover(base_url: &str) -> BrokerResult<Self> {
        let card = resolve_card(base_url).await?;
        Ok(Self::from_endpoint_url(&card.url))
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    // ------------------------------------------------------------------
    // A2A methods
    // ------------------------------------------------------------------

    /// `message/send` — the delegation call. The peer must answer with a
    /// Task or a Message.
    pub async fn send_message(
        &self,
        params: SendMessageParams,
    ) -> BrokerResult<SendMessageResponse> {
        let result = self.call_with_retry("message/send", encode(&params)?).await?;
        serde_json::from_value(result).map_err(|e| {
            // A 200 answer that is neither a task nor a message.
            BrokerError::invalid_agent_response(format!("delegation response: {}", e))
        })
    }

    /// `message/stream` — streaming delegation. Not retried; a broken
    /// stream is resumed via `tasks/resubscribe` instead.
    pub async fn send_message_stream(&self, params: SendMessageParams) -> BrokerResult<EventStream> {
        self.channel
            .open_stream("message/stream", encode(&params)?)
            .await
    }

    /// `tasks/get`.
    pub async fn get_task(&self, params: GetTaskParams) -> BrokerResult<Task> {
        decode(self.call_with_retry("tasks/get", encode(&params)?).await?)
    }

    /// `tasks/list`.
    pub async fn list_tasks(&self, params: ListTasksParams) -> BrokerResult<ListTasksResponse> {
        decode(self.call_with_retry("tasks/list", encode(&params)?).await?)
    }

    /// `tasks/cancel`.
    pub async fn cancel_task(&self, params: TaskIdParams) -> BrokerResult<Task> {
        decode(self.call_with_retry("tasks/cancel", encode(&params)?).await?)
    }

    /// `tasks/resubscribe` — re-attach to a live task's stream.
    pub async fn resubscribe(&self, params: TaskIdParams) -> BrokerResult<EventStream> {
        self.channel
            .open_stream("tasks/resubscribe", encode(&params)?)
            .await
    }

    // ------------------------------------------------------------------
    // Convenience helpers
    // ------------------------------------------------------------------

    /// Send a plain text message.
    pub async fn send_text(&self, text: &str) -> BrokerResult<SendMessageResponse> {
        self.send_message(SendMessageParams {
            message: Message::user_text(text),
            configuration: None,
            metadata: None,
        })
        .await
    }

    /// Send a plain text message within an existing context.
    pub async fn send_text_in_context(
        &self,
        text: &str,
        context_id: &str,
    ) -> BrokerResult<SendMessageResponse> {
        let mut message = Message::user_text(text);
        message.context_id = Some(context_id.to_string());
        self.send_message(SendMessageParams {
            message,
            configuration: None,
            metadata: None,
        })
        .await
    }

    /// Fetch a task by id.
    pub async fn get_task_by_id(
        &self,
        task_id: &str,
        history_length: Option<usize>,
    ) -> BrokerResult<Task> {
        self.get_task(GetTaskParams {
            id: task_id.to_string(),
            history_length,
        })
        .await
    }

    /// Cancel a task by id.
    pub async fn cancel_task_by_id(&self, task_id: &str) -> BrokerResult<Task> {
        self.cancel_task(TaskIdParams {
            id: task_id.to_string(),
            metadata: None,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// One unary call with bounded retries on transport-level failures.
    async fn call_with_retry(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BrokerResult<serde_json::Value> {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            match self.channel.call(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if is_retryable(&e) => {
                    warn!(method = %method, attempt, error = %e, "A2A call failed, retrying");
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        sleep(self.retry_delay * attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        debug!(method = %method, "A2A call exhausted retries");
        Err(last_err.unwrap_or_else(|| BrokerError::Transport("request failed".to_string())))
    }
}

fn is_retryable(err: &BrokerError) -> bool {
    match err {
        BrokerError::Transport(_) | BrokerError::Timeout(_) => true,
        BrokerError::Http { status, .. } => *status >= 500,
        _ => false,
    }
}

fn encode(params: &impl Serialize) -> BrokerResult<serde_json::Value> {
    serde_json::to_value(params)
        .map_err(|e| BrokerError::internal_error(format!("failed to encode params: {}", e)))
}

fn decode<T: serde::de::DeserializeOwned>(result: serde_json::Value) -> BrokerResult<T> {
    serde_json::from_value(result)
        .map_err(|e| BrokerError::InvalidJson(format!("failed to decode result: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    // ---- frame decoding ----

    #[test]
    fn decoder_reassembles_frames_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"event: statusUpdate\nda");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"ta: {\"x\":1}\n\nevent: done\n\n");

        let first = decoder.next_frame().expect("first frame");
        assert!(first.starts_with(b"event: statusUpdate"));
        let second = decoder.next_frame().expect("second frame");
        assert_eq!(second, b"event: done");
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn decoder_handles_crlf_framing() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"data: {\"a\":1}\r\n\r\ndata: {\"b\":2}\r\n\r\n");
        assert_eq!(decoder.next_frame().unwrap(), b"data: {\"a\":1}");
        assert_eq!(decoder.next_frame().unwrap(), b"data: {\"b\":2}");
    }

    #[test]
    fn decoder_flush_returns_unterminated_tail() {
        let mut decoder = SseDecoder::default();
        decoder.push(b"data: tail-frame");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.flush().unwrap(), b"data: tail-frame");

        let mut blank = SseDecoder::default();
        blank.push(b"\n");
        assert!(blank.flush().is_none());
    }

    #[test]
    fn done_frame_ends_the_stream() {
        assert!(matches!(
            decode_frame(b"event: done\ndata: "),
            FrameOutcome::EndOfStream
        ));
    }

    #[test]
    fn envelope_wrapped_event_decodes() {
        let frame = br#"event: statusUpdate
data: {"jsonrpc":"2.0","id":1,"result":{"kind":"status-update","taskId":"t1","contextId":"c1","status":{"state":"working"},"final":false}}"#;
        match decode_frame(frame) {
            FrameOutcome::Event(Ok(StreamEvent::StatusUpdate(update))) => {
                assert_eq!(update.task_id, "t1");
            }
            other => panic!("unexpected outcome: {:?}", outcome_label(&other)),
        }
    }

    #[test]
    fn bare_event_and_multiline_data_decode() {
        // Data split across two `data:` lines joins with a newline, which
        // is still valid JSON here thanks to the object layout.
        let frame = b"data: {\"kind\":\"message\",\"messageId\":\"m1\",\ndata: \"role\":\"agent\",\"parts\":[{\"kind\":\"text\",\"text\":\"hi\"}]}";
        match decode_frame(frame) {
            FrameOutcome::Event(Ok(StreamEvent::Message(message))) => {
                assert_eq!(message.text_content(), "hi");
            }
            other => panic!("unexpected outcome: {:?}", outcome_label(&other)),
        }
    }

    #[test]
    fn error_envelope_surfaces_as_jsonrpc_error() {
        let frame =
            br#"data: {"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"Task not found"}}"#;
        match decode_frame(frame) {
            FrameOutcome::Event(Err(BrokerError::JsonRpc { code, .. })) => {
                assert_eq!(code, -32001);
            }
            other => panic!("unexpected outcome: {:?}", outcome_label(&other)),
        }
    }

    #[test]
    fn comments_and_empty_frames_are_skipped() {
        assert!(matches!(decode_frame(b": keep-alive"), FrameOutcome::Skip));
        assert!(matches!(decode_frame(b"event: task\ndata: "), FrameOutcome::Skip));
        assert!(matches!(
            decode_frame(b"data: not-json"),
            FrameOutcome::Event(Err(BrokerError::InvalidJson(_)))
        ));
    }

    fn outcome_label(outcome: &FrameOutcome) -> &'static str {
        match outcome {
            FrameOutcome::Event(Ok(_)) => "event",
            FrameOutcome::Event(Err(_)) => "error",
            FrameOutcome::EndOfStream => "end-of-stream",
            FrameOutcome::Skip => "skip",
        }
    }

    // ---- channel envelope ----

    #[test]
    fn channel_ids_increment_per_call() {
        let channel = HttpChannel::new("http://peer.example/a2a", DEFAULT_REQUEST_TIMEOUT);
        let first = channel.envelope("tasks/get", serde_json::json!({"id": "t1"}));
        let second = channel.envelope("tasks/get", serde_json::json!({"id": "t2"}));
        assert_eq!(first.id, Some(JsonRpcId::Number(1)));
        assert_eq!(second.id, Some(JsonRpcId::Number(2)));
        assert_eq!(first.jsonrpc, "2.0");
    }

    #[test]
    fn unwrap_envelope_handles_all_shapes() {
        let ok = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: None,
            result: Some(serde_json::json!({"kind": "message"})),
            error: None,
        };
        assert!(unwrap_envelope(ok).is_ok());

        let err = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: None,
            result: None,
            error: Some(crate::types::JsonRpcError {
                code: -32002,
                message: "Task not cancelable".to_string(),
                data: None,
            }),
        };
        assert!(matches!(
            unwrap_envelope(err),
            Err(BrokerError::JsonRpc { code: -32002, .. })
        ));

        let empty = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: None,
            result: None,
            error: None,
        };
        assert!(matches!(
            unwrap_envelope(empty),
            Err(BrokerError::InvalidJson(_))
        ));
    }

    // ---- retry behavior ----

    struct FlakyChannel {
        fail_first: u32,
        calls: Arc<AtomicU32>,
        result: serde_json::Value,
    }

    #[async_trait]
    impl RpcChannel for FlakyChannel {
        async fn call(
            &self,
            _method: &str,
            _params: serde_json::Value,
        ) -> BrokerResult<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(BrokerError::Transport("connection refused".to_string()));
            }
            Ok(self.result.clone())
        }

        async fn open_stream(
            &self,
            _method: &str,
            _params: serde_json::Value,
        ) -> BrokerResult<EventStream> {
            Err(BrokerError::unsupported_operation("no streams in tests"))
        }
    }

    fn message_result() -> serde_json::Value {
        serde_json::json!({
            "kind": "message",
            "messageId": "m1",
            "role": "agent",
            "parts": [{"kind": "text", "text": "done"}]
        })
    }

    #[tokio::test]
    async fn retries_transport_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = AgentClient::with_channel(Box::new(FlakyChannel {
            fail_first: 2,
            calls: Arc::clone(&calls),
            result: message_result(),
        }))
        .with_retry(3, Duration::from_millis(1));

        let response = client.send_text("hello").await.unwrap();
        assert!(matches!(response, SendMessageResponse::Message(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let client = AgentClient::with_channel(Box::new(FlakyChannel {
            fail_first: 10,
            calls: Arc::new(AtomicU32::new(0)),
            result: message_result(),
        }))
        .with_retry(2, Duration::from_millis(1));

        let err = client.send_text("hello").await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));
    }

    #[tokio::test]
    async fn nonconformant_payload_is_invalid_agent_response() {
        let client = AgentClient::with_channel(Box::new(FlakyChannel {
            fail_first: 0,
            calls: Arc::new(AtomicU32::new(0)),
            result: serde_json::json!({"unexpected": true}),
        }));

        let err = client.send_text("hello").await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidAgentResponse { .. }));
    }

    #[tokio::test]
    async fn jsonrpc_errors_are_not_retried() {
        struct RefusingChannel(Arc<AtomicU32>);

        #[async_trait]
        impl RpcChannel for RefusingChannel {
            async fn call(
                &self,
                _method: &str,
                _params: serde_json::Value,
            ) -> BrokerResult<serde_json::Value> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::JsonRpc {
                    code: -32001,
                    message: "Task not found".to_string(),
                    data: None,
                })
            }

            async fn open_stream(
                &self,
                _method: &str,
                _params: serde_json::Value,
            ) -> BrokerResult<EventStream> {
                Err(BrokerError::unsupported_operation("no streams in tests"))
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let client = AgentClient::with_channel(Box::new(RefusingChannel(Arc::clone(&calls))))
            .with_retry(3, Duration::from_millis(1));

        let err = client.get_task_by_id("missing", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::JsonRpc { code: -32001, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
