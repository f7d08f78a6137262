//! OpenAI Chat Completions client
//!
//! Uses `{api_base}/chat/completions` for both blocking and SSE-streamed
//! replies. Transient failures (network, 5xx) are retried with exponential
//! backoff before being reported.

use super::{ApiError, ApiErrorKind, Completion, CompletionOptions, Message, ModelClient, TextStream};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Default endpoint for the hosted API
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const MAX_RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_BACKOFF_DOUBLINGS: u32 = 5;
const MAX_ERROR_DETAIL_CHARS: usize = 500;
const STREAM_CHANNEL_CAPACITY: usize = 32;

// ─── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Error body of a failed request: `{"error": {"message", "type", "code"}}`.
/// Some compatible servers send a bare `{"message": ...}` instead.
#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    // Usually a string, but null or numeric on some servers
    code: Option<serde_json::Value>,
}

/// What a failed response said about itself
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ErrorReport {
    message: String,
    error_type: Option<String>,
    code: Option<String>,
}

impl ErrorReport {
    fn parse(body: &str) -> Self {
        let body = body.trim();
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(ErrorEnvelope {
                error: Some(error), ..
            }) => Self {
                message: error.message.unwrap_or_default(),
                error_type: error.error_type,
                code: error.code.and_then(|c| match c {
                    serde_json::Value::String(s) => Some(s),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
            },
            Ok(ErrorEnvelope {
                message: Some(message),
                ..
            }) => Self {
                message,
                ..Self::default()
            },
            _ => Self {
                message: body.to_string(),
                ..Self::default()
            },
        }
    }

    /// Pick the error kind, preferring the body's `code`/`type` over the
    /// status. A 429 for an exhausted quota is not a rate limit that clears,
    /// and a 400 carrying `server_error` is worth retrying.
    fn kind(&self, status: StatusCode) -> ApiErrorKind {
        match self.code.as_deref() {
            Some("invalid_api_key" | "invalid_organization") => return ApiErrorKind::Auth,
            Some("insufficient_quota" | "billing_hard_limit_reached") => {
                return ApiErrorKind::InvalidRequest
            }
            Some("rate_limit_exceeded") => return ApiErrorKind::RateLimit,
            Some("context_length_exceeded" | "model_not_found") => {
                return ApiErrorKind::InvalidRequest
            }
            _ => {}
        }
        match self.error_type.as_deref() {
            Some("authentication_error") => return ApiErrorKind::Auth,
            Some("server_error") => return ApiErrorKind::Server,
            _ => {}
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiErrorKind::Auth,
            StatusCode::TOO_MANY_REQUESTS => ApiErrorKind::RateLimit,
            s if s.is_server_error() => ApiErrorKind::Server,
            _ => ApiErrorKind::InvalidRequest,
        }
    }

    /// `HTTP <status>[: <message>][ (<code>)]`, message clipped to
    /// `max_chars` characters.
    fn describe(&self, status: StatusCode, max_chars: usize) -> String {
        let mut text = format!("HTTP {status}");
        if !self.message.is_empty() {
            text.push_str(": ");
            match self.message.char_indices().nth(max_chars) {
                Some((cut, _)) => {
                    text.push_str(&self.message[..cut]);
                    text.push_str("... [truncated]");
                }
                None => text.push_str(&self.message),
            }
        }
        if let Some(code) = &self.code {
            text.push_str(&format!(" ({code})"));
        }
        text
    }
}

/// One decoded piece of an SSE body
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamEvent {
    Text(String),
    Done,
}

/// Splits an SSE byte stream into complete `data:` payloads.
///
/// Network chunks can end anywhere, including inside a UTF-8 sequence, so
/// bytes are held until a full line is available.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

/// Interpret a single `data:` payload.
fn parse_stream_payload(data: &str) -> Result<Vec<StreamEvent>, ApiError> {
    if data == "[DONE]" {
        return Ok(vec![StreamEvent::Done]);
    }
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| ApiError::invalid_response(format!("bad stream chunk: {e}")))?;
    let mut events = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            events.push(StreamEvent::Text(content));
        }
        if choice.finish_reason.is_some() {
            events.push(StreamEvent::Done);
        }
    }
    Ok(events)
}

// ─── Client ─────────────────────────────────────────────────────────

/// HTTP client for an OpenAI-compatible chat API
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    summary_model: String,
    max_attempts: u32,
}

impl OpenAiClient {
    /// Create a client. A missing key only fails once a request is made, so
    /// offline commands (reset, summary) still work without one.
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        summary_model: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("cortex-chat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            summary_model: summary_model.into(),
            max_attempts: MAX_RETRY_ATTEMPTS,
        })
    }

    /// Override how many times a retryable failure is attempted.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Check that the API is reachable and the key is accepted.
    pub async fn ping(&self) -> Result<(), ApiError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_key()?)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;
        Self::check_response_status(response).await?;
        Ok(())
    }

    fn api_key(&self) -> Result<&str, ApiError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ApiError::auth("no API key configured (set OPENAI_API_KEY)"))
    }

    /// Delay before retry number `attempt` (1-based): 200 ms, doubling,
    /// capped at [`MAX_BACKOFF_DOUBLINGS`] doublings.
    fn retry_delay(attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
        Duration::from_millis(RETRY_BASE_DELAY_MS << doublings)
    }

    /// POST a chat request, retrying transient failures.
    async fn send_chat(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let key = self.api_key()?;
        debug!(
            "Sending chat request: model={}, messages={}, stream={}",
            request.model,
            request.messages.len(),
            request.stream
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self
                .client
                .post(&url)
                .bearer_auth(key)
                .json(request)
                .send()
                .await
            {
                Ok(response) => Self::check_response_status(response).await,
                Err(e) => Err(Self::map_reqwest_error(e)),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = Self::retry_delay(attempt);
                    warn!(
                        "Chat request failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_reply(response: reqwest::Response) -> Result<String, ApiError> {
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ApiError::invalid_response(format!("unparsable reply: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::invalid_response("reply has no content"))
    }

    /// Forward SSE text deltas into a channel-backed stream.
    fn spawn_stream(response: reqwest::Response) -> TextStream {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut body = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(Self::map_reqwest_error(e))).await;
                        return;
                    }
                };
                for payload in decoder.push(&bytes) {
                    let events = match parse_stream_payload(&payload) {
                        Ok(events) => events,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    for event in events {
                        match event {
                            StreamEvent::Text(text) => {
                                if tx.send(Ok(text)).await.is_err() {
                                    // Receiver dropped: the turn was cancelled.
                                    return;
                                }
                            }
                            StreamEvent::Done => return,
                        }
                    }
                }
            }
            let _ = tx
                .send(Err(ApiError::network("stream ended before completion")))
                .await;
        });

        ReceiverStream::new(rx).boxed()
    }

    async fn check_response_status(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let report = ErrorReport::parse(&body);
        Err(ApiError::new(
            report.kind(status),
            report.describe(status, MAX_ERROR_DETAIL_CHARS),
        ))
    }

    fn map_reqwest_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::network(format!("timeout: {e}"))
        } else if e.is_connect() || e.is_request() || e.is_body() {
            ApiError::network(e.to_string())
        } else if e.is_decode() {
            ApiError::invalid_response(e.to_string())
        } else {
            ApiError::network(e.to_string())
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, ApiError> {
        let request = ChatRequest {
            model: &options.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream: options.stream,
        };
        let response = self.send_chat(&request).await?;
        if options.stream {
            Ok(Completion::Stream(Self::spawn_stream(response)))
        } else {
            Ok(Completion::Text(Self::read_reply(response).await?))
        }
    }

    async fn complete_for_summary(
        &self,
        messages: &[Message],
        max_tokens: u32,
    ) -> Result<String, ApiError> {
        let request = ChatRequest {
            model: &self.summary_model,
            messages,
            max_tokens,
            temperature: 0.0,
            stream: false,
        };
        let response = self.send_chat(&request).await?;
        Self::read_reply(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(stream: bool) -> CompletionOptions {
        CompletionOptions {
            model: "gpt-test".to_string(),
            temperature: 0.5,
            max_tokens: 64,
            stream,
        }
    }

    fn client(server: &MockServer) -> OpenAiClient {
        OpenAiClient::new(Some("sk-test".to_string()), server.uri(), "gpt-test")
            .unwrap()
            .with_max_attempts(1)
    }

    #[test]
    fn test_sse_decoder_joins_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let payloads = decoder.push(b":1}\r\n\ndata: [DONE]\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_sse_decoder_keeps_multibyte_chars_intact() {
        let mut decoder = SseDecoder::default();
        let line = "data: héllo\n".as_bytes();
        // Split inside the two-byte 'é'
        assert!(decoder.push(&line[..8]).is_empty());
        assert_eq!(decoder.push(&line[8..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_parse_stream_payload() {
        let text = r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        assert_eq!(
            parse_stream_payload(text).unwrap(),
            vec![StreamEvent::Text("Hi".to_string())]
        );

        let finish = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_stream_payload(finish).unwrap(), vec![StreamEvent::Done]);
        assert_eq!(parse_stream_payload("[DONE]").unwrap(), vec![StreamEvent::Done]);

        let err = parse_stream_payload("not json").unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::InvalidResponse);
    }

    #[test]
    fn test_error_kind_from_status() {
        let bare = ErrorReport::default();
        assert_eq!(bare.kind(StatusCode::UNAUTHORIZED), ApiErrorKind::Auth);
        assert_eq!(bare.kind(StatusCode::TOO_MANY_REQUESTS), ApiErrorKind::RateLimit);
        assert_eq!(bare.kind(StatusCode::BAD_GATEWAY), ApiErrorKind::Server);
        assert_eq!(bare.kind(StatusCode::BAD_REQUEST), ApiErrorKind::InvalidRequest);
    }

    #[test]
    fn test_error_kind_prefers_body_code() {
        let quota = ErrorReport::parse(
            r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#,
        );
        assert_eq!(quota.kind(StatusCode::TOO_MANY_REQUESTS), ApiErrorKind::InvalidRequest);

        let bad_key = ErrorReport::parse(
            r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#,
        );
        assert_eq!(bad_key.kind(StatusCode::BAD_REQUEST), ApiErrorKind::Auth);

        let overloaded = ErrorReport::parse(
            r#"{"error":{"message":"The server had an error","type":"server_error","code":null}}"#,
        );
        assert_eq!(overloaded.code, None);
        assert_eq!(overloaded.kind(StatusCode::BAD_REQUEST), ApiErrorKind::Server);
        assert!(overloaded.kind(StatusCode::BAD_REQUEST).is_retryable());
    }

    #[test]
    fn test_error_report_parse() {
        let nested = ErrorReport::parse(
            r#"{"error":{"message":"This model's maximum context length is 8192 tokens","type":"invalid_request_error","code":"context_length_exceeded"}}"#,
        );
        assert_eq!(
            nested,
            ErrorReport {
                message: "This model's maximum context length is 8192 tokens".to_string(),
                error_type: Some("invalid_request_error".to_string()),
                code: Some("context_length_exceeded".to_string()),
            }
        );

        assert_eq!(ErrorReport::parse(r#"{"message":"gateway says no"}"#).message, "gateway says no");
        assert_eq!(ErrorReport::parse("  plain  ").message, "plain");
        assert_eq!(ErrorReport::parse(""), ErrorReport::default());
    }

    #[test]
    fn test_error_report_describe() {
        assert_eq!(
            ErrorReport::default().describe(StatusCode::BAD_GATEWAY, 10),
            "HTTP 502 Bad Gateway"
        );

        let report = ErrorReport {
            message: "é".repeat(20),
            error_type: None,
            code: Some("model_not_found".to_string()),
        };
        assert_eq!(
            report.describe(StatusCode::NOT_FOUND, 5),
            format!("HTTP 404 Not Found: {}... [truncated] (model_not_found)", "é".repeat(5))
        );
    }

    #[test]
    fn test_retry_delay_doubles_then_caps() {
        assert_eq!(OpenAiClient::retry_delay(1), Duration::from_millis(200));
        assert_eq!(OpenAiClient::retry_delay(2), Duration::from_millis(400));
        assert_eq!(OpenAiClient::retry_delay(3), Duration::from_millis(800));
        assert_eq!(OpenAiClient::retry_delay(6), Duration::from_millis(6400));
        assert_eq!(OpenAiClient::retry_delay(40), OpenAiClient::retry_delay(6));
    }

    #[tokio::test]
    async fn test_complete_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-test", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "  Hello!  "}}]
            })))
            .mount(&server)
            .await;

        let completion = client(&server)
            .complete(&[Message::user("hi")], &options(false))
            .await
            .unwrap();
        match completion {
            // Returned verbatim, exactly as a stream would deliver it
            Completion::Text(text) => assert_eq!(text, "  Hello!  "),
            other => panic!("Expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_streams_chunks_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let completion = client(&server)
            .complete(&[Message::user("hi")], &options(true))
            .await
            .unwrap();
        let Completion::Stream(stream) = completion else {
            panic!("Expected stream");
        };
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_truncated_stream_ends_with_error() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"},\"finish_reason\":null}]}\n\n";
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let Completion::Stream(stream) = client(&server)
            .complete(&[Message::user("hi")], &options(true))
            .await
            .unwrap()
        else {
            panic!("Expected stream");
        };
        let items: Vec<Result<String, ApiError>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref(), Ok("partial"));
        assert_eq!(items[1].as_ref().unwrap_err().kind, ApiErrorKind::Network);
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "Incorrect API key provided"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .complete(&[Message::user("hi")], &options(false))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Auth);
        assert!(err.message.contains("Incorrect API key"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "recovered"}}]
            })))
            .mount(&server)
            .await;

        let client = client(&server).with_max_attempts(2);
        let summary = client
            .complete_for_summary(&[Message::user("sum")], 32)
            .await
            .unwrap();
        assert_eq!(summary, "recovered");
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_request() {
        let client = OpenAiClient::new(None, DEFAULT_API_BASE, "gpt-test").unwrap();
        let err = client
            .complete_for_summary(&[Message::user("x")], 16)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_ping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;
        client(&server).ping().await.unwrap();
    }
}
