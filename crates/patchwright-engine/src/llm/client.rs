use super::stream::{SseBuffer, StreamEvent, StreamState};
use futures::StreamExt;
use patchwright_adapters::config::Config;
use patchwright_adapters::util::debug_stderr_enabled;
use patchwright_core::{Message, ModelInvoker, ModelReply};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Sanitize API response content for error messages to prevent credential leakage.
pub(crate) fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-", // OpenAI/OpenRouter key prefix
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated.to_string()
}

/// Rate limit retry configuration
pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff

/// Extract a retry-after hint from an error body ("retry after 12 seconds").
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    if let Some(pos) = text_lower.find("retry") {
        let after_retry = &text_lower[pos..];
        for word in after_retry.split_whitespace().skip(1).take(5) {
            if let Ok(secs) = word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>() {
                if secs > 0 && secs < 300 {
                    return Some(secs);
                }
            }
        }
    }
    None
}

fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0 && *secs < 300)
}

pub(crate) fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor);
    let secs = ms / 1000;
    if secs == 0 {
        1
    } else {
        secs
    }
}

pub(crate) fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Create a configured HTTP client for OpenRouter requests
pub(crate) fn create_http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

fn map_timeout_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow::anyhow!("OpenRouter request timed out. Please try again.")
    } else if err.is_connect() {
        anyhow::anyhow!("Could not connect to OpenRouter. Check your network and try again.")
    } else {
        err.into()
    }
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    if s.chars().count() <= max_chars {
        s
    } else {
        let byte_idx = s
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        &s[..byte_idx]
    }
}

/// OpenRouter error payload, either as a whole body or inside a stream chunk.
#[derive(Debug, Deserialize)]
pub(crate) struct OpenRouterError {
    pub error: OpenRouterApiError,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenRouterApiError {
    pub message: String,
}

// ═══════════════════════════════════════════════════════════════════════════
//  CLIENT
// ═══════════════════════════════════════════════════════════════════════════

/// Which agent a client speaks for. Picks the model and labels logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Planner,
    Coder,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::Reviewer => "reviewer",
        }
    }

    pub fn model<'a>(&self, config: &'a Config) -> &'a str {
        match self {
            AgentRole::Planner => &config.planner_model,
            AgentRole::Coder => &config.coder_model,
            AgentRole::Reviewer => &config.reviewer_model,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub stall_timeout: Duration,
    pub request_timeout_secs: u64,
    /// USD per million prompt tokens, used when the provider reports no cost.
    pub input_cost: f64,
    /// USD per million completion tokens.
    pub output_cost: f64,
    /// Echo streamed text to stdout.
    pub echo: bool,
}

impl ClientSettings {
    pub fn from_config(config: &Config, role: AgentRole, api_key: String) -> Self {
        Self {
            api_url: config.api_url.clone(),
            api_key,
            model: role.model(config).to_string(),
            temperature: config.temperature,
            stall_timeout: Duration::from_secs(config.stall_timeout_secs),
            request_timeout_secs: config.request_timeout_secs,
            input_cost: config.input_cost,
            output_cost: config.output_cost,
            echo: true,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
    usage: UsageRequest,
    provider: ProviderPreferences,
}

#[derive(Serialize)]
struct UsageRequest {
    include: bool,
}

#[derive(Serialize)]
struct ProviderPreferences {
    sort: &'static str,
}

/// Streaming OpenAI-compatible chat client (OpenRouter by default).
pub struct OpenRouterClient {
    http: reqwest::Client,
    settings: ClientSettings,
}

impl OpenRouterClient {
    pub fn new(settings: ClientSettings) -> anyhow::Result<Self> {
        let http = create_http_client(settings.request_timeout_secs)?;
        Ok(Self { http, settings })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn request_body<'a>(&'a self, messages: &'a [Message]) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            stream: true,
            usage: UsageRequest { include: true },
            provider: ProviderPreferences { sort: "throughput" },
        }
    }

    /// Send one chat request and stream the reply to completion (or until it stalls).
    pub async fn stream_chat(&self, messages: &[Message]) -> anyhow::Result<ModelReply> {
        let started = Instant::now();
        let body = self.request_body(messages);
        let response = self.send_streaming(&body).await?;
        let state = self.consume(response).await?;
        Ok(state.into_reply(
            started.elapsed(),
            self.settings.input_cost,
            self.settings.output_cost,
        ))
    }

    async fn send_streaming(&self, body: &ChatRequest<'_>) -> anyhow::Result<reqwest::Response> {
        let mut retry_count = 0;

        loop {
            let response = match self
                .http
                .post(&self.settings.api_url)
                .header("Content-Type", "application/json")
                .header("HTTP-Referer", "https://github.com/patchwright/patchwright")
                .header("X-Title", "Patchwright")
                .header("Authorization", format!("Bearer {}", self.settings.api_key))
                .json(body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        let retry_after = backoff_secs(retry_count);
                        if debug_stderr_enabled() {
                            eprintln!("  Network error ({}), retrying in {}s", err, retry_after);
                        }
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }
                    return Err(map_timeout_error(err));
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let retry_after_hint = parse_retry_after_header(response.headers());
            let text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = retry_after_hint
                    .or_else(|| parse_retry_after(&text))
                    .unwrap_or_else(|| backoff_secs(retry_count));
                eprintln!("  ! Rate limited, retrying in {}s", retry_after);
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }
            if status.is_server_error() && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = backoff_secs(retry_count);
                if debug_stderr_enabled() {
                    eprintln!("  Server error {}, retrying in {}s", status, retry_after);
                }
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            let detail = serde_json::from_str::<OpenRouterError>(&text)
                .map(|e| sanitize_api_response(&e.error.message))
                .unwrap_or_else(|_| sanitize_api_response(&text));
            let error_msg = match status.as_u16() {
                401 => "Invalid API key. Run 'patchwright --setup' to update it.".to_string(),
                429 => format!(
                    "Rate limited by OpenRouter after {} retries. Try again in a few minutes.",
                    retry_count
                ),
                500..=599 => format!(
                    "OpenRouter server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, detail),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }

    async fn consume(&self, response: reqwest::Response) -> anyhow::Result<StreamState> {
        let mut stream = response.bytes_stream();
        let mut sse = SseBuffer::default();
        let mut state = StreamState::default();
        let mut done = false;

        while !done {
            let next = match timeout(self.settings.stall_timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    state.mark_stalled();
                    if self.settings.echo {
                        echo(super::stream::STALL_MARKER);
                    }
                    break;
                }
            };
            let Some(chunk) = next else {
                break;
            };
            let bytes = chunk.map_err(|err| anyhow::anyhow!("Stream read failed: {}", err))?;
            for event in sse.push(&bytes) {
                if self.handle_event(&mut state, &event)? {
                    done = true;
                    break;
                }
            }
        }
        if !done {
            if let Some(event) = sse.finish() {
                self.handle_event(&mut state, &event)?;
            }
        }
        if self.settings.echo {
            println!();
        }
        Ok(state)
    }

    /// Returns true once the stream signalled completion.
    fn handle_event(&self, state: &mut StreamState, event: &str) -> anyhow::Result<bool> {
        match state.apply_event(event)? {
            StreamEvent::Delta(text) => {
                if self.settings.echo {
                    echo(&text);
                }
                Ok(false)
            }
            StreamEvent::Done => Ok(true),
            StreamEvent::Ignored => Ok(false),
        }
    }
}

fn echo(text: &str) {
    let mut out = std::io::stdout();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

impl ModelInvoker for OpenRouterClient {
    fn invoke<'a>(
        &'a self,
        messages: &'a [Message],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ModelReply>> + Send + 'a>> {
        Box::pin(self.stream_chat(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read};
    use std::net::TcpListener;
    use std::thread;

    fn settings(url: String) -> ClientSettings {
        ClientSettings {
            api_url: url,
            api_key: "sk-or-test".to_string(),
            model: "test/model".to_string(),
            temperature: 0.1,
            stall_timeout: Duration::from_millis(300),
            request_timeout_secs: 10,
            input_cost: 1.0,
            output_cost: 2.0,
            echo: false,
        }
    }

    /// Serve one canned HTTP response; `chunks` are written with `pause` between them.
    fn serve_once(status_line: &'static str, chunks: Vec<&'static str>, pause: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();

            let mut stream = stream;
            let head = format!(
                "{}\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
                status_line
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.flush().unwrap();
            for chunk in chunks {
                if stream.write_all(chunk.as_bytes()).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(pause);
            }
        });
        format!("http://{}/chat/completions", addr)
    }

    #[test]
    fn test_backoff_secs() {
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(3), 8);
    }

    #[test]
    fn test_parse_retry_after_from_body() {
        assert_eq!(parse_retry_after("Please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("Retry in 900 seconds"), None);
        assert_eq!(parse_retry_after("slow down"), None);
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), Some(7));
        headers.insert(reqwest::header::RETRY_AFTER, "0".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[test]
    fn test_sanitize_api_response_redacts_secrets() {
        assert_eq!(
            sanitize_api_response("invalid key sk-or-123"),
            "(response details redacted - may contain sensitive data)"
        );
        let long = "x".repeat(500);
        assert_eq!(sanitize_api_response(&long).len(), MAX_ERROR_CONTENT_LEN);
    }

    #[test]
    fn test_request_body_shape() {
        let client = OpenRouterClient::new(settings("http://localhost".to_string())).unwrap();
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let json = serde_json::to_value(client.request_body(&messages)).unwrap();
        assert_eq!(json["model"], "test/model");
        assert_eq!(json["stream"], true);
        assert_eq!(json["usage"]["include"], true);
        assert_eq!(json["provider"]["sort"], "throughput");
        assert_eq!(json["messages"][1]["role"], "user");
    }

    #[test]
    fn test_role_picks_model() {
        let config = Config {
            planner_model: "p".to_string(),
            coder_model: "c".to_string(),
            reviewer_model: "r".to_string(),
            ..Config::default()
        };
        assert_eq!(AgentRole::Planner.model(&config), "p");
        assert_eq!(AgentRole::Coder.model(&config), "c");
        assert_eq!(AgentRole::Reviewer.model(&config), "r");
    }

    #[tokio::test]
    async fn test_stream_chat_collects_reply() {
        let url = serve_once(
            "HTTP/1.1 200 OK",
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"tool_name\\\"\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\": 1}\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":100,\"completion_tokens\":20,\"total_tokens\":120}}\n\ndata: [DONE]\n\n",
            ],
            Duration::from_millis(10),
        );
        let client = OpenRouterClient::new(settings(url)).unwrap();
        let reply = client.invoke(&[Message::user("go")]).await.unwrap();
        assert_eq!(reply.text, "{\"tool_name\": 1}");
        assert_eq!(reply.stop_reason.as_deref(), Some("stop"));
        assert_eq!(reply.usage.total_tokens, 120);
        let expected = 100.0 / 1_000_000.0 + 20.0 * 2.0 / 1_000_000.0;
        assert!((reply.usage.cost() - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_stream_chat_marks_stall() {
        let url = serve_once(
            "HTTP/1.1 200 OK",
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
                "data: [DONE]\n\n",
            ],
            Duration::from_secs(2),
        );
        let client = OpenRouterClient::new(settings(url)).unwrap();
        let reply = client.stream_chat(&[Message::user("go")]).await.unwrap();
        assert_eq!(reply.text, "partial\n[Error: No response received for too long]");
        assert_eq!(reply.stop_reason.as_deref(), Some("stall"));
    }

    #[tokio::test]
    async fn test_unauthorized_points_to_setup() {
        let url = serve_once(
            "HTTP/1.1 401 Unauthorized",
            vec!["{\"error\":{\"message\":\"No auth\",\"code\":401}}"],
            Duration::from_millis(1),
        );
        let client = OpenRouterClient::new(settings(url)).unwrap();
        let err = client.stream_chat(&[Message::user("go")]).await.unwrap_err();
        assert!(err.to_string().contains("patchwright --setup"));
    }
}
