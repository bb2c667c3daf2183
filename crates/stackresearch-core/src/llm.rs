//! Language model seam and the Anthropic Messages API client.
//!
//! Structured output is requested by forcing a single tool whose input schema
//! is the desired output shape; the tool input the model returns is the value.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::config::LlmConfig;
use crate::metrics::record_model_call;
use crate::rate_limit::RateLimiter;
use crate::security::sanitize_error_body;
use crate::{SecretValue, StackResearchError};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A single model request: optional system instructions plus the conversation.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            messages: vec![ChatMessage::user(user)],
        }
    }

    pub fn prompt(user: impl Into<String>) -> Self {
        Self {
            system: None,
            messages: vec![ChatMessage::user(user)],
        }
    }
}

/// Shape the model must answer with.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }

    /// Build an output schema from a user-supplied JSON schema, naming it after its `title`.
    pub fn from_json_schema(schema: &Value) -> Self {
        let name = schema
            .get("title")
            .and_then(Value::as_str)
            .map(tool_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "extract_info".to_string());
        let description = schema
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("Structured information extracted from research notes")
            .to_string();
        Self::new(name, description, schema.clone())
    }
}

fn tool_name(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-form text completion.
    async fn complete(&self, request: CompletionRequest) -> Result<String, StackResearchError>;

    /// Completion constrained to `output`; returns the raw JSON value.
    async fn structured(
        &self,
        request: CompletionRequest,
        output: &OutputSchema,
    ) -> Result<Value, StackResearchError>;
}

/// Request structured output and deserialize it into `T`.
pub async fn structured_as<T>(
    model: &dyn LanguageModel,
    request: CompletionRequest,
    output: &OutputSchema,
) -> Result<T, StackResearchError>
where
    T: DeserializeOwned,
{
    let value = model.structured(request, output).await?;
    serde_json::from_value(value)
        .map_err(|err| StackResearchError::Parse(format!("{}: {err}", output.name)))
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

impl<'a> MessagesRequest<'a> {
    fn plain(config: &'a LlmConfig, request: &'a CompletionRequest) -> Self {
        Self {
            model: &config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system: request.system.as_deref(),
            messages: &request.messages,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    /// A request whose only tool is `output`, with `tool_choice` forcing it.
    fn forced_tool(
        config: &'a LlmConfig,
        request: &'a CompletionRequest,
        output: &'a OutputSchema,
    ) -> Self {
        Self {
            tools: vec![ToolDefinition {
                name: &output.name,
                description: &output.description,
                input_schema: &output.schema,
            }],
            tool_choice: Some(json!({ "type": "tool", "name": output.name })),
            ..Self::plain(config, request)
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolDefinition<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Anthropic Messages API client with a shared rate limiter.
pub struct AnthropicClient {
    client: reqwest::Client,
    config: LlmConfig,
    limiter: Arc<RateLimiter>,
}

impl AnthropicClient {
    pub fn new(
        config: LlmConfig,
        api_key: SecretValue,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, StackResearchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        let mut key = HeaderValue::from_str(api_key.expose()).map_err(|_| {
            StackResearchError::InvalidConfiguration(format!(
                "{} contains characters not allowed in a header",
                config.api_key_env
            ))
        })?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    async fn send(
        &self,
        kind: &'static str,
        body: &MessagesRequest<'_>,
    ) -> Result<MessagesResponse, StackResearchError> {
        self.limiter.acquire().await;

        let started = Instant::now();
        let result = self.send_inner(body).await;
        record_model_call(kind, result.is_ok(), started.elapsed().as_millis() as u64);
        result
    }

    async fn send_inner(
        &self,
        body: &MessagesRequest<'_>,
    ) -> Result<MessagesResponse, StackResearchError> {
        let response = self.client.post(self.endpoint()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StackResearchError::Api {
                service: "anthropic",
                status: status.as_u16(),
                body: sanitize_error_body(&text),
            });
        }
        let parsed: MessagesResponse = response.json().await?;
        debug!(
            blocks = parsed.content.len(),
            stop_reason = ?parsed.stop_reason,
            "anthropic response received"
        );
        Ok(parsed)
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    #[instrument(name = "llm.complete", skip(self, request), fields(model = %self.config.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<String, StackResearchError> {
        let body = MessagesRequest::plain(&self.config, &request);
        let response = self.send("complete", &body).await?;
        Ok(collect_text(&response.content))
    }

    #[instrument(
        name = "llm.structured",
        skip(self, request, output),
        fields(model = %self.config.model, tool = %output.name)
    )]
    async fn structured(
        &self,
        request: CompletionRequest,
        output: &OutputSchema,
    ) -> Result<Value, StackResearchError> {
        let body = MessagesRequest::forced_tool(&self.config, &request, output);
        let response = self.send("structured", &body).await?;

        if let Some(input) = tool_input(&response.content, &output.name) {
            return Ok(input);
        }

        warn!(tool = %output.name, "model answered without the forced tool; parsing text");
        parse_json_text(&collect_text(&response.content))
    }
}

/// Input of the first `tool_use` block named `tool`.
fn tool_input(blocks: &[ContentBlock], tool: &str) -> Option<Value> {
    blocks.iter().find_map(|block| match block {
        ContentBlock::ToolUse { name, input } if name == tool => Some(input.clone()),
        _ => None,
    })
}

fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// Parse a JSON object out of free text, tolerating markdown fences and surrounding prose.
pub(crate) fn parse_json_text(text: &str) -> Result<Value, StackResearchError> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Ok(value);
    }

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str(&unfenced[start..=end]).map_err(|err| {
                StackResearchError::Parse(format!(
                    "{err}; content: {}",
                    sanitize_error_body(unfenced)
                ))
            })
        }
        _ => Err(StackResearchError::Parse(format!(
            "no JSON object in model output: {}",
            sanitize_error_body(unfenced)
        ))),
    }
}
