use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::error::{PipelineError, Result};

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String, // "anthropic", "gemini", "ollama" or "openai"
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub anthropic: Option<AnthropicConfig>,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AnthropicConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_provider() -> String {
    "anthropic".to_string()
}
fn default_max_tokens() -> u32 {
    3000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_anthropic_model() -> String {
    "claude-sonnet-4-5".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            anthropic: None,
            gemini: None,
            ollama: None,
            openai: None,
        }
    }
}

impl LlmConfig {
    /// Fills empty API keys from the environment. Values in the file win.
    pub fn apply_env<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        match self.provider.as_str() {
            "anthropic" => {
                let cfg = self.anthropic.get_or_insert_with(|| AnthropicConfig {
                    model: default_anthropic_model(),
                    ..Default::default()
                });
                fill(&mut cfg.api_key, lookup("ANTHROPIC_API_KEY"));
            }
            "openai" => {
                if let Some(cfg) = self.openai.as_mut() {
                    fill(&mut cfg.api_key, lookup("OPENAI_API_KEY"));
                }
            }
            "gemini" => {
                if let Some(cfg) = self.gemini.as_mut() {
                    fill(&mut cfg.api_key, lookup("GEMINI_API_KEY"));
                }
            }
            _ => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        let missing = |what: &str| {
            Err(PipelineError::configuration(format!(
                "llm.{} is required for provider '{}'",
                what, self.provider
            )))
        };
        match self.provider.as_str() {
            "anthropic" => match &self.anthropic {
                Some(cfg) if !cfg.api_key.is_empty() => {}
                _ => return missing("anthropic.api_key (or ANTHROPIC_API_KEY)"),
            },
            "openai" => match &self.openai {
                Some(cfg) if !cfg.api_key.is_empty() => {}
                _ => return missing("openai.api_key (or OPENAI_API_KEY)"),
            },
            "gemini" => match &self.gemini {
                Some(cfg) if !cfg.api_key.is_empty() => {}
                _ => return missing("gemini.api_key (or GEMINI_API_KEY)"),
            },
            "ollama" => {
                if self.ollama.is_none() {
                    return missing("ollama");
                }
            }
            other => {
                return Err(PipelineError::configuration(format!(
                    "Unknown LLM provider: {}",
                    other
                )))
            }
        }
        if self.max_tokens == 0 {
            return Err(PipelineError::configuration("llm.max_tokens must be positive"));
        }
        Ok(())
    }
}

fn fill(slot: &mut String, value: Option<String>) {
    if slot.is_empty() {
        if let Some(v) = value {
            *slot = v;
        }
    }
}

pub fn create_llm(config: &LlmConfig, client: reqwest::Client) -> Result<Arc<dyn LlmClient>> {
    let missing = |name: &str| PipelineError::configuration(format!("{} config missing", name));
    match config.provider.as_str() {
        "anthropic" => {
            let cfg = config.anthropic.as_ref().ok_or_else(|| missing("Anthropic"))?;
            Ok(Arc::new(AnthropicClient::new(cfg, config, client)))
        }
        "gemini" => {
            let cfg = config.gemini.as_ref().ok_or_else(|| missing("Gemini"))?;
            Ok(Arc::new(GeminiClient::new(&cfg.api_key, &cfg.model, config, client)))
        }
        "ollama" => {
            let cfg = config.ollama.as_ref().ok_or_else(|| missing("Ollama"))?;
            Ok(Arc::new(OllamaClient::new(&cfg.base_url, &cfg.model, config, client)))
        }
        "openai" => {
            let cfg = config.openai.as_ref().ok_or_else(|| missing("OpenAI"))?;
            Ok(Arc::new(OpenAIClient::new(
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
                config,
                client,
            )))
        }
        other => Err(PipelineError::configuration(format!(
            "Unknown LLM provider: {}",
            other
        ))),
    }
}

async fn send_json<T: Serialize + ?Sized>(
    service: &str,
    request: reqwest::RequestBuilder,
    body: &T,
) -> Result<String> {
    let resp = request
        .json(body)
        .send()
        .await
        .map_err(|e| PipelineError::from_reqwest(service, e))?;

    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| PipelineError::from_reqwest(service, e))?;
    if !status.is_success() {
        return Err(PipelineError::from_status(service, status, &text));
    }
    Ok(text)
}

fn parse_body<T: for<'de> Deserialize<'de>>(service: &str, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| {
        PipelineError::validation(format!(
            "Failed to parse {} response: {}. Body: {}",
            service, e, body
        ))
    })
}

// --- Anthropic ---
#[derive(Debug)]
struct AnthropicClient {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicClient {
    fn new(cfg: &AnthropicConfig, llm: &LlmConfig, client: reqwest::Client) -> Self {
        Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            base_url: cfg
                .base_url
                .as_deref()
                .unwrap_or("https://api.anthropic.com")
                .trim_end_matches('/')
                .to_string(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            client,
        }
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url);
        let request_body = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: user,
            }],
        };

        let request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01");
        let body = send_json("Anthropic", request, &request_body).await?;
        let result: AnthropicResponse = parse_body("Anthropic", &body)?;

        let text: String = result
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            let reason = result.stop_reason.as_deref().unwrap_or("UNKNOWN");
            return Err(PipelineError::validation(format!(
                "Anthropic response empty. Stop reason: {}",
                reason
            )));
        }
        Ok(text)
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str, llm: &LlmConfig, client: reqwest::Client) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            client,
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: user.to_string(),
                }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: system.to_string(),
                }],
            }),
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let request = self.client.post(&url).header("x-goog-api-key", &self.api_key);
        let body = send_json("Gemini", request, &request_body).await?;
        let result: GeminiResponse = parse_body("Gemini", &body)?;

        if let Some(err) = result.error {
            return Err(PipelineError::TerminalExternal {
                service: "Gemini".to_string(),
                message: err.message,
            });
        }

        if let Some(candidates) = result.candidates {
            if let Some(first) = candidates.first() {
                if let Some(content) = &first.content {
                    if let Some(part) = content.parts.first() {
                        return Ok(part.text.clone());
                    }
                }

                let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
                return Err(PipelineError::validation(format!(
                    "Gemini response empty. Finish reason: {}",
                    reason
                )));
            }
        }

        Err(PipelineError::validation(format!(
            "Gemini response format unexpected or empty. Body: {}",
            body
        )))
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str, llm: &LlmConfig, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature: llm.temperature,
            client,
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Debug, Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let body = send_json("Ollama", self.client.post(&url), &request_body).await?;
        let result: OllamaResponse = parse_body("Ollama", &body)?;
        Ok(result.message.content)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(
        api_key: &str,
        model: &str,
        base_url: Option<&str>,
        llm: &LlmConfig,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            client,
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key));
        let body = send_json("OpenAI", request, &request_body).await?;
        let result: OpenAIResponse = parse_body("OpenAI", &body)?;
        if let Some(choice) = result.choices.first() {
            if let Some(content) = &choice.message.content {
                return Ok(content.clone());
            }
        }

        Err(PipelineError::validation(
            "OpenAI response empty or missing content",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_anthropic_response_joins_text_blocks() {
        let json = r####"{
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "content": [
                { "type": "text", "text": "### SEGMENT SCRIPT\n" },
                { "type": "text", "text": "Alex: Hello" }
            ],
            "stop_reason": "end_turn"
        }"####;

        let result: AnthropicResponse = serde_json::from_str(json).unwrap();
        let text: Vec<_> = result.content.iter().filter_map(|b| b.text.as_deref()).collect();
        assert_eq!(text.join(""), "### SEGMENT SCRIPT\nAlex: Hello");
        assert_eq!(result.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_gemini_response_parsing_safety_block() {
        // Content is missing when the candidate was blocked.
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let candidate = &result.candidates.as_ref().unwrap()[0];

        assert!(candidate.content.is_none());
        assert_eq!(candidate.finish_reason.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello there"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.choices[0].message.content.as_deref(), Some("Hello there"));
    }

    #[test]
    fn test_unparseable_body_is_validation_error() {
        let err = parse_body::<OllamaResponse>("Ollama", "<html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_env_fills_missing_anthropic_key() {
        let mut cfg = LlmConfig::default();
        assert!(cfg.validate().is_err());

        let lookup = |name: &str| {
            (name == "ANTHROPIC_API_KEY").then(|| "sk-test".to_string())
        };
        cfg.apply_env(&lookup);
        assert_eq!(cfg.anthropic.as_ref().unwrap().api_key, "sk-test");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_file_key_wins_over_env() {
        let mut cfg = LlmConfig {
            provider: "openai".to_string(),
            openai: Some(OpenAIConfig {
                api_key: "from-file".to_string(),
                model: "gpt-4o".to_string(),
                base_url: None,
            }),
            ..Default::default()
        };
        cfg.apply_env(&|_: &str| Some("from-env".to_string()));
        assert_eq!(cfg.openai.unwrap().api_key, "from-file");
    }

    #[test]
    fn test_unknown_provider_is_configuration_error() {
        let cfg = LlmConfig {
            provider: "mystery".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }
}
