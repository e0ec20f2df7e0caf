use crate::core::error::{BackendError, Result as StoryResult, StorybookError};
use crate::utils::media::split_data_uri;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
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

fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    2
}

/// One chat completion. `image_url` attaches a picture for vision-capable models.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub image_url: Option<&'a str>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(system: &'a str, user: &'a str) -> Self {
        Self {
            system,
            user,
            ..Default::default()
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn image(mut self, image_url: &'a str) -> Self {
        self.image_url = Some(image_url);
        self
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, request: &ChatRequest<'_>) -> Result<String, BackendError>;
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
}

/// Build the configured provider, optionally swapping in another model id.
pub fn create_llm(
    config: &LlmConfig,
    model_override: Option<&str>,
) -> StoryResult<Box<dyn LlmClient>> {
    let pick = |model: &str| model_override.unwrap_or(model).to_string();
    match config.llm_provider() {
        "gemini" => {
            let cfg = config.gemini.as_ref().ok_or_else(|| missing("gemini"))?;
            Ok(Box::new(GeminiClient::new(&cfg.api_key, &pick(&cfg.model))))
        }
        "ollama" => {
            let cfg = config.ollama.as_ref().ok_or_else(|| missing("ollama"))?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &pick(&cfg.model))))
        }
        "openai" => {
            let cfg = config.openai.as_ref().ok_or_else(|| missing("openai"))?;
            Ok(Box::new(OpenAIClient::new(
                &cfg.api_key,
                &pick(&cfg.model),
                cfg.base_url.as_deref(),
            )))
        }
        other => Err(StorybookError::Config(format!("Unknown LLM provider: {}", other))),
    }
}

impl LlmConfig {
    fn llm_provider(&self) -> &str {
        self.provider.trim()
    }
}

fn missing(provider: &str) -> StorybookError {
    StorybookError::Config(format!("{} config missing", provider))
}

async fn read_body(provider: &str, resp: reqwest::Response) -> Result<String, BackendError> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| BackendError::transport(provider, e))?;
    if !status.is_success() {
        return Err(BackendError::from_status(provider, status.as_u16(), &body));
    }
    Ok(body)
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
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
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Inline { inline_data: GeminiBlob },
    File { file_data: GeminiFile },
}

#[derive(Serialize)]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GeminiFile {
    file_uri: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
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
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn parse_gemini_response(body: &str) -> Result<String, BackendError> {
    let result: GeminiResponse =
        serde_json::from_str(body).map_err(|e| BackendError::malformed("gemini", e))?;

    if let Some(err) = result.error {
        return Err(BackendError::new("gemini", err.message));
    }

    let first = result
        .candidates
        .as_ref()
        .and_then(|c| c.first())
        .ok_or_else(|| BackendError::malformed("gemini", "no candidates"))?;

    let text: String = first
        .content
        .as_ref()
        .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
        return Err(BackendError::malformed(
            "gemini",
            format!("empty response, finish reason: {}", reason),
        ));
    }
    Ok(text)
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, request: &ChatRequest<'_>) -> Result<String, BackendError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let mut parts = vec![GeminiPart::Text {
            text: request.user.to_string(),
        }];
        if let Some(image) = request.image_url {
            parts.push(match split_data_uri(image) {
                Some((mime, data)) => GeminiPart::Inline {
                    inline_data: GeminiBlob {
                        mime_type: mime.to_string(),
                        data: data.to_string(),
                    },
                },
                None => GeminiPart::File {
                    file_data: GeminiFile {
                        file_uri: image.to_string(),
                    },
                },
            });
        }

        let generation_config = (request.temperature.is_some() || request.max_tokens.is_some())
            .then(|| GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            });

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts,
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart::Text {
                    text: request.system.to_string(),
                }],
            }),
            generation_config,
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| BackendError::transport("gemini", e))?;

        let body = read_body("gemini", resp).await?;
        parse_gemini_response(&body)
    }

    fn provider(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

fn parse_ollama_response(body: &str) -> Result<String, BackendError> {
    let result: OllamaResponse =
        serde_json::from_str(body).map_err(|e| BackendError::malformed("ollama", e))?;
    Ok(result.message.content)
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, request: &ChatRequest<'_>) -> Result<String, BackendError> {
        let url = format!("{}/api/chat", self.base_url);

        let images = match request.image_url {
            None => Vec::new(),
            Some(image) => match split_data_uri(image) {
                Some((_, data)) => vec![data.to_string()],
                None => {
                    return Err(BackendError::new(
                        "ollama",
                        "images must be sent inline as base64 data URIs",
                    ))
                }
            },
        };

        let options = (request.temperature.is_some() || request.max_tokens.is_some()).then(|| {
            OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            }
        });

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: request.system.to_string(),
                    images: Vec::new(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: request.user.to_string(),
                    images,
                },
            ],
            stream: false,
            options,
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| BackendError::transport("ollama", e))?;

        let body = read_body("ollama", resp).await?;
        parse_ollama_response(&body)
    }

    fn provider(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: OpenAIContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OpenAIContent {
    Text(String),
    Parts(Vec<OpenAIPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAIPart {
    Text { text: String },
    ImageUrl { image_url: OpenAIImageUrl },
}

#[derive(Serialize)]
struct OpenAIImageUrl {
    url: String,
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

fn parse_openai_response(body: &str) -> Result<String, BackendError> {
    let result: OpenAIResponse =
        serde_json::from_str(body).map_err(|e| BackendError::malformed("openai", e))?;
    result
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| BackendError::malformed("openai", "response empty or missing content"))
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, request: &ChatRequest<'_>) -> Result<String, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);

        let user_content = match request.image_url {
            None => OpenAIContent::Text(request.user.to_string()),
            Some(image) => OpenAIContent::Parts(vec![
                OpenAIPart::Text {
                    text: request.user.to_string(),
                },
                OpenAIPart::ImageUrl {
                    image_url: OpenAIImageUrl {
                        url: image.to_string(),
                    },
                },
            ]),
        };

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: OpenAIContent::Text(request.system.to_string()),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: user_content,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| BackendError::transport("openai", e))?;

        let body = read_body("openai", resp).await?;
        parse_openai_response(&body)
    }

    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let err = parse_gemini_response(json).unwrap_err();
        assert!(err.message.contains("SAFETY"));
        assert!(!err.retryable);
    }

    #[test]
    fn test_gemini_response_parsing_empty_content() {
        let json = r#"{
            "candidates": [
                {
                    "content": { "role": "model" },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let candidate = &result.candidates.as_ref().unwrap()[0];
        assert!(candidate.content.as_ref().unwrap().parts.is_empty());
        assert!(parse_gemini_response(json).is_err());
    }

    #[test]
    fn test_gemini_response_parsing_success() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "Once upon " },
                            { "text": "a time" }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        assert_eq!(parse_gemini_response(json).unwrap(), "Once upon a time");
    }

    #[test]
    fn test_gemini_api_error_is_reported() {
        let json = r#"{ "error": { "code": 400, "message": "API key not valid" } }"#;
        let err = parse_gemini_response(json).unwrap_err();
        assert_eq!(err.provider, "gemini");
        assert!(err.message.contains("API key not valid"));
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1677652288,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello there, how may I assist you today?"
                },
                "logprobs": null,
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 9,
                "completion_tokens": 12,
                "total_tokens": 21
            }
        }"#;

        assert_eq!(
            parse_openai_response(json).unwrap(),
            "Hello there, how may I assist you today?"
        );
    }

    #[test]
    fn test_openai_null_content_is_malformed() {
        let json = r#"{ "choices": [{ "message": { "role": "assistant", "content": null } }] }"#;
        let err = parse_openai_response(json).unwrap_err();
        assert!(err.message.starts_with("malformed response"));

        assert!(parse_openai_response("not json").is_err());
    }

    #[test]
    fn test_ollama_response_parsing() {
        let json = r#"{ "model": "llama3", "message": { "role": "assistant", "content": "hi" }, "done": true }"#;
        assert_eq!(parse_ollama_response(json).unwrap(), "hi");
    }

    #[test]
    fn test_openai_vision_message_shape() {
        let message = OpenAIMessage {
            role: "user".to_string(),
            content: OpenAIContent::Parts(vec![
                OpenAIPart::Text {
                    text: "describe".to_string(),
                },
                OpenAIPart::ImageUrl {
                    image_url: OpenAIImageUrl {
                        url: "https://img/kid.png".to_string(),
                    },
                },
            ]),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][1]["type"], "image_url");
        assert_eq!(value["content"][1]["image_url"]["url"], "https://img/kid.png");
    }

    #[test]
    fn test_create_llm_applies_model_override() {
        let config = LlmConfig {
            provider: "openai".to_string(),
            retry_count: 0,
            retry_delay_seconds: 0,
            gemini: None,
            ollama: None,
            openai: Some(OpenAIConfig {
                api_key: "sk-test".to_string(),
                model: "gpt-4o-mini".to_string(),
                base_url: None,
            }),
        };

        let default = create_llm(&config, None).unwrap();
        assert_eq!(default.provider(), "openai");
        assert_eq!(default.model(), "gpt-4o-mini");

        let scenes = create_llm(&config, Some("gpt-4o")).unwrap();
        assert_eq!(scenes.model(), "gpt-4o");

        let mut gemini = config.clone();
        gemini.provider = "gemini".to_string();
        assert!(matches!(
            create_llm(&gemini, None),
            Err(StorybookError::Config(_))
        ));
    }
}
