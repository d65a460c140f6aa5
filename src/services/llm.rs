// LLM adapter: OpenAI-compatible chat completions with per-user settings.
use crate::core::config::LlmConfig;
use crate::storage::UserSettingsRecord;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
const DEFAULT_GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEFAULT_MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
const DEFAULT_TOGETHER_BASE_URL: &str = "https://api.together.xyz/v1";
const DEFAULT_OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434/v1";
const DEFAULT_LMSTUDIO_BASE_URL: &str = "http://127.0.0.1:1234/v1";

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub total_tokens: Option<u64>,
    pub mocked: bool,
}

/// Effective model settings for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub provider: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_output: Option<u32>,
    pub timeout_s: u64,
    pub mock_if_unconfigured: bool,
}

impl LlmSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            provider: normalize_provider(Some(&config.provider)),
            base_url: non_empty(config.base_url.as_deref()),
            api_key: non_empty(config.api_key.as_deref()),
            model: non_empty(Some(&config.model)).unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            temperature: config.temperature,
            max_output: config.max_output,
            timeout_s: config.timeout_s.max(1),
            mock_if_unconfigured: config.mock_if_unconfigured,
        }
    }

    /// A stored settings row picks provider and model; key and base fall back to the global config.
    pub fn resolve(config: &LlmConfig, user: Option<&UserSettingsRecord>) -> Self {
        let mut settings = Self::from_config(config);
        let Some(user) = user else {
            return settings;
        };
        settings.provider = normalize_provider(Some(&user.llm_provider));
        if let Some(model) = non_empty(Some(&user.llm_model)) {
            settings.model = model;
        }
        if let Some(api_key) = non_empty(user.llm_api_key.as_deref()) {
            settings.api_key = Some(api_key);
        }
        if let Some(base_url) = non_empty(user.llm_api_base.as_deref()) {
            settings.base_url = Some(base_url);
        }
        settings
    }

    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| provider_default_base_url(&self.provider).map(str::to_string))
    }

    pub fn is_configured(&self) -> bool {
        if self.api_key.is_some() {
            return true;
        }
        self.base_url.is_some() || is_local_provider(&self.provider)
    }

    pub fn endpoint(&self) -> String {
        let base = self
            .resolved_base_url()
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
        let base = base.trim_end_matches('/');
        if base.ends_with("/v1") || base.ends_with("/openai") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        settings: &LlmSettings,
        messages: &[ChatMessage],
    ) -> Result<LlmResponse>;
}

#[derive(Clone, Default)]
pub struct HttpCompletionBackend {
    http: Client,
}

impl HttpCompletionBackend {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(
        &self,
        settings: &LlmSettings,
        messages: &[ChatMessage],
    ) -> Result<LlmResponse> {
        if !settings.is_configured() {
            if settings.mock_if_unconfigured {
                return Ok(mock_completion(settings, messages));
            }
            return Err(anyhow!("LLM API key not configured"));
        }
        let response = self
            .http
            .post(settings.endpoint())
            .headers(build_headers(settings.api_key.as_deref().unwrap_or("")))
            .timeout(Duration::from_secs(settings.timeout_s))
            .json(&build_payload(settings, messages))
            .send()
            .await
            .context("send llm request")?;
        let status = response.status();
        let body_text = response.text().await.context("read llm response body")?;
        let body = match serde_json::from_str::<Value>(&body_text) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "LLM response json parse failed: {err}, body={}",
                    truncate_text(&body_text, 2048)
                );
                Value::Null
            }
        };
        if !status.is_success() {
            let detail = if body == Value::Null {
                json!({ "raw": truncate_text(&body_text, 2048) })
            } else {
                body
            };
            return Err(anyhow!("LLM request failed: {status} {detail}"));
        }
        if body == Value::Null {
            return Err(anyhow!(
                "LLM response parse failed: {}",
                truncate_text(&body_text, 2048)
            ));
        }
        let content = body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .and_then(|value| value.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let total_tokens = body
            .get("usage")
            .and_then(|value| value.get("total_tokens"))
            .and_then(Value::as_u64);
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&settings.model)
            .to_string();
        Ok(LlmResponse {
            content,
            model,
            total_tokens,
            mocked: false,
        })
    }
}

fn build_payload(settings: &LlmSettings, messages: &[ChatMessage]) -> Value {
    let mut payload = json!({
        "model": settings.model,
        "messages": messages,
        "temperature": round_f32(settings.temperature),
        "stream": false,
    });
    if let Some(max_output) = settings.max_output {
        if max_output > 0 {
            payload["max_tokens"] = json!(max_output);
        }
    }
    payload
}

fn build_headers(api_key: &str) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return headers;
    }
    if let Ok(value) = format!("Bearer {api_key}").parse() {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    headers
}

/// Deterministic answer used when no provider is configured.
pub fn mock_completion(settings: &LlmSettings, messages: &[ChatMessage]) -> LlmResponse {
    let prompt = messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.as_str())
        .unwrap_or("");
    LlmResponse {
        content: format!(
            "[mock:{}] Response for: {}",
            settings.model,
            truncate_text(prompt.trim(), 200)
        ),
        model: settings.model.clone(),
        total_tokens: None,
        mocked: true,
    }
}

pub fn normalize_provider(provider: Option<&str>) -> String {
    let raw = provider.unwrap_or("openai").trim();
    if raw.is_empty() {
        return "openai".to_string();
    }
    let normalized = raw.to_ascii_lowercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "openai_native" | "openai_compat" | "openai_compatible" => "openai".to_string(),
        "lm_studio" => "lmstudio".to_string(),
        other => other.to_string(),
    }
}

pub fn provider_default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some(DEFAULT_OPENAI_BASE_URL),
        "openrouter" => Some(DEFAULT_OPENROUTER_BASE_URL),
        "deepseek" => Some(DEFAULT_DEEPSEEK_BASE_URL),
        "groq" => Some(DEFAULT_GROQ_BASE_URL),
        "mistral" => Some(DEFAULT_MISTRAL_BASE_URL),
        "together" => Some(DEFAULT_TOGETHER_BASE_URL),
        "ollama" => Some(DEFAULT_OLLAMA_BASE_URL),
        "lmstudio" => Some(DEFAULT_LMSTUDIO_BASE_URL),
        _ => None,
    }
}

fn is_local_provider(provider: &str) -> bool {
    matches!(provider, "ollama" | "lmstudio")
}

/// Masks a secret down to its last four characters.
pub fn mask_secret(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return Some("****".to_string());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    Some(format!("****{tail}"))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn round_f32(value: f32) -> f64 {
    const DECIMALS: i32 = 6;
    let factor = 10_f64.powi(DECIMALS);
    ((value as f64) * factor).round() / factor
}

pub fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut output = text[..end].to_string();
    output.push_str("...");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_settings() -> UserSettingsRecord {
        UserSettingsRecord::defaults(1, 0.0)
    }

    #[test]
    fn user_settings_override_provider_and_model() {
        let config = LlmConfig {
            api_key: Some("global-key".to_string()),
            ..LlmConfig::default()
        };
        let mut row = user_settings();
        row.llm_provider = "Ollama".to_string();
        row.llm_model = "llama3".to_string();
        let settings = LlmSettings::resolve(&config, Some(&row));
        assert_eq!(settings.provider, "ollama");
        assert_eq!(settings.model, "llama3");
        assert_eq!(settings.api_key.as_deref(), Some("global-key"));
        assert_eq!(settings.endpoint(), "http://127.0.0.1:11434/v1/chat/completions");

        let global = LlmSettings::resolve(&config, None);
        assert_eq!(global.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn endpoint_appends_version_segment() {
        let settings = LlmSettings {
            base_url: Some("http://localhost:8080/".to_string()),
            ..LlmSettings::from_config(&LlmConfig::default())
        };
        assert_eq!(settings.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[tokio::test]
    async fn unconfigured_backend_mocks_or_fails() {
        let backend = HttpCompletionBackend::default();
        let mut settings = LlmSettings::from_config(&LlmConfig::default());
        assert!(!settings.is_configured());
        let messages = vec![ChatMessage::user("write a haiku")];
        assert!(backend.complete(&settings, &messages).await.is_err());

        settings.mock_if_unconfigured = true;
        let response = backend.complete(&settings, &messages).await.unwrap();
        assert!(response.mocked);
        assert!(response.content.contains("write a haiku"));
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret(Some("sk-abcdef123456")).as_deref(), Some("****3456"));
        assert_eq!(mask_secret(Some("abc")).as_deref(), Some("****"));
        assert_eq!(mask_secret(Some("  ")), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_text("héllo", 2), "h...");
        assert_eq!(truncate_text("short", 10), "short");
    }
}
