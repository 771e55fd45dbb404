use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use crate::encode::EncodedImage;
use crate::error::{truncate_text, ConfigError};

pub const DEFAULT_AZURE_DEPLOYMENT: &str = "o4-mini-team1";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-12-01-preview";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);
const OPENAI_MAX_OUTPUT_TOKENS: u64 = 2000;

/// Remote labeler: sends one encoded image plus the context prompt and
/// returns the model's free-form text.
pub trait LabelClient: Send + Sync {
    fn name(&self) -> &str;
    fn label(&self, image: &EncodedImage, prompt: &str) -> Result<String>;
}

/// Credentials and endpoints for the HTTP clients, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub azure_api_key: Option<String>,
    pub azure_endpoint: Option<String>,
    pub azure_api_version: Option<String>,
    pub azure_deployment: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_api_base: Option<String>,
    pub openai_model: Option<String>,
    pub timeout: Option<Duration>,
}

impl ClientSettings {
    pub fn from_env() -> Self {
        Self {
            azure_api_key: first_non_empty_env(&["AZURE_OPENAI_API_KEY", "AOAI_API_KEY"]),
            azure_endpoint: first_non_empty_env(&["AZURE_OPENAI_ENDPOINT", "AOAI_API_ENDPOINT"]),
            azure_api_version: first_non_empty_env(&[
                "AZURE_OPENAI_API_VERSION",
                "AOAI_API_VERSION",
            ]),
            azure_deployment: first_non_empty_env(&[
                "AZURE_OPENAI_DEPLOYMENT",
                "AOAI_DEPLOYMENT",
            ]),
            openai_api_key: first_non_empty_env(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"]),
            openai_api_base: first_non_empty_env(&["OPENAI_API_BASE", "OPENAI_BASE_URL"]),
            openai_model: first_non_empty_env(&["FRAMELABEL_MODEL"]),
            timeout: None,
        }
    }

    /// Overrides the model (OpenAI) and deployment (Azure) names.
    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model.map(|value| value.trim().to_string()) {
            if !model.is_empty() {
                self.azure_deployment = Some(model.clone());
                self.openai_model = Some(model);
            }
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn http_client(&self) -> Result<HttpClient, ConfigError> {
        HttpClient::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|err| ConfigError::HttpClient(err.to_string()))
    }
}

#[derive(Default)]
pub struct LabelClientRegistry {
    clients: BTreeMap<String, Arc<dyn LabelClient>>,
    unavailable: BTreeMap<String, String>,
}

impl LabelClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every client the settings allow. Clients lacking
    /// credentials are remembered so `resolve` can say what is missing.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        registry.register(DryrunClient);
        match AzureOpenAiClient::from_settings(settings) {
            Ok(client) => registry.register(client),
            Err(ConfigError::MissingCredential { client, missing }) => {
                registry.unavailable.insert(client, missing);
            }
            Err(err) => return Err(err),
        }
        match OpenAiClient::from_settings(settings) {
            Ok(client) => registry.register(client),
            Err(ConfigError::MissingCredential { client, missing }) => {
                registry.unavailable.insert(client, missing);
            }
            Err(err) => return Err(err),
        }
        Ok(registry)
    }

    pub fn register<C: LabelClient + 'static>(&mut self, client: C) {
        let name = client.name().to_string();
        self.unavailable.remove(&name);
        self.clients.insert(name, Arc::new(client));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LabelClient>> {
        self.clients.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn LabelClient>, ConfigError> {
        if let Some(client) = self.get(name) {
            return Ok(client);
        }
        if let Some(missing) = self.unavailable.get(name) {
            return Err(ConfigError::MissingCredential {
                client: name.to_string(),
                missing: missing.clone(),
            });
        }
        Err(ConfigError::UnknownClient(
            name.to_string(),
            self.names().join(", "),
        ))
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }
}

/// Offline client that answers with a fenced JSON label describing the
/// payload it received.
pub struct DryrunClient;

impl LabelClient for DryrunClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn label(&self, image: &EncodedImage, prompt: &str) -> Result<String> {
        let body = json!({
            "source": "dryrun",
            "mime": image.mime,
            "bytes": image.byte_len,
            "prompt_chars": prompt.chars().count(),
        });
        Ok(format!(
            "Dry run label:\n```json\n{}\n```",
            serde_json::to_string_pretty(&body)?
        ))
    }
}

/// Chat completions against an Azure OpenAI deployment.
pub struct AzureOpenAiClient {
    endpoint: String,
    api_key: String,
    api_version: String,
    deployment: String,
    http: HttpClient,
}

impl AzureOpenAiClient {
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ConfigError> {
        let missing = [
            ("AZURE_OPENAI_API_KEY (or AOAI_API_KEY)", &settings.azure_api_key),
            ("AZURE_OPENAI_ENDPOINT (or AOAI_API_ENDPOINT)", &settings.azure_endpoint),
        ]
        .iter()
        .filter(|(_, value)| value.is_none())
        .map(|(key, _)| *key)
        .collect::<Vec<&str>>();
        let (Some(api_key), Some(endpoint)) = (&settings.azure_api_key, &settings.azure_endpoint)
        else {
            return Err(ConfigError::MissingCredential {
                client: "azure".to_string(),
                missing: missing.join(" and "),
            });
        };
        Ok(Self {
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            api_key: api_key.clone(),
            api_version: settings
                .azure_api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
            deployment: settings
                .azure_deployment
                .clone()
                .unwrap_or_else(|| DEFAULT_AZURE_DEPLOYMENT.to_string()),
            http: settings.http_client()?,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

impl LabelClient for AzureOpenAiClient {
    fn name(&self) -> &str {
        "azure"
    }

    fn label(&self, image: &EncodedImage, prompt: &str) -> Result<String> {
        let payload = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": image.data_url()}},
                ],
            }],
        });
        let response = self
            .http
            .post(self.completions_url())
            .header("api-key", &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .context("azure-openai request failed")?;
        let parsed = response_json_or_error("azure-openai", response)?;
        let text = extract_chat_completion_text(&parsed);
        if text.trim().is_empty() {
            bail!("azure-openai returned no message content");
        }
        Ok(text)
    }
}

/// OpenAI `/responses` endpoint with an `input_image` part.
pub struct OpenAiClient {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl OpenAiClient {
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ConfigError> {
        let Some(api_key) = settings.openai_api_key.clone() else {
            return Err(ConfigError::MissingCredential {
                client: "openai".to_string(),
                missing: "OPENAI_API_KEY".to_string(),
            });
        };
        Ok(Self {
            api_base: normalize_api_base(
                settings
                    .openai_api_base
                    .as_deref()
                    .unwrap_or(DEFAULT_OPENAI_BASE),
            ),
            api_key,
            model: settings
                .openai_model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            http: settings.http_client()?,
        })
    }
}

impl LabelClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn label(&self, image: &EncodedImage, prompt: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "input": [{
                "role": "user",
                "content": [
                    {"type": "input_text", "text": prompt},
                    {"type": "input_image", "image_url": image.data_url()},
                ],
            }],
            "max_output_tokens": OPENAI_MAX_OUTPUT_TOKENS,
        });
        let response = self
            .http
            .post(format!("{}/responses", self.api_base))
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .context("openai request failed")?;
        let parsed = response_json_or_error("openai", response)?;
        let text = extract_openai_output_text(&parsed);
        if text.trim().is_empty() {
            bail!("openai returned no output text");
        }
        Ok(text)
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn extract_chat_completion_text(response: &Value) -> String {
    let Some(content) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
    else {
        return String::new();
    };
    match content {
        Value::String(text) => text.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect::<Vec<&str>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn extract_openai_output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        let kind = obj.get("type").and_then(Value::as_str).unwrap_or("message");
        if matches!(kind, "output_text" | "text") {
            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
            continue;
        }
        if kind != "message" {
            continue;
        }
        let content = obj
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for chunk in content {
            let kind = chunk.get("type").and_then(Value::as_str).unwrap_or_default();
            if !matches!(kind, "output_text" | "text") {
                continue;
            }
            if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
        }
    }
    parts.join("\n")
}

fn normalize_api_base(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}

fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use framelabel_contracts::parse::parse_label_response;

    use super::{
        extract_chat_completion_text, extract_openai_output_text, normalize_api_base,
        AzureOpenAiClient, ClientSettings, DryrunClient, LabelClient, LabelClientRegistry,
    };
    use crate::encode::EncodedImage;
    use crate::error::ConfigError;

    #[test]
    fn dryrun_output_parses_as_label() -> anyhow::Result<()> {
        let image = EncodedImage::from_bytes(b"abc", "image/jpeg");
        let text = DryrunClient.label(&image, "label this")?;
        let parsed = parse_label_response(&text)?;
        assert_eq!(parsed.get("bytes"), Some(&json!(3)));
        assert_eq!(parsed.get("prompt_chars"), Some(&json!(10)));
        Ok(())
    }

    #[test]
    fn chat_completion_text_handles_string_and_parts() {
        let plain = json!({"choices": [{"message": {"content": "  {\"a\": 1} "}}]});
        assert_eq!(extract_chat_completion_text(&plain), "{\"a\": 1}");

        let parts = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "```json"},
            {"type": "text", "text": "{}\n```"},
        ]}}]});
        assert_eq!(extract_chat_completion_text(&parts), "```json\n{}\n```");
        assert_eq!(extract_chat_completion_text(&json!({"choices": []})), "");
    }

    #[test]
    fn responses_text_prefers_output_text_then_message_chunks() {
        let direct = json!({"output_text": "hello"});
        assert_eq!(extract_openai_output_text(&direct), "hello");

        let nested = json!({"output": [
            {"type": "reasoning", "summary": []},
            {"type": "message", "content": [
                {"type": "output_text", "text": "{\"scene\": \"road\"}"},
            ]},
        ]});
        assert_eq!(extract_openai_output_text(&nested), "{\"scene\": \"road\"}");
    }

    #[test]
    fn api_base_gets_version_suffix() {
        assert_eq!(
            normalize_api_base("https://proxy.example.com/"),
            "https://proxy.example.com/v1"
        );
        assert_eq!(
            normalize_api_base("https://api.openai.com/v1/"),
            "https://api.openai.com/v1"
        );
    }

    #[test]
    fn registry_explains_missing_credentials() {
        let registry = LabelClientRegistry::from_settings(&ClientSettings::default())
            .unwrap_or_default();
        assert_eq!(registry.names(), vec!["dryrun"]);
        assert!(registry.resolve("dryrun").is_ok());

        let missing = match registry.resolve("azure").err() {
            Some(ConfigError::MissingCredential { missing, .. }) => missing,
            other => panic!("expected missing credential, got {other:?}"),
        };
        assert!(missing.contains("AZURE_OPENAI_API_KEY"));
        let unknown = registry.resolve("bogus").err();
        assert!(matches!(unknown, Some(ConfigError::UnknownClient(..))));
    }

    #[test]
    fn azure_url_uses_deployment_and_version() -> anyhow::Result<()> {
        let settings = ClientSettings {
            azure_api_key: Some("key".to_string()),
            azure_endpoint: Some("https://example.openai.azure.com/".to_string()),
            ..ClientSettings::default()
        }
        .with_model(Some("vision-prod".to_string()));
        let client = AzureOpenAiClient::from_settings(&settings)?;
        assert_eq!(
            client.completions_url(),
            "https://example.openai.azure.com/openai/deployments/vision-prod/chat/completions?api-version=2024-12-01-preview"
        );
        Ok(())
    }
}
