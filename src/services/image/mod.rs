pub mod replicate;

use crate::core::error::{BackendError, Result, StorybookError};
use crate::core::illustration::IllustrationRequest;
use crate::core::io::Storage;
use crate::utils::media::{is_inline_or_remote, mime_for_path, to_data_uri};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

pub use replicate::ReplicateConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_image_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Model parameters sent with every call unless overridden.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub replicate: Option<ReplicateConfig>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_image_provider(),
            model: default_image_model(),
            retry_count: default_image_retry_count(),
            retry_delay_seconds: default_image_retry_delay(),
            parameters: BTreeMap::new(),
            replicate: None,
        }
    }
}

fn default_image_provider() -> String {
    "replicate".to_string()
}
fn default_image_model() -> String {
    "zsxkib/instant-id".to_string()
}
fn default_image_retry_count() -> usize {
    2
}
fn default_image_retry_delay() -> u64 {
    5
}

#[async_trait]
pub trait ImageClient: Send + Sync + Debug {
    /// Ordered image references (usually URLs) for one request.
    async fn generate(
        &self,
        request: &IllustrationRequest,
    ) -> std::result::Result<Vec<String>, BackendError>;
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
}

pub fn create_image_client(
    config: &ImageConfig,
    model_override: Option<&str>,
) -> Result<Box<dyn ImageClient>> {
    let model = model_override.unwrap_or(&config.model);
    match config.provider.trim() {
        "replicate" => {
            let cfg = config.replicate.clone().unwrap_or_default();
            if cfg.api_token.trim().is_empty() {
                return Err(StorybookError::Config(
                    "Replicate API token missing (set image.replicate.api_token or REPLICATE_API_TOKEN)"
                        .to_string(),
                ));
            }
            replicate::check_model_supported(model)
                .map_err(|e| StorybookError::Config(e.message))?;
            Ok(Box::new(replicate::ReplicateClient::new(&cfg, model)))
        }
        other => Err(StorybookError::Config(format!("Unknown image provider: {}", other))),
    }
}

/// Turn a local image path into a data URI. URLs and data URIs pass through.
pub async fn resolve_image_reference(storage: &dyn Storage, reference: &str) -> Result<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(StorybookError::Config("a reference image is required".to_string()));
    }
    if is_inline_or_remote(reference) {
        return Ok(reference.to_string());
    }
    if !storage.exists(reference).await? {
        return Err(StorybookError::Config(format!(
            "reference image not found at '{}'",
            reference
        )));
    }
    let bytes = storage.read(reference).await?;
    Ok(to_data_uri(&bytes, mime_for_path(Path::new(reference))))
}

/// Flatten whatever a backend returned into a list of image references.
pub fn normalize_image_outputs(raw: &Value) -> Vec<String> {
    let outputs: Vec<String> = match raw {
        Value::Null => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => {
            if items.is_empty() {
                return Vec::new();
            }
            // Some models stream a single URL character by character.
            let single_chars = items
                .iter()
                .all(|item| matches!(item, Value::String(s) if s.chars().count() == 1));
            if single_chars {
                return vec![items.iter().filter_map(Value::as_str).collect()];
            }
            items.iter().flat_map(normalize_image_outputs).collect()
        }
        Value::Object(map) => match map.get("url").and_then(Value::as_str) {
            Some(url) => vec![url.to_string()],
            None => vec![raw.to_string()],
        },
        other => vec![other.to_string()],
    };
    outputs
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use serde_json::json;

    #[test]
    fn test_normalize_image_outputs() {
        assert!(normalize_image_outputs(&Value::Null).is_empty());
        assert_eq!(normalize_image_outputs(&json!("https://a")), vec!["https://a"]);
        assert_eq!(
            normalize_image_outputs(&json!(["h", "t", "t", "p"])),
            vec!["http"]
        );
        let nested = json!(["https://a", ["https://b", null], {"url": "https://c"}, ""]);
        assert_eq!(
            normalize_image_outputs(&nested),
            vec!["https://a", "https://b", "https://c"]
        );
    }

    #[tokio::test]
    async fn test_resolve_image_reference() {
        let storage = NativeStorage::new();
        assert_eq!(
            resolve_image_reference(&storage, "https://img/kid.png").await.unwrap(),
            "https://img/kid.png"
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kid.png");
        std::fs::write(&path, b"hi").unwrap();
        let uri = resolve_image_reference(&storage, path.to_str().unwrap()).await.unwrap();
        assert_eq!(uri, "data:image/png;base64,aGk=");

        let missing = dir.path().join("missing.jpg");
        assert!(matches!(
            resolve_image_reference(&storage, missing.to_str().unwrap()).await,
            Err(StorybookError::Config(_))
        ));
    }

    #[test]
    fn test_create_image_client_checks_token_and_model() {
        let mut config = ImageConfig::default();
        assert!(matches!(
            create_image_client(&config, None),
            Err(StorybookError::Config(_))
        ));

        config.replicate = Some(ReplicateConfig {
            api_token: "r8_test".to_string(),
            ..Default::default()
        });
        let client = create_image_client(&config, None).unwrap();
        assert_eq!(client.provider(), "replicate");
        assert_eq!(client.model(), "zsxkib/instant-id");

        assert!(create_image_client(&config, Some("someone/unknown-model")).is_err());
    }
}
