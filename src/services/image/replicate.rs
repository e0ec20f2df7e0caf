use super::{normalize_image_outputs, ImageClient};
use crate::core::error::BackendError;
use crate::core::illustration::IllustrationRequest;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

const PROVIDER: &str = "replicate";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplicateConfig {
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: u64,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            base_url: default_base_url(),
            poll_interval_seconds: default_poll_interval(),
            max_wait_seconds: default_max_wait(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.replicate.com/v1".to_string()
}
fn default_poll_interval() -> u64 {
    2
}
fn default_max_wait() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFamily {
    InstantId,
    FluxKontext,
}

const SUPPORTED_MODELS: [(&str, ModelFamily); 2] = [
    ("zsxkib/instant-id", ModelFamily::InstantId),
    ("black-forest-labs/flux-kontext-pro", ModelFamily::FluxKontext),
];

/// `owner/name[:version]` split into its parts.
struct ModelId<'a> {
    owner_name: &'a str,
    version: Option<&'a str>,
}

fn parse_model_id(model: &str) -> ModelId<'_> {
    let model = model.trim();
    match model.split_once(':') {
        Some((owner_name, version)) => ModelId {
            owner_name,
            version: Some(version),
        },
        None => ModelId {
            owner_name: model,
            version: None,
        },
    }
}

fn model_family(model: &str) -> Result<ModelFamily, BackendError> {
    let id = parse_model_id(model).owner_name.to_lowercase();
    SUPPORTED_MODELS
        .iter()
        .find(|(name, _)| *name == id)
        .map(|(_, family)| *family)
        .ok_or_else(|| {
            let supported: Vec<&str> = SUPPORTED_MODELS.iter().map(|(name, _)| *name).collect();
            BackendError::new(
                PROVIDER,
                format!(
                    "model '{}' has no default input payload. Supported models: {}",
                    model,
                    supported.join(", ")
                ),
            )
        })
}

pub fn check_model_supported(model: &str) -> Result<(), BackendError> {
    model_family(model).map(|_| ())
}

/// Prediction input for `model`: the model's defaults, then continuity
/// references and seed, then explicit parameters which win over both.
pub fn build_input(
    model: &str,
    request: &IllustrationRequest,
) -> Result<Map<String, Value>, BackendError> {
    let mut input = Map::new();
    input.insert("prompt".to_string(), json!(request.prompt));
    input.insert("negative_prompt".to_string(), json!(request.negative_prompt));
    input.insert("output_format".to_string(), json!("png"));

    match model_family(model)? {
        ModelFamily::InstantId => {
            input.insert("image".to_string(), json!(request.primary_reference));
            input.insert("sdxl_weights".to_string(), json!("protovision-xl-high-fidel"));
            input.insert("guidance_scale".to_string(), json!(5));
        }
        ModelFamily::FluxKontext => {
            input.insert("input_image".to_string(), json!(request.primary_reference));
            input.insert("safety_tolerance".to_string(), json!(2));
            input.insert("prompt_upsampling".to_string(), json!(true));
            input.insert("aspect_ratio".to_string(), json!("1:1"));
        }
    }

    if let Some(param) = &request.reference_parameter {
        if !request.auxiliary_references.is_empty() {
            input.insert(param.clone(), json!(request.auxiliary_references));
        }
    }
    if let Some(seed) = request.seed {
        input.insert("seed".to_string(), json!(seed));
    }
    for (key, value) in &request.parameters {
        input.insert(key.clone(), value.clone());
    }
    Ok(input)
}

#[derive(Deserialize, Debug)]
struct Prediction {
    #[serde(default)]
    id: String,
    status: String,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Value,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Deserialize, Debug)]
struct PredictionUrls {
    get: Option<String>,
}

fn parse_prediction(body: &str) -> Result<Prediction, BackendError> {
    serde_json::from_str(body).map_err(|e| BackendError::malformed(PROVIDER, e))
}

enum PredictionState {
    Pending,
    Done(Vec<String>),
}

fn prediction_state(prediction: &Prediction) -> Result<PredictionState, BackendError> {
    match prediction.status.as_str() {
        "starting" | "processing" => Ok(PredictionState::Pending),
        "succeeded" => Ok(PredictionState::Done(normalize_image_outputs(&prediction.output))),
        "failed" | "canceled" => {
            let reason = match &prediction.error {
                Value::String(s) => s.clone(),
                Value::Null => "no reason given".to_string(),
                other => other.to_string(),
            };
            Err(BackendError::new(
                PROVIDER,
                format!("prediction {} {}: {}", prediction.id, prediction.status, reason),
            ))
        }
        other => Err(BackendError::malformed(PROVIDER, format!("unknown status '{}'", other))),
    }
}

#[derive(Debug)]
pub struct ReplicateClient {
    api_token: String,
    base_url: String,
    model: String,
    poll_interval: Duration,
    max_wait: Duration,
    client: reqwest::Client,
}

impl ReplicateClient {
    pub fn new(config: &ReplicateConfig, model: &str) -> Self {
        Self {
            api_token: config.api_token.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            poll_interval: Duration::from_secs(config.poll_interval_seconds.max(1)),
            max_wait: Duration::from_secs(config.max_wait_seconds),
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Prediction, BackendError> {
        let resp = builder
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await
            .map_err(|e| BackendError::transport(PROVIDER, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::transport(PROVIDER, e))?;
        if !status.is_success() {
            return Err(BackendError::from_status(PROVIDER, status.as_u16(), &body));
        }
        parse_prediction(&body)
    }
}

#[async_trait]
impl ImageClient for ReplicateClient {
    async fn generate(&self, request: &IllustrationRequest) -> Result<Vec<String>, BackendError> {
        let input = build_input(&self.model, request)?;
        let id = parse_model_id(&self.model);

        let (url, body) = match id.version {
            Some(version) => (
                format!("{}/predictions", self.base_url),
                json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/models/{}/predictions", self.base_url, id.owner_name),
                json!({ "input": input }),
            ),
        };

        info!(
            "Requesting illustration for page {} from {}",
            request.page_number, self.model
        );
        let mut prediction = self
            .send(self.client.post(&url).header("Prefer", "wait").json(&body))
            .await?;

        let started = Instant::now();
        loop {
            match prediction_state(&prediction)? {
                PredictionState::Done(images) => return Ok(images),
                PredictionState::Pending => {
                    if started.elapsed() >= self.max_wait {
                        return Err(BackendError::retryable(
                            PROVIDER,
                            format!(
                                "prediction {} still {} after {:?}",
                                prediction.id, prediction.status, self.max_wait
                            ),
                        ));
                    }
                    debug!("Prediction {} is {}, polling", prediction.id, prediction.status);
                    tokio::time::sleep(self.poll_interval).await;

                    let poll_url = prediction
                        .urls
                        .as_ref()
                        .and_then(|u| u.get.clone())
                        .unwrap_or_else(|| {
                            format!("{}/predictions/{}", self.base_url, prediction.id)
                        });
                    prediction = self.send(self.client.get(&poll_url)).await?;
                }
            }
        }
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::continuity::ContinuityDirectives;
    use std::collections::BTreeMap;

    fn request() -> IllustrationRequest {
        IllustrationRequest {
            page_number: 2,
            model: "zsxkib/instant-id".to_string(),
            prompt: "TASK".to_string(),
            negative_prompt: "blurry".to_string(),
            primary_reference: "https://img/kid.png".to_string(),
            auxiliary_references: vec!["https://img/p1.png".to_string()],
            reference_parameter: Some("reference_images".to_string()),
            seed: Some(43),
            parameters: BTreeMap::new(),
            directives: ContinuityDirectives {
                page_number: 2,
                identity_notes: None,
                supporting_character_notes: Vec::new(),
                static_notes: Vec::new(),
                reference_history: vec!["https://img/p1.png".to_string()],
                primary_reference: "https://img/kid.png".to_string(),
                auxiliary_references: vec!["https://img/p1.png".to_string()],
                reference_parameter: Some("reference_images".to_string()),
                seed: Some(43),
            },
        }
    }

    #[test]
    fn test_instant_id_payload() {
        let input = build_input("zsxkib/instant-id", &request()).unwrap();
        assert_eq!(input["image"], json!("https://img/kid.png"));
        assert_eq!(input["guidance_scale"], json!(5));
        assert_eq!(input["sdxl_weights"], json!("protovision-xl-high-fidel"));
        assert_eq!(input["reference_images"], json!(["https://img/p1.png"]));
        assert_eq!(input["seed"], json!(43));
        assert_eq!(input["negative_prompt"], json!("blurry"));
    }

    #[test]
    fn test_flux_payload_and_parameter_precedence() {
        let mut req = request();
        req.parameters.insert("aspect_ratio".to_string(), json!("3:4"));
        req.parameters.insert("seed".to_string(), json!(7));

        let input = build_input("black-forest-labs/flux-kontext-pro:abc123", &req).unwrap();
        assert_eq!(input["input_image"], json!("https://img/kid.png"));
        assert!(input.get("image").is_none());
        assert_eq!(input["aspect_ratio"], json!("3:4"));
        assert_eq!(input["safety_tolerance"], json!(2));
        assert_eq!(input["prompt_upsampling"], json!(true));
        assert_eq!(input["seed"], json!(7));
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let err = build_input("someone/else", &request()).unwrap_err();
        assert!(err.message.contains("zsxkib/instant-id"));
        assert!(!err.retryable);
    }

    #[test]
    fn test_prediction_states() {
        let done = parse_prediction(
            r#"{"id": "p1", "status": "succeeded", "output": ["https://out/1.png"], "urls": {"get": "https://api/p1"}}"#,
        )
        .unwrap();
        match prediction_state(&done).unwrap() {
            PredictionState::Done(images) => assert_eq!(images, vec!["https://out/1.png"]),
            PredictionState::Pending => panic!("expected done"),
        }

        let pending = parse_prediction(r#"{"id": "p1", "status": "processing"}"#).unwrap();
        assert!(matches!(prediction_state(&pending), Ok(PredictionState::Pending)));

        let failed = parse_prediction(
            r#"{"id": "p1", "status": "failed", "error": "NSFW content detected"}"#,
        )
        .unwrap();
        let err = prediction_state(&failed).err().unwrap();
        assert!(err.message.contains("NSFW"));
        assert!(!err.retryable);
    }
}
