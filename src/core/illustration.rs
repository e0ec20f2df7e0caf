use crate::core::continuity::ContinuityDirectives;
use crate::core::error::{Result, StorybookError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Parameter key read by the prompt builder instead of being sent to the backend.
pub const CAMERA_SHOT_KEY: &str = "camera_shot";

/// Parameter key folded into `IllustrationRequest::seed`.
pub const SEED_KEY: &str = "seed";

/// One image-generation call. Built fresh for every page and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IllustrationRequest {
    pub page_number: u32,
    pub model: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub primary_reference: String,
    pub auxiliary_references: Vec<String>,
    pub reference_parameter: Option<String>,
    pub seed: Option<u64>,
    pub parameters: BTreeMap<String, Value>,
    pub directives: ContinuityDirectives,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IllustrationResult {
    pub page_number: u32,
    pub images: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl IllustrationResult {
    /// First non-blank image reference.
    pub fn primary_image(&self) -> Option<&str> {
        self.images
            .iter()
            .map(|image| image.trim())
            .find(|image| !image.is_empty())
    }
}

/// Seed and model parameters that replace the computed values for a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOverrides {
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl CallOverrides {
    pub fn is_empty(&self) -> bool {
        self.seed.is_none() && self.parameters.is_empty()
    }

    /// `other` wins on every key it sets.
    pub fn overlay(&self, other: &CallOverrides) -> CallOverrides {
        let mut parameters = self.parameters.clone();
        parameters.extend(other.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        CallOverrides {
            seed: other.seed.or(self.seed),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOverrides {
    #[serde(default)]
    pub global: CallOverrides,
    #[serde(default)]
    pub per_page: BTreeMap<u32, CallOverrides>,
}

impl RunOverrides {
    pub fn for_page(&self, page_number: u32) -> CallOverrides {
        match self.per_page.get(&page_number) {
            Some(page) => self.global.overlay(page),
            None => self.global.clone(),
        }
    }
}

/// Parse repeated `KEY=VALUE` arguments. Values are read as JSON when they
/// parse (numbers, booleans, arrays) and kept as plain strings otherwise.
pub fn parse_override_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<BTreeMap<String, Value>> {
    let mut parsed = BTreeMap::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            StorybookError::Config(format!("invalid override '{}', expected KEY=VALUE", pair))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(StorybookError::Config(format!(
                "override '{}' has an empty key",
                pair
            )));
        }
        let raw = raw.trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        parsed.insert(key.to_string(), value);
    }
    Ok(parsed)
}

/// Read a `seed` parameter as an unsigned integer. Numeric strings are accepted.
pub fn seed_from_value(value: &Value) -> Result<u64> {
    let seed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    seed.ok_or_else(|| {
        StorybookError::Config(format!("seed must be a non-negative integer, got {}", value))
    })
}

/// Check every `seed` parameter in `parameters` without consuming it.
pub fn check_seed_parameter(parameters: &BTreeMap<String, Value>) -> Result<()> {
    match parameters.get(SEED_KEY) {
        Some(value) => seed_from_value(value).map(|_| ()),
        None => Ok(()),
    }
}
