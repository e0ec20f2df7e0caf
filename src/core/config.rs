use crate::core::continuity::PrimaryReference;
use crate::core::error::{Result, StorybookError};
use crate::core::illustration::check_seed_parameter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub models: BlockModels,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub pagination: PaginationConfig,

    #[serde(default)]
    pub continuity: ContinuitySettings,

    #[serde(default = "default_scene_concurrency")]
    pub scene_concurrency: usize,
}

/// Per-stage model ids. Unset entries use the provider's configured model.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BlockModels {
    pub story: Option<String>,
    pub pages: Option<String>,
    pub scenes: Option<String>,
    pub identity: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    #[default]
    Sentences,
    Llm,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PaginationConfig {
    #[serde(default = "default_min_pages")]
    pub min_pages: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub strategy: SplitStrategy,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            min_pages: default_min_pages(),
            max_pages: default_max_pages(),
            strategy: SplitStrategy::default(),
        }
    }
}

impl PaginationConfig {
    pub fn default_page_count(&self) -> u32 {
        (self.min_pages + self.max_pages) / 2
    }
}

/// Continuity knobs as written in `config.yml`. Combined with the profile
/// into a `ContinuityConfig` at the start of a run.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContinuitySettings {
    #[serde(default = "default_true")]
    pub automatic_identity_notes: bool,
    #[serde(default)]
    pub identity_notes: Vec<String>,
    #[serde(default)]
    pub supporting_characters: BTreeMap<String, String>,
    #[serde(default)]
    pub static_notes: Vec<String>,
    /// Signed so a negative value reaches validation instead of a parse error.
    #[serde(default)]
    pub reference_history_capacity: i64,
    #[serde(default)]
    pub reference_parameter: Option<String>,
    #[serde(default)]
    pub promote_latest_reference: bool,
    #[serde(default)]
    pub base_seed: Option<u64>,
    #[serde(default)]
    pub auto_seed: bool,
    #[serde(default = "default_true")]
    pub vary_seed_per_page: bool,
    #[serde(default)]
    pub primary_reference: PrimaryReference,
}

impl Default for ContinuitySettings {
    fn default() -> Self {
        Self {
            automatic_identity_notes: true,
            identity_notes: Vec::new(),
            supporting_characters: BTreeMap::new(),
            static_notes: Vec::new(),
            reference_history_capacity: 0,
            reference_parameter: None,
            promote_latest_reference: false,
            base_seed: None,
            auto_seed: false,
            vary_seed_per_page: true,
            primary_reference: PrimaryReference::default(),
        }
    }
}

impl ContinuitySettings {
    pub fn capacity(&self) -> Result<usize> {
        usize::try_from(self.reference_history_capacity).map_err(|_| {
            StorybookError::Config(format!(
                "reference_history_capacity must be zero or more, got {}",
                self.reference_history_capacity
            ))
        })
    }

    /// The checks `ContinuityConfig::validate` applies, on the settings as
    /// assembly will see them. Capacity 0 turns promotion off.
    pub fn validate(&self) -> Result<()> {
        let capacity = self.capacity()?;
        if let Some(param) = &self.reference_parameter {
            if param.trim().is_empty() {
                return Err(StorybookError::Config(
                    "reference_parameter must not be blank".to_string(),
                ));
            }
        }
        let promotes = capacity > 0 && self.promote_latest_reference;
        if self.primary_reference == PrimaryReference::Latest && !promotes {
            return Err(StorybookError::Config(
                "primary_reference 'latest' requires promote_latest_reference and a \
                 reference_history_capacity above zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_min_pages() -> u32 {
    12
}
fn default_max_pages() -> u32 {
    18
}
fn default_scene_concurrency() -> usize {
    4
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StorybookError::Config(format!(
                "{} not found. Please create one.",
                path.display()
            )));
        }

        let content = fs::read_to_string(path).map_err(|e| {
            StorybookError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(content)
            .map_err(|e| StorybookError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)
            .map_err(|e| StorybookError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.continuity.validate()?;
        check_seed_parameter(&self.image.parameters)?;

        let pagination = &self.pagination;
        if pagination.min_pages == 0 || pagination.min_pages > pagination.max_pages {
            return Err(StorybookError::Config(format!(
                "invalid page range [{}, {}]",
                pagination.min_pages, pagination.max_pages
            )));
        }
        if self.scene_concurrency == 0 {
            return Err(StorybookError::Config(
                "scene_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Fill blank API keys from the environment.
    pub fn apply_env(&mut self) {
        if let Some(gemini) = self.llm.gemini.as_mut() {
            fill_from_env(&mut gemini.api_key, "GEMINI_API_KEY");
        }
        if let Some(openai) = self.llm.openai.as_mut() {
            fill_from_env(&mut openai.api_key, "OPENAI_API_KEY");
        }
        if let Some(replicate) = self.image.replicate.as_mut() {
            fill_from_env(&mut replicate.api_token, "REPLICATE_API_TOKEN");
        }
    }
}

fn fill_from_env(slot: &mut String, var: &str) {
    if slot.trim().is_empty() {
        if let Ok(value) = std::env::var(var) {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
llm:
  provider: openai
  openai:
    api_key: sk-test
    model: gpt-4o-mini
"#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::parse(MINIMAL).unwrap();
        assert!(!config.unattended);
        assert_eq!(config.pagination.min_pages, 12);
        assert_eq!(config.pagination.max_pages, 18);
        assert_eq!(config.pagination.default_page_count(), 15);
        assert_eq!(config.pagination.strategy, SplitStrategy::Sentences);
        assert_eq!(config.scene_concurrency, 4);
        assert_eq!(config.continuity.reference_history_capacity, 0);
        assert!(config.continuity.vary_seed_per_page);
        assert_eq!(config.image.provider, "replicate");
        assert_eq!(config.llm.retry_count, 3);
    }

    #[test]
    fn test_negative_capacity_is_config_error() {
        let yaml = format!(
            "{}continuity:\n  reference_history_capacity: -1\n",
            MINIMAL
        );
        let err = Config::parse(&yaml).unwrap_err();
        assert!(matches!(err, StorybookError::Config(_)));
        assert!(err.to_string().contains("reference_history_capacity"));
    }

    #[test]
    fn test_inverted_page_range_is_config_error() {
        let yaml = format!("{}pagination:\n  min_pages: 10\n  max_pages: 4\n", MINIMAL);
        assert!(matches!(
            Config::parse(&yaml),
            Err(StorybookError::Config(_))
        ));
    }

    #[test]
    fn test_latest_primary_reference_needs_promotion_at_load() {
        let without_promotion = format!(
            "{}continuity:\n  reference_history_capacity: 3\n  primary_reference: latest\n",
            MINIMAL
        );
        let err = Config::parse(&without_promotion).unwrap_err();
        assert!(matches!(err, StorybookError::Config(_)));
        assert!(err.to_string().contains("primary_reference"));

        let zero_capacity = format!(
            "{}continuity:\n  promote_latest_reference: true\n  primary_reference: latest\n",
            MINIMAL
        );
        assert!(matches!(
            Config::parse(&zero_capacity),
            Err(StorybookError::Config(_))
        ));

        // Promotion alone with no history is switched off, not rejected.
        let promote_only = format!("{}continuity:\n  promote_latest_reference: true\n", MINIMAL);
        assert!(Config::parse(&promote_only).is_ok());
    }

    #[test]
    fn test_blank_reference_parameter_and_bad_seed_are_config_errors() {
        let blank = format!(
            "{}continuity:\n  reference_history_capacity: 2\n  reference_parameter: \"  \"\n",
            MINIMAL
        );
        assert!(matches!(Config::parse(&blank), Err(StorybookError::Config(_))));

        let seed = format!("{}image:\n  parameters:\n    seed: -4\n", MINIMAL);
        let err = Config::parse(&seed).unwrap_err();
        assert!(err.to_string().contains("seed"));
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");

        let yaml = format!(
            "{}models:\n  scenes: gpt-4o\ncontinuity:\n  reference_history_capacity: 3\n  promote_latest_reference: true\n  reference_parameter: reference_images\n  base_seed: 42\n  primary_reference: latest\n",
            MINIMAL
        );
        std::fs::write(&path, yaml).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.models.scenes.as_deref(), Some("gpt-4o"));
        assert_eq!(config.continuity.capacity().unwrap(), 3);
        assert_eq!(config.continuity.primary_reference, PrimaryReference::Latest);

        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.continuity, config.continuity);
        assert_eq!(reloaded.models, config.models);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::load(Path::new("/definitely/not/here.yml")).unwrap_err();
        assert!(matches!(err, StorybookError::Config(_)));
    }
}
