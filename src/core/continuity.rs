//! Continuity state threaded through the illustration calls of one run.
//!
//! The tracker is created fresh for every run and owned by it. Notes are fixed
//! at construction; only the reference history and the per-page seed move.

use crate::core::error::{Result, StorybookError};
use crate::core::illustration::IllustrationResult;
use crate::core::profile::Profile;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};

/// Seeds are kept inside the positive 31-bit range most image backends accept.
pub const SEED_MODULUS: u64 = 2_147_483_647;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryReference {
    /// Always condition on the reference photo supplied for the run.
    #[default]
    Original,
    /// Condition on the newest recorded illustration once one exists.
    Latest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityConfig {
    #[serde(default)]
    pub identity_notes: Option<String>,
    #[serde(default)]
    pub supporting_character_notes: BTreeMap<String, String>,
    #[serde(default)]
    pub static_notes: Vec<String>,
    #[serde(default)]
    pub reference_history_capacity: usize,
    #[serde(default)]
    pub promote_latest_reference: bool,
    #[serde(default)]
    pub reference_parameter: Option<String>,
    #[serde(default)]
    pub base_seed: Option<u64>,
    #[serde(default = "default_true")]
    pub vary_seed_per_page: bool,
    #[serde(default)]
    pub primary_reference: PrimaryReference,
}

fn default_true() -> bool {
    true
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            identity_notes: None,
            supporting_character_notes: BTreeMap::new(),
            static_notes: Vec::new(),
            reference_history_capacity: 0,
            promote_latest_reference: false,
            reference_parameter: None,
            base_seed: None,
            vary_seed_per_page: true,
            primary_reference: PrimaryReference::Original,
        }
    }
}

impl ContinuityConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(param) = &self.reference_parameter {
            if param.trim().is_empty() {
                return Err(StorybookError::Config(
                    "reference_parameter must not be blank".to_string(),
                ));
            }
        }
        if self.promote_latest_reference && self.reference_history_capacity == 0 {
            return Err(StorybookError::Config(
                "promote_latest_reference needs a reference_history_capacity above zero"
                    .to_string(),
            ));
        }
        if self.primary_reference == PrimaryReference::Latest && !self.promote_latest_reference {
            return Err(StorybookError::Config(
                "primary_reference 'latest' requires promote_latest_reference".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything continuity contributes to one illustration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityDirectives {
    pub page_number: u32,
    pub identity_notes: Option<String>,
    /// Every configured supporting character as "name: description".
    pub supporting_character_notes: Vec<String>,
    pub static_notes: Vec<String>,
    /// Snapshot of the history, oldest first.
    pub reference_history: Vec<String>,
    pub primary_reference: String,
    /// References forwarded under `reference_parameter`.
    pub auxiliary_references: Vec<String>,
    pub reference_parameter: Option<String>,
    pub seed: Option<u64>,
}

#[derive(Debug)]
pub struct ContinuityTracker {
    config: ContinuityConfig,
    reference_image: String,
    reference_history: VecDeque<String>,
    last_recorded_page: u32,
}

impl ContinuityTracker {
    pub fn new(config: ContinuityConfig, reference_image: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let reference_image = reference_image.into();
        if reference_image.trim().is_empty() {
            return Err(StorybookError::Config(
                "a reference image is required".to_string(),
            ));
        }
        Ok(Self {
            reference_history: VecDeque::with_capacity(config.reference_history_capacity),
            config,
            reference_image,
            last_recorded_page: 0,
        })
    }

    pub fn config(&self) -> &ContinuityConfig {
        &self.config
    }

    pub fn reference_history(&self) -> Vec<String> {
        self.reference_history.iter().cloned().collect()
    }

    pub fn seed_for_page(&self, page_number: u32) -> Option<u64> {
        self.config
            .base_seed
            .map(|base| page_seed(base, page_number, self.config.vary_seed_per_page))
    }

    pub fn directives_for(&self, page_number: u32) -> ContinuityDirectives {
        let history = self.reference_history();

        let mut primary_reference = self.reference_image.clone();
        let mut auxiliary = history.clone();
        if self.config.primary_reference == PrimaryReference::Latest {
            if let Some(latest) = auxiliary.pop() {
                primary_reference = latest;
                if !auxiliary.contains(&self.reference_image) {
                    auxiliary.push(self.reference_image.clone());
                }
            }
        }

        let forward_history =
            self.config.reference_history_capacity > 0 && self.config.reference_parameter.is_some();
        if !forward_history {
            auxiliary.clear();
        }

        let supporting_character_notes = self
            .config
            .supporting_character_notes
            .iter()
            .map(|(name, details)| (name.trim(), details.trim()))
            .filter(|(name, details)| !name.is_empty() && !details.is_empty())
            .map(|(name, details)| format!("{}: {}", name, details))
            .collect();

        ContinuityDirectives {
            page_number,
            identity_notes: self
                .config
                .identity_notes
                .as_deref()
                .map(str::trim)
                .filter(|notes| !notes.is_empty())
                .map(str::to_string),
            supporting_character_notes,
            static_notes: self
                .config
                .static_notes
                .iter()
                .map(|note| note.trim().to_string())
                .filter(|note| !note.is_empty())
                .collect(),
            reference_history: history,
            primary_reference,
            auxiliary_references: auxiliary,
            reference_parameter: if forward_history {
                self.config.reference_parameter.clone()
            } else {
                None
            },
            seed: self.seed_for_page(page_number),
        }
    }

    /// Commit the outcome of `page_number`. Pages must be recorded exactly once,
    /// in ascending order starting at 1.
    pub fn record_result(&mut self, page_number: u32, result: &IllustrationResult) -> Result<()> {
        let expected = self.last_recorded_page + 1;
        if page_number != expected {
            return Err(StorybookError::Sequence(format!(
                "expected result for page {}, got page {}",
                expected, page_number
            )));
        }
        if result.page_number != page_number {
            return Err(StorybookError::Sequence(format!(
                "result belongs to page {} but was recorded as page {}",
                result.page_number, page_number
            )));
        }
        self.last_recorded_page = page_number;

        if !self.config.promote_latest_reference {
            return Ok(());
        }

        if let Some(primary) = result.primary_image() {
            self.reference_history.push_back(primary.to_string());
            while self.reference_history.len() > self.config.reference_history_capacity {
                self.reference_history.pop_front();
            }
        }
        Ok(())
    }
}

/// Seed for `page_number` derived from `base_seed`. Pure, so reruns reproduce it.
pub fn page_seed(base_seed: u64, page_number: u32, vary_per_page: bool) -> u64 {
    let base = normalize_seed(base_seed);
    if !vary_per_page {
        return base;
    }
    let offset = u64::from(page_number.saturating_sub(1));
    normalize_seed((base + offset) % SEED_MODULUS)
}

fn normalize_seed(seed: u64) -> u64 {
    match seed % SEED_MODULUS {
        0 => 1,
        s => s,
    }
}

/// Stable seed from the child's profile and reference image.
pub fn derive_profile_seed(profile: &Profile, reference_image: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(profile.name.trim().to_lowercase().as_bytes());

    let optional = [
        &profile.nickname,
        &profile.gender,
        &profile.favorite_theme,
        &profile.desired_takeaway,
        &profile.personal_notes,
    ];
    for value in optional.into_iter().flatten() {
        hasher.update(value.trim().to_lowercase().as_bytes());
    }
    if let Some(age) = profile.age {
        hasher.update(age.to_string().as_bytes());
    }
    if !profile.hobbies.is_empty() {
        let mut hobbies: Vec<String> = profile
            .hobbies
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();
        hobbies.sort();
        hasher.update(hobbies.join(",").as_bytes());
    }
    hasher.update(reference_image.trim().as_bytes());

    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    normalize_seed(u64::from_be_bytes(head))
}
