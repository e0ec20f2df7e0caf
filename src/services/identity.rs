use crate::core::config::ContinuitySettings;
use crate::core::continuity::{derive_profile_seed, ContinuityConfig};
use crate::core::error::{BackendError, Result};
use crate::core::profile::Profile;
use crate::services::llm::{ChatRequest, LlmClient};
use crate::services::prompts::{strip_code_blocks, IDENTITY_SYSTEM_PROMPT, IDENTITY_USER_PROMPT};
use crate::utils::text::{dedupe_case_insensitive, note_lines};
use log::{info, warn};

/// Words that describe what the child wears or carries rather than who they are.
const NON_PHYSICAL_WORDS: &[&str] = &[
    "jacket", "hoodie", "sweater", "coat", "shirt", "t-shirt", "tee", "top", "blouse", "pants",
    "jeans", "shorts", "skirt", "dress", "outfit", "clothing", "attire", "costume", "cape",
    "uniform", "boots", "shoes", "sneakers", "sandals", "socks", "hat", "beanie", "cap", "helmet",
    "gloves", "scarf", "mask", "backpack", "bag", "vest", "overalls", "glasses", "goggles",
    "bracelet", "necklace", "earrings", "watch", "rings", "belt",
];

fn mentions_non_physical(line: &str) -> bool {
    line.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .any(|word| NON_PHYSICAL_WORDS.contains(&word))
}

/// Keep only lines about inherent physical traits.
pub fn filter_physical_notes(notes: &str) -> Vec<String> {
    note_lines(notes)
        .into_iter()
        .filter(|line| !mentions_non_physical(line))
        .collect()
}

/// Ask a vision-capable model for the child's stable facial traits.
pub async fn extract_identity_notes(
    llm: &dyn LlmClient,
    image: &str,
) -> std::result::Result<Vec<String>, BackendError> {
    let request = ChatRequest::new(IDENTITY_SYSTEM_PROMPT, IDENTITY_USER_PROMPT)
        .temperature(0.2)
        .max_tokens(450)
        .image(image);
    let raw = llm.chat(&request).await?;
    Ok(filter_physical_notes(&strip_code_blocks(&raw)))
}

/// Combine configured overrides, the profile and (optionally) notes read from
/// the reference photo into the continuity config for one run.
pub async fn assemble_continuity(
    settings: &ContinuitySettings,
    profile: &Profile,
    reference_image: &str,
    identity_llm: Option<&dyn LlmClient>,
) -> Result<ContinuityConfig> {
    let capacity = settings.capacity()?;

    let mut extracted = Vec::new();
    if settings.automatic_identity_notes {
        if let Some(llm) = identity_llm {
            match extract_identity_notes(llm, reference_image).await {
                Ok(notes) => {
                    info!("Extracted {} identity notes from the reference photo", notes.len());
                    extracted = notes;
                }
                Err(e) => warn!("Identity extraction failed; continuing without it: {}", e),
            }
        }
    }

    let identity_lines = dedupe_case_insensitive(
        settings
            .identity_notes
            .iter()
            .flat_map(|note| note_lines(note))
            .chain(profile.identity_traits.iter().flat_map(|t| note_lines(t)))
            .chain(extracted),
    );
    let identity_notes = (!identity_lines.is_empty()).then(|| {
        identity_lines
            .iter()
            .map(|line| format!("- {}", line))
            .collect::<Vec<_>>()
            .join("\n")
    });

    let mut supporting = profile.supporting_characters.clone();
    for (name, details) in &settings.supporting_characters {
        let (name, details) = (name.trim(), details.trim());
        if !name.is_empty() && !details.is_empty() {
            supporting.insert(name.to_string(), details.to_string());
        }
    }

    let static_notes = dedupe_case_insensitive(
        profile
            .continuity_notes
            .iter()
            .flat_map(|note| note_lines(note))
            .chain(settings.static_notes.iter().flat_map(|note| note_lines(note))),
    );

    let carry_history = capacity > 0;
    let base_seed = match settings.base_seed {
        Some(seed) => Some(seed),
        None if settings.auto_seed => Some(derive_profile_seed(profile, reference_image)),
        None => None,
    };

    let config = ContinuityConfig {
        identity_notes,
        supporting_character_notes: supporting,
        static_notes,
        reference_history_capacity: capacity,
        promote_latest_reference: carry_history && settings.promote_latest_reference,
        reference_parameter: if carry_history {
            settings.reference_parameter.clone()
        } else {
            None
        },
        base_seed,
        vary_seed_per_page: settings.vary_seed_per_page,
        primary_reference: settings.primary_reference,
    };
    config.validate()?;
    Ok(config)
}
