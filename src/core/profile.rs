use crate::core::error::{Result, StorybookError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

fn default_language() -> String {
    "English".to_string()
}

/// The child a storybook is written for. Built once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub hobbies: Vec<String>,
    #[serde(default)]
    pub favorite_theme: Option<String>,
    #[serde(default)]
    pub desired_takeaway: Option<String>,
    #[serde(default)]
    pub personal_notes: Option<String>,
    #[serde(default = "default_language")]
    pub story_language: String,
    #[serde(default)]
    pub guardian_name: Option<String>,
    /// Fixed appearance notes (hair, skin tone, glasses...).
    #[serde(default)]
    pub identity_traits: Vec<String>,
    /// Recurring characters and a short visual description of each.
    #[serde(default)]
    pub supporting_characters: BTreeMap<String, String>,
    #[serde(default)]
    pub continuity_notes: Vec<String>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            age: None,
            gender: None,
            nickname: None,
            hobbies: Vec::new(),
            favorite_theme: None,
            desired_takeaway: None,
            personal_notes: None,
            story_language: default_language(),
            guardian_name: None,
            identity_traits: Vec::new(),
            supporting_characters: BTreeMap::new(),
            continuity_notes: Vec::new(),
        }
    }

    /// Parse a profile from YAML or JSON text, chosen by the file extension.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let value: Value = match extension.as_str() {
            "yaml" | "yml" => serde_yaml_ng::from_str(content)
                .map_err(|e| StorybookError::Profile(format!("invalid YAML: {}", e)))?,
            "json" => serde_json::from_str(content)
                .map_err(|e| StorybookError::Profile(format!("invalid JSON: {}", e)))?,
            other => {
                return Err(StorybookError::Profile(format!(
                    "unsupported profile format '{}', use YAML or JSON",
                    other
                )))
            }
        };

        match value {
            Value::Object(map) => Self::from_mapping(&map),
            _ => Err(StorybookError::Profile(
                "profile must be a mapping of field names to values".to_string(),
            )),
        }
    }

    /// Build a profile from loosely-typed form data, accepting the usual aliases.
    pub fn from_mapping(data: &Map<String, Value>) -> Result<Self> {
        let name = optional_str(data, &["name"]).ok_or_else(|| {
            StorybookError::Profile("a non-empty 'name' field is required".to_string())
        })?;

        let age = match first_present(data, &["age"]) {
            None => None,
            Some(Value::Number(n)) => Some(
                n.as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| StorybookError::Profile(format!("invalid age: {}", n)))?,
            ),
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.trim().parse::<u32>().map_err(|_| {
                StorybookError::Profile(format!("expected an integer age, got '{}'", s))
            })?),
            Some(other) => {
                return Err(StorybookError::Profile(format!(
                    "expected an integer age, got {}",
                    other
                )))
            }
        };

        let supporting_characters = match first_present(data, &["supporting_characters"]) {
            None => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| {
                    let name = k.trim();
                    let details = scalar_to_string(v)?;
                    (!name.is_empty()).then(|| (name.to_string(), details))
                })
                .collect(),
            Some(_) => {
                return Err(StorybookError::Profile(
                    "'supporting_characters' must map names to descriptions".to_string(),
                ))
            }
        };

        Ok(Self {
            name,
            age,
            gender: optional_str(data, &["gender", "sex", "pronouns"]),
            nickname: optional_str(data, &["nickname"]),
            hobbies: string_list(data, &["hobbies"], true)?,
            favorite_theme: optional_str(data, &["preferred_theme", "favorite_theme"]),
            desired_takeaway: optional_str(data, &["desired_takeaway", "lesson"]),
            personal_notes: optional_str(data, &["personal_notes"]),
            story_language: optional_str(data, &["story_language", "language"])
                .unwrap_or_else(default_language),
            guardian_name: optional_str(data, &["guardian_name", "parent_name", "caregiver_name"]),
            identity_traits: string_list(data, &["identity_traits", "appearance"], false)?,
            supporting_characters,
            continuity_notes: string_list(data, &["continuity_notes"], false)?,
        })
    }

    /// Short descriptive lines about the child, used to condition prompts.
    pub fn context_bullets(&self) -> Vec<String> {
        let mut bullets = vec![format!("Name: {}", self.name)];
        if let Some(nickname) = &self.nickname {
            bullets.push(format!("Nickname: {}", nickname));
        }
        if let Some(age) = self.age {
            bullets.push(format!("Age: {}", age));
        }
        if let Some(gender) = &self.gender {
            bullets.push(format!("Gender/pronouns: {}", gender));
        }
        if !self.hobbies.is_empty() {
            bullets.push(format!("Hobbies/interests: {}", self.hobbies.join(", ")));
        }
        if let Some(theme) = &self.favorite_theme {
            bullets.push(format!("Preferred theme: {}", theme));
        }
        if let Some(takeaway) = &self.desired_takeaway {
            bullets.push(format!("Desired takeaway: {}", takeaway));
        }
        if let Some(notes) = &self.personal_notes {
            bullets.push(format!("Special notes: {}", notes));
        }
        if let Some(guardian) = &self.guardian_name {
            bullets.push(format!("Guardian name: {}", guardian));
        }
        bullets.push(format!("Story language: {}", self.story_language));
        bullets
    }

    pub fn summary_for_prompt(&self) -> String {
        self.context_bullets()
            .iter()
            .map(|line| format!("- {}", line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn first_present<'a>(data: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| data.get(*k))
        .find(|v| !v.is_null())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// First non-empty scalar among `keys`.
fn optional_str(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| data.get(*k))
        .find_map(scalar_to_string)
}

fn string_list(
    data: &Map<String, Value>,
    keys: &[&str],
    split_commas: bool,
) -> Result<Vec<String>> {
    let items = match first_present(data, keys) {
        None => Vec::new(),
        Some(Value::String(s)) if split_commas => {
            s.split(',').map(|p| p.trim().to_string()).collect()
        }
        Some(Value::String(s)) => crate::utils::text::note_lines(s),
        Some(Value::Array(values)) => values.iter().filter_map(scalar_to_string).collect(),
        Some(other) => {
            return Err(StorybookError::Profile(format!(
                "'{}' must be a string or a list of strings, got {}",
                keys[0], other
            )))
        }
    };
    Ok(items.into_iter().filter(|item| !item.is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_aliases_and_coercion() {
        let data = mapping(json!({
            "name": "  Aiden ",
            "age": "6",
            "pronouns": "he/him",
            "hobbies": "dinosaurs, drawing , ",
            "preferred_theme": "Space exploration",
            "lesson": "Courage",
            "language": "Spanish",
            "parent_name": "Rosa",
            "supporting_characters": { "Milo": "a small grey cat", "": "ignored" }
        }));

        let profile = Profile::from_mapping(&data).unwrap();
        assert_eq!(profile.name, "Aiden");
        assert_eq!(profile.age, Some(6));
        assert_eq!(profile.gender.as_deref(), Some("he/him"));
        assert_eq!(profile.hobbies, vec!["dinosaurs", "drawing"]);
        assert_eq!(profile.favorite_theme.as_deref(), Some("Space exploration"));
        assert_eq!(profile.desired_takeaway.as_deref(), Some("Courage"));
        assert_eq!(profile.story_language, "Spanish");
        assert_eq!(profile.guardian_name.as_deref(), Some("Rosa"));
        assert_eq!(profile.supporting_characters.len(), 1);
        assert_eq!(profile.supporting_characters["Milo"], "a small grey cat");
    }

    #[test]
    fn test_missing_name_is_profile_error() {
        let data = mapping(json!({ "name": "   ", "age": 5 }));
        let err = Profile::from_mapping(&data).unwrap_err();
        assert!(matches!(err, StorybookError::Profile(_)));
    }

    #[test]
    fn test_invalid_age_is_profile_error() {
        let data = mapping(json!({ "name": "Aiden", "age": "six" }));
        assert!(matches!(
            Profile::from_mapping(&data),
            Err(StorybookError::Profile(_))
        ));
    }

    #[test]
    fn test_parse_yaml_and_reject_unknown_extension() {
        let yaml = "name: Mia\nhobbies:\n  - painting\n  - soccer\nidentity_traits: |\n  - curly red hair\n  - freckles\n";
        let profile = Profile::parse(yaml, Path::new("kid.yaml")).unwrap();
        assert_eq!(profile.hobbies, vec!["painting", "soccer"]);
        assert_eq!(profile.identity_traits, vec!["curly red hair", "freckles"]);
        assert_eq!(profile.story_language, "English");

        let err = Profile::parse(yaml, Path::new("kid.txt")).unwrap_err();
        assert!(matches!(err, StorybookError::Profile(_)));
    }

    #[test]
    fn test_summary_lists_known_fields() {
        let mut profile = Profile::new("Aiden");
        profile.age = Some(6);
        profile.hobbies = vec!["rockets".to_string()];
        let summary = profile.summary_for_prompt();
        assert!(summary.starts_with("- Name: Aiden"));
        assert!(summary.contains("- Age: 6"));
        assert!(summary.contains("- Hobbies/interests: rockets"));
        assert!(summary.ends_with("- Story language: English"));
    }
}
