use crate::core::error::{Result, StorybookError};
use crate::core::illustration::IllustrationResult;
use crate::core::io::Storage;
use crate::core::profile::Profile;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub page_number: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Illustration-ready brief for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    pub page_number: u32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outfit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facial_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supporting_details: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting: Option<String>,
}

impl SceneDescription {
    pub fn new(page_number: u32, description: impl Into<String>) -> Self {
        Self {
            page_number,
            description: description.into(),
            outfit: None,
            facial_expression: None,
            pose: None,
            supporting_details: Vec::new(),
            mood: None,
            setting: None,
        }
    }
}

/// Everything a renderer needs to lay out the finished book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorybookPackage {
    pub profile: Profile,
    pub story_markdown: String,
    pub pages: Vec<Page>,
    pub scenes: Vec<SceneDescription>,
    pub illustrations: Vec<IllustrationResult>,
}

impl StorybookPackage {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| StorybookError::Package(format!("failed to serialize package: {}", e)))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let package: StorybookPackage = serde_yaml_ng::from_str(content)
            .map_err(|e| StorybookError::Package(format!("failed to parse package: {}", e)))?;
        package.check_alignment()?;
        Ok(package)
    }

    pub async fn save(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        storage.write(path, self.to_yaml()?.as_bytes()).await
    }

    pub async fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let bytes = storage.read(path).await?;
        let content = String::from_utf8(bytes)
            .map_err(|e| StorybookError::Package(format!("{} is not UTF-8: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    /// Pages, scenes and illustrations must line up one-to-one in page order.
    fn check_alignment(&self) -> Result<()> {
        let count = self.pages.len();
        if self.scenes.len() != count || self.illustrations.len() != count {
            return Err(StorybookError::Package(format!(
                "expected {} scenes and illustrations, found {} and {}",
                count,
                self.scenes.len(),
                self.illustrations.len()
            )));
        }
        for (index, page) in self.pages.iter().enumerate() {
            let expected = index as u32 + 1;
            if page.page_number != expected
                || self.scenes[index].page_number != expected
                || self.illustrations[index].page_number != expected
            {
                return Err(StorybookError::Package(format!(
                    "entries out of order at page {}",
                    expected
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;

    fn sample_package() -> StorybookPackage {
        let mut profile = Profile::new("Aiden");
        profile.age = Some(6);
        profile
            .supporting_characters
            .insert("Milo".to_string(), "grey cat".to_string());

        let mut scene = SceneDescription::new(1, "Aiden waves at the rocket");
        scene.mood = Some("excited".to_string());
        scene.supporting_details = vec!["Milo on the launch pad".to_string()];

        StorybookPackage {
            profile,
            story_markdown: "# Title\nAiden's Rocket\n\n## Story\nAiden waved.".to_string(),
            pages: vec![Page {
                page_number: 1,
                text: "Aiden waved.".to_string(),
                title: Some("Lift-off".to_string()),
            }],
            scenes: vec![scene],
            illustrations: vec![IllustrationResult {
                page_number: 1,
                images: vec!["https://img/1.png".to_string()],
                seed: Some(42),
            }],
        }
    }

    #[tokio::test]
    async fn test_package_round_trips_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("book.yml");
        let path = path.to_str().unwrap();
        let storage = NativeStorage::new();

        let package = sample_package();
        package.save(&storage, path).await.unwrap();
        let loaded = StorybookPackage::load(&storage, path).await.unwrap();

        assert_eq!(loaded, package);
    }

    #[test]
    fn test_misaligned_package_is_rejected() {
        let mut package = sample_package();
        package.scenes.clear();
        let yaml = package.to_yaml().unwrap();
        assert!(matches!(
            StorybookPackage::from_yaml(&yaml),
            Err(StorybookError::Package(_))
        ));

        assert!(matches!(
            StorybookPackage::from_yaml("pages: [unterminated"),
            Err(StorybookError::Package(_))
        ));
    }
}
