use crate::core::error::{BackendError, Result, Stage, StorybookError};
use crate::core::package::{Page, SceneDescription};
use crate::core::profile::Profile;
use crate::services::llm::{ChatRequest, LlmClient};
use crate::services::prompts::{scene_system_prompt, scene_user_prompt, strip_code_blocks};
use crate::services::retry::{with_retry, RetryPolicy};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use log::info;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Condenses one page into an illustration brief. Implementations must not
/// depend on other pages so derivations can run in any order.
#[async_trait]
pub trait SceneDeriver: Send + Sync {
    async fn derive(
        &self,
        page: &Page,
        profile: &Profile,
    ) -> std::result::Result<SceneDescription, BackendError>;
}

#[derive(Deserialize)]
struct SceneBrief {
    scene_description: String,
    #[serde(default)]
    outfit_description: Option<String>,
    #[serde(default)]
    facial_expression: Option<String>,
    #[serde(default)]
    pose_description: Option<String>,
    #[serde(default)]
    supporting_details: Value,
    #[serde(default)]
    mood: Option<String>,
    #[serde(default)]
    setting: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn detail_list(value: Value) -> Vec<String> {
    match value {
        Value::String(s) => crate::utils::text::note_lines(&s),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn parse_scene_brief(
    provider: &str,
    page_number: u32,
    raw: &str,
) -> std::result::Result<SceneDescription, BackendError> {
    let brief: SceneBrief = serde_json::from_str(&strip_code_blocks(raw))
        .map_err(|e| BackendError::malformed(provider, format!("scene brief: {}", e)))?;

    let description = brief.scene_description.trim().to_string();
    if description.is_empty() {
        return Err(BackendError::malformed(provider, "scene_description is empty"));
    }

    Ok(SceneDescription {
        page_number,
        description,
        outfit: non_empty(brief.outfit_description),
        facial_expression: non_empty(brief.facial_expression),
        pose: non_empty(brief.pose_description),
        supporting_details: detail_list(brief.supporting_details),
        mood: non_empty(brief.mood),
        setting: non_empty(brief.setting),
    })
}

#[derive(Debug, Clone)]
pub struct LlmSceneDeriver {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl LlmSceneDeriver {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }
}

#[async_trait]
impl SceneDeriver for LlmSceneDeriver {
    async fn derive(
        &self,
        page: &Page,
        profile: &Profile,
    ) -> std::result::Result<SceneDescription, BackendError> {
        let user = scene_user_prompt(page, profile);
        let request = ChatRequest::new(scene_system_prompt(), &user)
            .temperature(0.4)
            .max_tokens(600);

        let label = format!("scene for page {}", page.page_number);
        let raw = with_retry(&self.retry, &label, || self.llm.chat(&request)).await?;
        parse_scene_brief(self.llm.provider(), page.page_number, &raw)
    }
}

/// Derive scenes for every page with at most `concurrency` calls in flight.
/// Results come back in page order; the first failure (in page order) stops
/// the stage and no further pages are started.
pub async fn derive_all(
    deriver: &dyn SceneDeriver,
    pages: &[Page],
    profile: &Profile,
    concurrency: usize,
) -> Result<Vec<SceneDescription>> {
    info!("Deriving scenes for {} pages", pages.len());
    futures_util::stream::iter(pages.iter())
        .map(|page| async move {
            deriver
                .derive(page, profile)
                .await
                .map_err(|e| StorybookError::backend_on_page(Stage::Scene, page.page_number, e))
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_parse_scene_brief_full() {
        let raw = r#"```json
{
  "scene_description": "Aiden waves from the rocket hatch",
  "outfit_description": "silver space suit",
  "facial_expression": "wide grin",
  "pose_description": "",
  "supporting_details": ["Milo in a tiny helmet", null],
  "mood": "excited",
  "setting": "launch pad at dawn"
}
```"#;
        let scene = parse_scene_brief("mock", 3, raw).unwrap();
        assert_eq!(scene.page_number, 3);
        assert_eq!(scene.description, "Aiden waves from the rocket hatch");
        assert_eq!(scene.outfit.as_deref(), Some("silver space suit"));
        assert_eq!(scene.pose, None);
        assert_eq!(scene.supporting_details, vec!["Milo in a tiny helmet"]);
        assert_eq!(scene.setting.as_deref(), Some("launch pad at dawn"));
    }

    #[test]
    fn test_missing_scene_description_is_malformed() {
        let err = parse_scene_brief("mock", 1, r#"{"mood": "calm"}"#).unwrap_err();
        assert!(err.message.starts_with("malformed response"));
        let err = parse_scene_brief("mock", 1, r#"{"scene_description": "  "}"#).unwrap_err();
        assert!(err.message.contains("empty"));
    }

    #[derive(Debug)]
    struct SlowLlm {
        in_flight: Mutex<usize>,
        peak: Mutex<usize>,
    }

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn chat(
            &self,
            request: &ChatRequest<'_>,
        ) -> std::result::Result<String, BackendError> {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                *in_flight += 1;
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(*in_flight);
            }
            // Later pages finish first to exercise ordering.
            let page: u64 = request
                .user
                .split("Page ")
                .nth(1)
                .and_then(|rest| rest.split(|c: char| !c.is_ascii_digit()).next())
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(40 - page * 5)).await;
            *self.in_flight.lock().unwrap() -= 1;

            if page == 6 {
                return Err(BackendError::new("mock", "content filtered"));
            }
            Ok(format!(r#"{{"scene_description": "scene {}"}}"#, page))
        }
        fn provider(&self) -> &str {
            "mock"
        }
        fn model(&self) -> &str {
            "mock-1"
        }
    }

    fn pages(count: u32) -> Vec<Page> {
        (1..=count)
            .map(|n| Page {
                page_number: n,
                text: format!("Text of page {}.", n),
                title: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_derive_all_keeps_order_and_bounds_concurrency() {
        let llm = Arc::new(SlowLlm {
            in_flight: Mutex::new(0),
            peak: Mutex::new(0),
        });
        let deriver = LlmSceneDeriver::new(llm.clone(), RetryPolicy::none());

        let scenes = derive_all(&deriver, &pages(5), &Profile::new("Aiden"), 2)
            .await
            .unwrap();
        let descriptions: Vec<_> = scenes.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(descriptions, vec!["scene 1", "scene 2", "scene 3", "scene 4", "scene 5"]);
        assert!(*llm.peak.lock().unwrap() <= 2);
    }

    #[tokio::test]
    async fn test_derive_all_reports_failing_page() {
        let llm = Arc::new(SlowLlm {
            in_flight: Mutex::new(0),
            peak: Mutex::new(0),
        });
        let deriver = LlmSceneDeriver::new(llm, RetryPolicy::none());

        let err = derive_all(&deriver, &pages(7), &Profile::new("Aiden"), 3)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Scene));
        assert_eq!(err.page(), Some(6));
    }

    #[derive(Debug, Default)]
    struct FailingDeriver {
        calls: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl SceneDeriver for FailingDeriver {
        async fn derive(
            &self,
            page: &Page,
            _profile: &Profile,
        ) -> std::result::Result<SceneDescription, BackendError> {
            self.calls.lock().unwrap().push(page.page_number);
            if page.page_number == 1 {
                return Err(BackendError::new("mock", "authentication failed (401)"));
            }
            Ok(SceneDescription::new(page.page_number, "unused"))
        }
    }

    #[tokio::test]
    async fn test_derive_all_stops_after_first_failure() {
        let deriver = FailingDeriver::default();

        let err = derive_all(&deriver, &pages(14), &Profile::new("Aiden"), 1)
            .await
            .unwrap_err();
        assert_eq!(err.page(), Some(1));
        assert_eq!(*deriver.calls.lock().unwrap(), vec![1]);
    }
}
