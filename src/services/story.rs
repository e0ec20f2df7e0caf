use crate::core::error::BackendError;
use crate::core::profile::Profile;
use crate::services::llm::{ChatRequest, LlmClient};
use crate::services::prompts::{story_system_prompt, story_user_prompt, strip_code_blocks};
use crate::services::retry::{with_retry, RetryPolicy};
use log::{debug, info};
use std::sync::Arc;

const STORY_TEMPERATURE: f32 = 0.8;
const STORY_MAX_TOKENS: u32 = 3000;

/// Turns a profile into one long-form Markdown story.
#[derive(Debug, Clone)]
pub struct StoryProducer {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl StoryProducer {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    pub async fn produce(&self, profile: &Profile) -> Result<String, BackendError> {
        let system = story_system_prompt();
        let user = story_user_prompt(profile);
        let request = ChatRequest::new(&system, &user)
            .temperature(STORY_TEMPERATURE)
            .max_tokens(STORY_MAX_TOKENS);

        info!(
            "Writing story for {} with {}/{}",
            profile.name,
            self.llm.provider(),
            self.llm.model()
        );
        let raw = with_retry(&self.retry, "story generation", || self.llm.chat(&request)).await?;

        let story = strip_code_blocks(&raw);
        if story.trim().is_empty() {
            return Err(BackendError::malformed(self.llm.provider(), "story text is empty"));
        }
        debug!("Story has {} words", crate::utils::text::word_count(&story));
        Ok(story)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockLlmClient {
        replies: Mutex<Vec<Result<String, BackendError>>>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, request: &ChatRequest<'_>) -> Result<String, BackendError> {
            self.prompts.lock().unwrap().push(request.user.to_string());
            self.replies.lock().unwrap().remove(0)
        }
        fn provider(&self) -> &str {
            "mock"
        }
        fn model(&self) -> &str {
            "mock-1"
        }
    }

    #[tokio::test]
    async fn test_produce_retries_then_strips_fence() {
        let llm = Arc::new(MockLlmClient {
            replies: Mutex::new(vec![
                Err(BackendError::retryable("mock", "rate limited")),
                Ok("```markdown\n## Title\nAiden's Rocket\n```".to_string()),
            ]),
            prompts: Mutex::new(Vec::new()),
        });
        let producer = StoryProducer::new(llm.clone(), RetryPolicy::new(2, 0));

        let story = producer.produce(&Profile::new("Aiden")).await.unwrap();
        assert_eq!(story, "## Title\nAiden's Rocket");

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("- Name: Aiden"));
    }

    #[tokio::test]
    async fn test_empty_story_is_malformed() {
        let llm = Arc::new(MockLlmClient {
            replies: Mutex::new(vec![Ok("   ".to_string())]),
            prompts: Mutex::new(Vec::new()),
        });
        let producer = StoryProducer::new(llm, RetryPolicy::none());
        let err = producer.produce(&Profile::new("Aiden")).await.unwrap_err();
        assert!(err.message.contains("empty"));
    }
}
