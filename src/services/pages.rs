use crate::core::config::{PaginationConfig, SplitStrategy};
use crate::core::error::{BackendError, Result, Stage, StorybookError};
use crate::core::package::Page;
use crate::core::profile::Profile;
use crate::services::llm::{ChatRequest, LlmClient};
use crate::services::prompts::{page_split_system_prompt, page_split_user_prompt, strip_code_blocks};
use crate::services::retry::{with_retry, RetryPolicy};
use crate::utils::text::{normalize_whitespace, split_sentences, word_count};
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use std::sync::Arc;

#[async_trait]
pub trait PageSplitter: Send + Sync {
    async fn split(&self, story: &str, profile: &Profile, desired_pages: u32) -> Result<Vec<Page>>;
}

pub fn create_page_splitter(
    pagination: &PaginationConfig,
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
) -> Box<dyn PageSplitter> {
    match pagination.strategy {
        SplitStrategy::Sentences => Box::new(SentencePageSplitter::new(pagination)),
        SplitStrategy::Llm => Box::new(LlmPageSplitter::new(pagination, llm, retry)),
    }
}

/// The part of a Markdown story that gets paginated: the body of a `Story`
/// heading when there is one, otherwise every non-heading line.
pub fn extract_narrative(markdown: &str) -> String {
    let mut in_story = false;
    let mut found_story = false;
    let mut story_lines = Vec::new();
    let mut body_lines = Vec::new();

    for line in markdown.lines() {
        let trimmed = line.trim();
        if let Some(heading) = heading_text(trimmed) {
            in_story = heading.eq_ignore_ascii_case("story");
            found_story |= in_story;
            continue;
        }
        if in_story {
            story_lines.push(trimmed);
        }
        body_lines.push(trimmed);
    }

    let lines = if found_story { story_lines } else { body_lines };
    normalize_whitespace(&lines.join("\n"))
}

fn heading_text(line: &str) -> Option<String> {
    let text = if line.starts_with('#') {
        line.trim_start_matches('#')
    } else if line.len() > 4 && line.starts_with("**") && line.ends_with("**") {
        &line[2..line.len() - 2]
    } else {
        return None;
    };
    Some(text.trim().trim_end_matches(':').trim().to_string())
}

fn check_desired(bounds: &PaginationConfig, desired: u32) -> Result<()> {
    if desired < bounds.min_pages || desired > bounds.max_pages {
        return Err(StorybookError::Pagination(format!(
            "desired page count {} is outside [{}, {}]",
            desired, bounds.min_pages, bounds.max_pages
        )));
    }
    Ok(())
}

/// Count, numbering, non-empty text and exact coverage of `narrative`.
pub fn validate_pages(pages: &[Page], bounds: &PaginationConfig, narrative: &str) -> Result<()> {
    let count = pages.len() as u32;
    if count < bounds.min_pages || count > bounds.max_pages {
        return Err(StorybookError::Pagination(format!(
            "expected between {} and {} pages, got {}",
            bounds.min_pages, bounds.max_pages, count
        )));
    }
    for (index, page) in pages.iter().enumerate() {
        let expected = index as u32 + 1;
        if page.page_number != expected {
            return Err(StorybookError::Pagination(format!(
                "page numbers must be sequential from 1, found {} at position {}",
                page.page_number, expected
            )));
        }
        if page.text.trim().is_empty() {
            return Err(StorybookError::Pagination(format!("page {} has no text", expected)));
        }
    }

    let joined = pages
        .iter()
        .map(|page| page.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    if normalize_whitespace(&joined) != normalize_whitespace(narrative) {
        return Err(StorybookError::Pagination(
            "pages do not reproduce the story text exactly".to_string(),
        ));
    }
    Ok(())
}

// --- Sentence grouping ---

/// Deterministic splitter that groups whole sentences into pages of similar length.
#[derive(Debug, Clone)]
pub struct SentencePageSplitter {
    bounds: PaginationConfig,
}

impl SentencePageSplitter {
    pub fn new(bounds: &PaginationConfig) -> Self {
        Self {
            bounds: bounds.clone(),
        }
    }

    fn group(sentences: &[String], count: usize) -> Vec<Vec<String>> {
        let words: Vec<usize> = sentences.iter().map(|s| word_count(s).max(1)).collect();
        let total: usize = words.iter().sum();

        let mut groups = Vec::with_capacity(count);
        let mut idx = 0;
        let mut cumulative = 0usize;

        for page in 0..count {
            let pages_left = count - page;
            let mut group = Vec::new();

            if pages_left == 1 {
                group.extend(sentences[idx..].iter().cloned());
                groups.push(group);
                break;
            }

            let target = total as f64 * (page + 1) as f64 / count as f64;
            loop {
                group.push(sentences[idx].clone());
                cumulative += words[idx];
                idx += 1;

                // Leave at least one sentence for every remaining page.
                if sentences.len() - idx == pages_left - 1 {
                    break;
                }
                let current = cumulative as f64;
                if current >= target {
                    break;
                }
                let next = (cumulative + words[idx]) as f64;
                if next - target > target - current {
                    break;
                }
            }
            groups.push(group);
        }
        groups
    }
}

#[async_trait]
impl PageSplitter for SentencePageSplitter {
    async fn split(
        &self,
        story: &str,
        _profile: &Profile,
        desired_pages: u32,
    ) -> Result<Vec<Page>> {
        check_desired(&self.bounds, desired_pages)?;

        let narrative = extract_narrative(story);
        let sentences = split_sentences(&narrative);
        if sentences.len() < self.bounds.min_pages as usize {
            return Err(StorybookError::Pagination(format!(
                "story has {} sentences, at least {} are needed for {} pages",
                sentences.len(),
                self.bounds.min_pages,
                self.bounds.min_pages
            )));
        }

        let count = (desired_pages as usize).min(sentences.len());
        if count < desired_pages as usize {
            info!(
                "Story only has {} sentences, making {} pages instead of {}",
                sentences.len(),
                count,
                desired_pages
            );
        }

        let pages: Vec<Page> = Self::group(&sentences, count)
            .into_iter()
            .enumerate()
            .map(|(i, group)| Page {
                page_number: i as u32 + 1,
                text: group.join(" "),
                title: None,
            })
            .collect();

        validate_pages(&pages, &self.bounds, &narrative)?;
        debug!("Split {} sentences into {} pages", sentences.len(), pages.len());
        Ok(pages)
    }
}

// --- LLM page plan ---

#[derive(Deserialize)]
struct PagePlan {
    pages: Vec<PlannedPage>,
}

#[derive(Deserialize)]
struct PlannedPage {
    page_number: u32,
    #[serde(default)]
    title: Option<String>,
    story_text: String,
}

fn parse_page_plan(provider: &str, raw: &str) -> std::result::Result<Vec<Page>, BackendError> {
    let plan: PagePlan = serde_json::from_str(&strip_code_blocks(raw))
        .map_err(|e| BackendError::malformed(provider, format!("page plan: {}", e)))?;
    Ok(plan
        .pages
        .into_iter()
        .map(|p| Page {
            page_number: p.page_number,
            text: p.story_text.trim().to_string(),
            title: p
                .title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        })
        .collect())
}

/// Asks the text backend for a titled page plan and checks it against the story.
#[derive(Debug, Clone)]
pub struct LlmPageSplitter {
    bounds: PaginationConfig,
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl LlmPageSplitter {
    pub fn new(bounds: &PaginationConfig, llm: Arc<dyn LlmClient>, retry: RetryPolicy) -> Self {
        Self {
            bounds: bounds.clone(),
            llm,
            retry,
        }
    }
}

#[async_trait]
impl PageSplitter for LlmPageSplitter {
    async fn split(&self, story: &str, profile: &Profile, desired_pages: u32) -> Result<Vec<Page>> {
        check_desired(&self.bounds, desired_pages)?;

        let narrative = extract_narrative(story);
        if narrative.is_empty() {
            return Err(StorybookError::Pagination("story has no narrative text".to_string()));
        }

        let system = page_split_system_prompt(self.bounds.min_pages, self.bounds.max_pages);
        let user = page_split_user_prompt(profile, &narrative, desired_pages);
        let request = ChatRequest::new(&system, &user)
            .temperature(0.3)
            .max_tokens(4000);

        let raw = with_retry(&self.retry, "page split", || self.llm.chat(&request))
            .await
            .map_err(|e| StorybookError::backend(Stage::Pagination, e))?;
        let pages = parse_page_plan(self.llm.provider(), &raw)
            .map_err(|e| StorybookError::backend(Stage::Pagination, e))?;

        validate_pages(&pages, &self.bounds, &narrative)?;
        Ok(pages)
    }
}
