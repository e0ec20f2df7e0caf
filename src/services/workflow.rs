use crate::core::config::Config;
use crate::core::continuity::{ContinuityDirectives, ContinuityTracker};
use crate::core::error::{BackendError, Result, Stage, StorybookError};
use crate::core::illustration::{
    check_seed_parameter, seed_from_value, CallOverrides, IllustrationRequest, IllustrationResult,
    RunOverrides, CAMERA_SHOT_KEY, SEED_KEY,
};
use crate::core::io::Storage;
use crate::core::package::{SceneDescription, StorybookPackage};
use crate::core::profile::Profile;
use crate::services::identity::assemble_continuity;
use crate::services::image::{create_image_client, resolve_image_reference, ImageClient};
use crate::services::llm::{create_llm, LlmClient};
use crate::services::pages::{create_page_splitter, PageSplitter};
use crate::services::prompts::{illustration_prompt, NEGATIVE_PROMPT};
use crate::services::retry::{with_retry, RetryPolicy};
use crate::services::scenes::{derive_all, LlmSceneDeriver, SceneDeriver};
use crate::services::story::StoryProducer;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;

/// Runs story → pages → scenes → illustrations for one profile at a time.
/// Holds only read-only configuration and clients; continuity state lives in
/// each `run` call.
pub struct StorybookPipeline {
    config: Config,
    story: StoryProducer,
    splitter: Box<dyn PageSplitter>,
    scenes: Box<dyn SceneDeriver>,
    identity_llm: Option<Arc<dyn LlmClient>>,
    image: Box<dyn ImageClient>,
    storage: Arc<dyn Storage>,
}

impl StorybookPipeline {
    /// Build every backend from configuration, honouring per-stage model ids.
    pub fn from_config(config: Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let models = &config.models;
        let story_llm: Arc<dyn LlmClient> =
            Arc::from(create_llm(&config.llm, models.story.as_deref())?);
        let pages_llm: Arc<dyn LlmClient> =
            Arc::from(create_llm(&config.llm, models.pages.as_deref())?);
        let scenes_llm: Arc<dyn LlmClient> =
            Arc::from(create_llm(&config.llm, models.scenes.as_deref())?);
        let identity_llm: Arc<dyn LlmClient> =
            Arc::from(create_llm(&config.llm, models.identity.as_deref())?);
        let image = create_image_client(&config.image, None)?;

        let retry = text_retry(&config);
        Ok(Self {
            story: StoryProducer::new(story_llm, retry),
            splitter: create_page_splitter(&config.pagination, pages_llm, retry),
            scenes: Box::new(LlmSceneDeriver::new(scenes_llm, retry)),
            identity_llm: Some(identity_llm),
            image,
            storage,
            config,
        })
    }

    /// One text client for every stage.
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        image: Box<dyn ImageClient>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let retry = text_retry(&config);
        Self {
            story: StoryProducer::new(llm.clone(), retry),
            splitter: create_page_splitter(&config.pagination, llm.clone(), retry),
            scenes: Box::new(LlmSceneDeriver::new(llm.clone(), retry)),
            identity_llm: Some(llm),
            image,
            storage,
            config,
        }
    }

    pub fn with_page_splitter(mut self, splitter: Box<dyn PageSplitter>) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn with_scene_deriver(mut self, scenes: Box<dyn SceneDeriver>) -> Self {
        self.scenes = scenes;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(
        &self,
        profile: &Profile,
        desired_pages: Option<u32>,
        reference_image: &str,
        overrides: &RunOverrides,
    ) -> Result<StorybookPackage> {
        check_seed_parameter(&overrides.global.parameters)?;
        for call in overrides.per_page.values() {
            check_seed_parameter(&call.parameters)?;
        }

        let reference = resolve_image_reference(self.storage.as_ref(), reference_image).await?;
        let continuity = assemble_continuity(
            &self.config.continuity,
            profile,
            &reference,
            self.identity_llm.as_deref(),
        )
        .await?;
        let mut tracker = ContinuityTracker::new(continuity, reference)?;

        info!("[1/4] Writing story for {}", profile.name);
        let story = self
            .story
            .produce(profile)
            .await
            .map_err(|e| StorybookError::backend(Stage::Story, e))?;

        let desired = desired_pages.unwrap_or_else(|| self.config.pagination.default_page_count());
        info!("[2/4] Splitting story into {} pages", desired);
        let pages = self.splitter.split(&story, profile, desired).await?;

        info!("[3/4] Deriving scenes for {} pages", pages.len());
        let scenes = derive_all(
            self.scenes.as_ref(),
            &pages,
            profile,
            self.config.scene_concurrency,
        )
        .await?;

        info!("[4/4] Illustrating {} pages with {}", pages.len(), self.image.model());
        let pb = ProgressBar::new(pages.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );

        let image_retry = RetryPolicy::new(
            self.config.image.retry_count,
            self.config.image.retry_delay_seconds,
        );
        let mut illustrations = Vec::with_capacity(pages.len());
        for scene in &scenes {
            let page_number = scene.page_number;
            pb.set_message(format!("page {}", page_number));

            let directives = tracker.directives_for(page_number);
            let call = overrides.for_page(page_number);
            let request = self.build_request(profile, scene, directives, &call)?;
            debug!(
                "Page {}: seed {:?}, {} auxiliary references",
                page_number,
                request.seed,
                request.auxiliary_references.len()
            );

            let label = format!("illustration for page {}", page_number);
            let outcome = with_retry(&image_retry, &label, || self.image.generate(&request)).await;
            let images = match outcome {
                Ok(images) if images.is_empty() => {
                    pb.abandon();
                    return Err(StorybookError::Generation {
                        page: page_number,
                        source: BackendError::new(self.image.provider(), "no images returned"),
                    });
                }
                Ok(images) => images,
                Err(source) => {
                    pb.abandon();
                    return Err(StorybookError::Generation {
                        page: page_number,
                        source,
                    });
                }
            };

            let result = IllustrationResult {
                page_number,
                images,
                seed: request.seed,
            };
            tracker.record_result(page_number, &result)?;
            illustrations.push(result);
            pb.inc(1);
        }
        pb.finish_with_message("Illustrations complete");

        Ok(StorybookPackage {
            profile: profile.clone(),
            story_markdown: story,
            pages,
            scenes,
            illustrations,
        })
    }

    /// Merge scene, continuity and overrides into the request for one page.
    fn build_request(
        &self,
        profile: &Profile,
        scene: &SceneDescription,
        directives: ContinuityDirectives,
        call: &CallOverrides,
    ) -> Result<IllustrationRequest> {
        let mut parameters = self.config.image.parameters.clone();
        parameters.extend(call.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));

        // An explicit seed beats a seed parameter, which beats the tracker seed.
        let parameter_seed = match parameters.remove(SEED_KEY) {
            Some(value) => Some(seed_from_value(&value)?),
            None => None,
        };
        let seed = call.seed.or(parameter_seed).or(directives.seed);

        let camera_shot = parameters.remove(CAMERA_SHOT_KEY).and_then(text_value);
        let negative_prompt = parameters
            .remove("negative_prompt")
            .and_then(text_value)
            .unwrap_or_else(|| NEGATIVE_PROMPT.to_string());
        let prompt = illustration_prompt(profile, scene, &directives, camera_shot.as_deref());

        Ok(IllustrationRequest {
            page_number: scene.page_number,
            model: self.image.model().to_string(),
            prompt,
            negative_prompt,
            primary_reference: directives.primary_reference.clone(),
            auxiliary_references: directives.auxiliary_references.clone(),
            reference_parameter: directives.reference_parameter.clone(),
            seed,
            parameters,
            directives,
        })
    }
}

fn text_retry(config: &Config) -> RetryPolicy {
    RetryPolicy::new(config.llm.retry_count, config.llm.retry_delay_seconds)
}

fn text_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Null | Value::String(_) => None,
        other => Some(other.to_string()),
    }
}
