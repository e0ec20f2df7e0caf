use anyhow::{bail, Context, Result};
use clap::Parser;
use inquire::Confirm;
use kidbook::core::config::Config;
use kidbook::core::illustration::{parse_override_pairs, CallOverrides, RunOverrides};
use kidbook::core::io::{NativeStorage, Storage};
use kidbook::{Profile, StorybookError, StorybookPipeline};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Generate a personalized illustrated storybook from a child profile.
#[derive(Parser, Debug)]
#[command(name = "kidbook", version)]
struct Cli {
    /// Child profile (YAML or JSON)
    #[arg(long)]
    profile: PathBuf,

    /// Reference photo of the child, as a local path or URL
    #[arg(long)]
    reference_image: String,

    /// Where to write the storybook package
    #[arg(long, default_value = "output/storybook.yml")]
    output: String,

    /// Number of pages (defaults to the middle of the configured range)
    #[arg(long)]
    pages: Option<u32>,

    #[arg(long)]
    story_model: Option<String>,

    #[arg(long)]
    page_model: Option<String>,

    #[arg(long)]
    scene_model: Option<String>,

    #[arg(long)]
    image_model: Option<String>,

    /// Extra image model parameter, repeatable
    #[arg(long = "image-arg", value_name = "KEY=VALUE")]
    image_args: Vec<String>,

    /// Base seed for deterministic illustrations
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// Skip the confirmation prompt
    #[arg(long)]
    unattended: bool,

    /// Abort the run after this many seconds
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<StorybookError>() {
                Some(err) => {
                    let stage = err
                        .stage()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "setup".to_string());
                    match err.page() {
                        Some(page) => eprintln!("Error during {} (page {}): {}", stage, page, err),
                        None => eprintln!("Error during {}: {}", stage, err),
                    }
                }
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Error loading {}", cli.config.display()))?;
    apply_cli(&mut config, &cli);
    config.validate()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let profile_bytes = storage
        .read(&cli.profile.to_string_lossy())
        .await
        .with_context(|| format!("Failed to read profile {}", cli.profile.display()))?;
    let profile_text = String::from_utf8(profile_bytes).context("Profile is not valid UTF-8")?;
    let profile = Profile::parse(&profile_text, &cli.profile)?;

    let overrides = RunOverrides {
        global: CallOverrides {
            seed: None,
            parameters: parse_override_pairs(&cli.image_args)?,
        },
        ..Default::default()
    };

    let pipeline = StorybookPipeline::from_config(config.clone(), storage.clone())?;
    let pages = cli
        .pages
        .unwrap_or_else(|| config.pagination.default_page_count());

    println!("Profile: {}", profile.name);
    println!(
        "Pages: {} ({} to {} allowed), image model: {}",
        pages, config.pagination.min_pages, config.pagination.max_pages, config.image.model
    );

    if !config.unattended {
        let proceed = Confirm::new("This run makes paid API calls. Continue?")
            .with_default(true)
            .prompt()?;
        if !proceed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let timeout = async {
        match cli.timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    let package = tokio::select! {
        result = pipeline.run(&profile, Some(pages), &cli.reference_image, &overrides) => result?,
        _ = tokio::signal::ctrl_c() => bail!("Interrupted, no package written"),
        _ = timeout => {
            bail!(
                "Timed out after {}s, no package written",
                cli.timeout.unwrap_or_default()
            )
        }
    };

    package.save(storage.as_ref(), &cli.output).await?;
    println!("Storybook package written to {}", cli.output);
    Ok(())
}

fn apply_cli(config: &mut Config, cli: &Cli) {
    if cli.unattended {
        config.unattended = true;
    }
    if let Some(model) = &cli.story_model {
        config.models.story = Some(model.clone());
    }
    if let Some(model) = &cli.page_model {
        config.models.pages = Some(model.clone());
    }
    if let Some(model) = &cli.scene_model {
        config.models.scenes = Some(model.clone());
    }
    if let Some(model) = &cli.image_model {
        config.image.model = model.clone();
    }
    if let Some(seed) = cli.seed {
        config.continuity.base_seed = Some(seed);
    }
}
