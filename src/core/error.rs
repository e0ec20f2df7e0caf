use std::fmt;
use thiserror::Error;

/// A stage of a storybook run. Used to tag failures surfaced from the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Story,
    Pagination,
    Scene,
    Illustration,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Story => "story generation",
            Stage::Pagination => "pagination",
            Stage::Scene => "scene derivation",
            Stage::Illustration => "illustration generation",
        };
        f.write_str(name)
    }
}

/// Failure reported by a text or image backend.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{provider}: {message}")]
pub struct BackendError {
    pub provider: String,
    pub message: String,
    /// Rate limits, 5xx responses and transport failures are worth retrying.
    pub retryable: bool,
}

impl BackendError {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(provider, message)
        }
    }

    pub fn malformed(provider: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::new(provider, format!("malformed response: {}", detail))
    }

    /// Classify an HTTP status: 429 and 5xx are retryable, everything else is not.
    pub fn from_status(provider: impl Into<String>, status: u16, body: &str) -> Self {
        let message = match status {
            401 | 403 => format!("authentication failed ({}): {}", status, body),
            429 => format!("rate limited: {}", body),
            _ => format!("HTTP {}: {}", status, body),
        };
        if status == 429 || status >= 500 {
            Self::retryable(provider, message)
        } else {
            Self::new(provider, message)
        }
    }

    pub fn transport(provider: impl Into<String>, err: reqwest::Error) -> Self {
        Self::retryable(provider, format!("request failed: {}", err))
    }
}

#[derive(Debug, Error)]
pub enum StorybookError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("profile error: {0}")]
    Profile(String),

    #[error("pagination error: {0}")]
    Pagination(String),

    #[error("{stage} failed{}: {source}", page_suffix(.page))]
    Backend {
        stage: Stage,
        page: Option<u32>,
        #[source]
        source: BackendError,
    },

    #[error("illustration generation failed on page {page}: {source}")]
    Generation {
        page: u32,
        #[source]
        source: BackendError,
    },

    #[error("continuity sequence violation: {0}")]
    Sequence(String),

    #[error("package error: {0}")]
    Package(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn page_suffix(page: &Option<u32>) -> String {
    match page {
        Some(p) => format!(" on page {}", p),
        None => String::new(),
    }
}

impl StorybookError {
    pub fn backend(stage: Stage, source: BackendError) -> Self {
        StorybookError::Backend {
            stage,
            page: None,
            source,
        }
    }

    pub fn backend_on_page(stage: Stage, page: u32, source: BackendError) -> Self {
        StorybookError::Backend {
            stage,
            page: Some(page),
            source,
        }
    }

    /// The stage this error belongs to, when it can be attributed to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StorybookError::Pagination(_) => Some(Stage::Pagination),
            StorybookError::Backend { stage, .. } => Some(*stage),
            StorybookError::Generation { .. } | StorybookError::Sequence(_) => {
                Some(Stage::Illustration)
            }
            _ => None,
        }
    }

    pub fn page(&self) -> Option<u32> {
        match self {
            StorybookError::Backend { page, .. } => *page,
            StorybookError::Generation { page, .. } => Some(*page),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorybookError>;
