pub mod core;
pub mod services;
pub mod utils;

pub use crate::core::error::{BackendError, Result, Stage, StorybookError};
pub use crate::core::package::StorybookPackage;
pub use crate::core::profile::Profile;
pub use crate::services::workflow::StorybookPipeline;
