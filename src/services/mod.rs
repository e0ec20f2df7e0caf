pub mod identity;
pub mod image;
pub mod llm;
pub mod pages;
pub mod prompts;
pub mod retry;
pub mod scenes;
pub mod story;
pub mod workflow;
