pub mod media;
pub mod text;
