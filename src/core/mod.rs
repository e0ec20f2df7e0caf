pub mod config;
pub mod continuity;
pub mod error;
pub mod illustration;
pub mod io;
pub mod package;
pub mod profile;
