pub mod executor;
pub mod file_source;
