pub mod config;
pub mod constants;
pub mod core;
pub mod docker;
pub mod native;
pub mod storage;
pub mod workspace;

#[cfg(test)]
mod stubs;
