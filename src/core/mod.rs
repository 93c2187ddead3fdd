pub mod domain;
pub mod orchestrator;
pub mod registry;
pub mod result;
pub mod selection;
pub mod traits;
pub mod transcript;
