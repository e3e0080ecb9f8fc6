pub mod api;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod orchestrator;
pub mod pod;
pub mod provider;

pub use error::AgentError;
pub use orchestrator::Orchestrator;
pub use orchestrator::Stage;
