//! Command line surface and the configuration bundle it produces.

pub mod agent;
pub mod cli;
pub mod run;

pub use agent::*;
pub use cli::*;
pub use run::*;
