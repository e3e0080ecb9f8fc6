//! The node this agent advertises and the loop that keeps it registered.

pub mod builder;
pub mod controller;
pub mod lease;

pub use self::builder::node_from_provider;
pub use self::controller::NodeController;
pub use self::controller::NodeControllerError;
pub use self::controller::NodeControllerOptions;
pub use self::controller::StatusUpdateErrorHandler;
