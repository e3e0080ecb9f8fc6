//! Admin HTTP endpoint exposed on the daemon port.

mod auth;
mod errors;
mod handlers;
mod server;

pub use self::auth::load_token_file;
pub use self::errors::ApiError;
pub use self::server::AdminServer;
pub use self::server::AdminServerConfig;
pub use self::server::AdminServerHandle;
pub use self::server::ReleaseHook;
