//! Pod lifecycle reconciliation against the provider.

pub mod controller;
pub mod env;
pub mod events;
pub mod queue;
pub mod rate_limiter;

pub use self::controller::PodController;
pub use self::controller::PodControllerConfig;
pub use self::controller::PodControllerError;
pub use self::controller::ReadySignal;
pub use self::events::EventBroadcaster;
pub use self::events::EventRecorder;
pub use self::rate_limiter::RateLimiterConfig;
