pub mod atomic;
pub mod auth;
pub mod error;
pub mod exit;
pub mod log_assert;
pub mod net_async;
pub mod net_opt;
pub mod net_protocol;
pub mod retry;
pub mod serde_secs;
pub mod server_shutdown;
pub mod time;

/// Version of the queue protocol spoken by this build.
/// Clients refuse to talk to a queue reporting a different version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
