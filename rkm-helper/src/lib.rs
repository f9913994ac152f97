pub mod exec;
pub mod orchestrator;
pub mod server;

/// Reported by `GetVersion`.
pub const HELPER_VERSION: &str = env!("CARGO_PKG_VERSION");
