pub mod address;
pub mod config;
pub mod models;
pub mod protocol;
pub mod traits;

pub use address::*;
pub use config::*;
pub use models::*;
pub use protocol::*;
pub use traits::*;

/// Crate version reported by `version()` on every surface.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
