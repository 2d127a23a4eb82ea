pub mod config;
pub mod error;
pub mod types;

pub use config::OutboxConfig;
pub use error::{OutboxError, Result};
pub use types::*;
