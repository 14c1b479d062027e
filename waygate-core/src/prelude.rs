//! Re-exports commonly used across the workspace's other crates.

pub use anyhow::{Context as _, Result as AnyResult};
pub use tracing::{debug, error, info, instrument, trace, warn};
