use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, StrataError};

/// Installs the global fmt subscriber filtered by `level` (an `EnvFilter` directive).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level).map_err(|e| StrataError::Config(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| StrataError::Config("logging already initialized".into()))
}
