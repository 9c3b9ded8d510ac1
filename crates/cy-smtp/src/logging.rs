use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const FILTER_ENV_VAR: &str = "CY_SMTP_LOG";
pub const DEFAULT_FILTER: &str = "cy_smtp=info,rfc5321=info";

/// Diagnostic logs go to stderr, leaving stdout for progress output
pub fn init() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(
        std::env::var(FILTER_ENV_VAR)
            .as_deref()
            .unwrap_or(DEFAULT_FILTER),
    )?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .try_init()?;

    Ok(())
}
