//! Log output of the process

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

/// Options controlling the log output
#[derive(Debug, Clone, StructOpt)]
pub struct LoggingOptions {
    /// Log filter in `tracing` directive syntax, e.g. `info,herald=debug`
    #[structopt(long = "log", env = "RUST_LOG", default_value = "info")]
    pub filter: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

/// Installs a formatting subscriber as the global default
///
/// Fails if the filter can not be parsed or a global subscriber has already been set.
pub fn init(options: &LoggingOptions) -> Result<()> {
    let filter = EnvFilter::try_new(&options.filter)
        .with_context(|| format!("invalid log filter '{}'", options.filter))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error))
        .context("failed to install log subscriber")
}
