//! Opt-in logging setup. Library code never calls this; it is for the demo
//! binary (and any other embedder) to call once at startup.
//!
//! Terminal sink plus an optional file sink via `simplelog`, local time
//! offset, `CombinedLogger::init`.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger};

/// Initializes a terminal logger at `term_level` and, if `log_file` is
/// given, an additional file logger at `LevelFilter::Debug`.
pub fn init(term_level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap_or_else(|builder| builder)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(term_level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto)];

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create log directory")?;
        }
        let file = File::create(path).with_context(|| format!("failed to create log file {path:?}"))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, file));
    }

    CombinedLogger::init(loggers).context("a logger is already installed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_builds_without_a_log_file() {
        // A second call within the test binary would fail (logger already
        // installed), so this only exercises config construction, not
        // CombinedLogger::init itself.
        let config = ConfigBuilder::new().set_time_offset_to_local().unwrap_or_else(|b| b).build();
        let _term = TermLogger::new(LevelFilter::Info, config, TerminalMode::Mixed, ColorChoice::Auto);
    }
}
