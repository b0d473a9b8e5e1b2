// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::DaemonConfig;

const LOG_PREFIX: &str = "multipathd.log";

/// Level directive for our crates: `-v` flags win over the configured level.
pub fn level_directive(verbose: u8, configured: Option<&str>) -> String {
    match verbose {
        0 => configured.unwrap_or("info").to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Build the filter. `RUST_LOG` replaces it entirely when set.
pub fn env_filter(verbose: u8, config: &DaemonConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level_directive(verbose, config.log_level.as_deref());
        EnvFilter::new(format!("multipathd={level},warn"))
    })
}

/// Install the global subscriber: stderr always, plus a daily log file
/// when `log_dir` is configured. The guard must live as long as the daemon.
pub fn init(verbose: u8, config: &DaemonConfig) -> Option<WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose > 0);

    let file = config.log_dir.as_deref().and_then(|dir| match file_writer(dir) {
        Ok(pair) => Some(pair),
        Err(e) => {
            eprintln!("multipathd: failed to initialize file logging: {e:#}");
            None
        }
    });

    match file {
        Some((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter(verbose, config))
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter(verbose, config))
                .with(stderr_layer)
                .init();
            None
        }
    }
}

fn file_writer(
    dir: &Path,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if let Err(e) = fs::create_dir_all(dir) {
        return Err(anyhow::anyhow!(
            "create log directory failed: {} ({})",
            dir.display(),
            e
        ));
    }

    let appender = tracing_appender::rolling::daily(dir, LOG_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_overrides_configured_level() {
        assert_eq!(level_directive(0, None), "info");
        assert_eq!(level_directive(0, Some("warn")), "warn");
        assert_eq!(level_directive(1, Some("warn")), "debug");
        assert_eq!(level_directive(3, None), "trace");
    }
}
