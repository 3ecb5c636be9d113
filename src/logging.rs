use anyhow::{Context, Result};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console logging plus an optional plain-text copy in `log_file`.
///
/// `-v`/`-q` set the level for the transport library and for `tool_target`
/// (the calling binary's crate name); every other crate logs warnings only.
/// `RUST_LOG` directives override both. Keep the returned guard alive
/// for as long as the file should be written.
pub fn setup_logging(
    log_file_path: Option<PathBuf>,
    verbosity: &Verbosity<InfoLevel>,
    tool_target: &str,
) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = filter_directives(verbosity.tracing_level_filter(), tool_target, env.as_deref());
    let filter = EnvFilter::builder().parse_lossy(directives);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

/// Later directives win, so `RUST_LOG` goes last
fn filter_directives(level: LevelFilter, tool_target: &str, env: Option<&str>) -> String {
    let mut directives = format!("warn,h4p_lib={level},{tool_target}={level}");
    if let Some(env) = env.filter(|e| !e.is_empty()) {
        directives.push(',');
        directives.push_str(env);
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_applies_to_transport_and_tool() {
        assert_eq!(
            filter_directives(LevelFilter::DEBUG, "h4p_sim", None),
            "warn,h4p_lib=debug,h4p_sim=debug"
        );
        assert_eq!(
            filter_directives(LevelFilter::INFO, "h4p_decode", Some("")),
            "warn,h4p_lib=info,h4p_decode=info"
        );
    }

    #[test]
    fn test_rust_log_comes_last() {
        let directives = filter_directives(LevelFilter::INFO, "h4p_sim", Some("h4p_lib::power=trace"));
        assert_eq!(directives, "warn,h4p_lib=info,h4p_sim=info,h4p_lib::power=trace");
        assert!(EnvFilter::builder().parse(&directives).is_ok());
    }
}
