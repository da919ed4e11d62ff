use std::path::Path;

use is_terminal::IsTerminal;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const BOOTSTRAP_LOG: &str = "bootstrap.log";

/// Install the global subscriber: human output on stderr, and when `logs_dir`
/// is given a plain-text copy in `<logs_dir>/bootstrap.log` that diagnostic
/// reports pick up. `RUST_LOG` overrides the default `info` filter.
///
/// Keep the returned guard alive until exit or buffered file lines are lost.
pub fn init(logs_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_filter(filter());

    let (file, guard) = match logs_dir.map(|dir| (dir, std::fs::create_dir_all(dir))) {
        Some((dir, Ok(()))) => {
            let appender = tracing_appender::rolling::never(dir, BOOTSTRAP_LOG);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        Some((dir, Err(e))) => {
            eprintln!("warning: cannot create {}: {e}", dir.display());
            (None, None)
        }
        None => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init();
    guard
}
