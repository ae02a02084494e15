use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::OutputArgs;
use crate::config::LogFormat;

/// Level from `-v`/`-q`; `RUST_LOG` overrides it when set.
pub fn level_for(output: &OutputArgs) -> Level {
    if output.quiet {
        return Level::ERROR;
    }
    match output.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean for
/// `--dry-run` and `--list-voices` output. A second call is a no-op.
pub fn init(output: &OutputArgs, format: LogFormat) {
    let level = level_for(output);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let result = match format {
        LogFormat::Human => tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
