use std::fs::File;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Result;

/// Installs the global tracing subscriber.
///
/// Logs go to stdout and, when `log_file` is given, to that file as plain
/// text. The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal());

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    // A subscriber installed earlier (tests, embedding applications) wins.
    if let Err(err) = Registry::default()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
    {
        tracing::debug!("tracing subscriber already set: {err}");
    }
    Ok(())
}
