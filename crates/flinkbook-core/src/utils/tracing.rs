use chrono::Local;
use std::io;
use std::path::PathBuf;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

fn log_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("flinkbook").join("logs"))
}

fn to_io_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(format!("Failed to set global default subscriber: {e}"))
}

/// Initialize tracing. Filtering comes from `RUST_LOG`.
///
/// Logs go to a timestamp-named file under the user data directory unless
/// `to_stderr` is set or no data directory exists. Returns the log file path.
pub fn init_tracing(to_stderr: bool) -> io::Result<Option<PathBuf>> {
    let filter = EnvFilter::from_default_env();

    if let Some(log_dir) = log_dir().filter(|_| !to_stderr) {
        std::fs::create_dir_all(&log_dir)?;
        let file_name = format!("{}.log", Local::now().format("%Y%m%d_%H%M%S"));
        let path = log_dir.join(&file_name);
        let file_appender = rolling::never(&log_dir, file_name);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter);
        tracing::subscriber::set_global_default(subscriber).map_err(to_io_error)?;

        tracing::debug!(
            target: "flinkbook::utils::tracing",
            path = %path.display(),
            "Tracing initialized with file output"
        );
        return Ok(Some(path));
    }

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::Layer::default()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true),
        )
        .with(filter);
    tracing::subscriber::set_global_default(subscriber).map_err(to_io_error)?;

    tracing::debug!(
        target: "flinkbook::utils::tracing",
        "Tracing initialized with stderr output"
    );
    Ok(None)
}
