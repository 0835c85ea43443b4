use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "./logs/reshelve.log";

/// Terminal output plus a plain-text log file. Keep the returned guard alive
/// until exit or buffered file lines are lost.
pub fn init_logger() -> WorkerGuard {
    let level = env::var("TRACING_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_file = env::var("LOG_FILE_PATH").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string());
    let (directory, file_name) = log_file_target(&log_file);

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&directory, &file_name));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .pretty()
                .with_file(false)
                .without_time()
                .with_ansi(true),
        )
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(EnvFilter::new(level))
        .init();

    info!(
        "Logging to stdout and {}",
        directory.join(&file_name).display()
    );
    guard
}

/// Split a configured log path into the appender's directory and file name.
/// A bare file name lands in the working directory; a path without a file
/// name gets the default one.
fn log_file_target(raw: &str) -> (PathBuf, OsString) {
    let path = Path::new(raw);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "reshelve.log".into());
    (directory.to_path_buf(), file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_target() {
        assert_eq!(
            log_file_target("./logs/reshelve.log"),
            (PathBuf::from("./logs"), OsString::from("reshelve.log"))
        );
        assert_eq!(
            log_file_target("run.log"),
            (PathBuf::from("."), OsString::from("run.log"))
        );
        assert_eq!(
            log_file_target("/var/log/"),
            (PathBuf::from("/var"), OsString::from("log"))
        );
        assert_eq!(
            log_file_target(".."),
            (PathBuf::from("."), OsString::from("reshelve.log"))
        );
    }
}
