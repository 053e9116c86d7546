use std::path::Path;

use anyhow::Result;
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for a service binary.
///
/// Logs go to the console and, when `log_dir` is writable, to a daily-rotated
/// file as well. Filtering is controlled through `RUST_LOG` (default `info`).
pub fn init(log_dir: &str, service: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_dir_writable(log_dir) {
        backup_previous_log(log_dir, service);

        let (console_writer, console_guard) = non_blocking(std::io::stdout());
        let console_layer = fmt::layer()
            .with_writer(console_writer)
            .with_ansi(true)
            .with_target(false);

        let (file_writer, file_guard) = non_blocking(rolling::daily(log_dir, format!("{service}.log")));
        let file_layer = fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(console_layer)
            .init();

        // Guards must outlive the process or buffered lines are dropped
        std::mem::forget(file_guard);
        std::mem::forget(console_guard);

        info!("Logging to console and {log_dir}/{service}.log");
    } else {
        let (console_writer, console_guard) = non_blocking(std::io::stdout());
        let console_layer = fmt::layer()
            .with_writer(console_writer)
            .with_ansi(true)
            .with_target(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .init();

        std::mem::forget(console_guard);

        info!("Logging to console only ({log_dir} is not writable)");
    }

    Ok(())
}

fn log_dir_writable(log_dir: &str) -> bool {
    let probe = format!("{log_dir}/.write_probe");
    std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(&probe))
        .map(|_| {
            let _ = std::fs::remove_file(&probe);
        })
        .is_ok()
}

/// Move an existing `<service>.log` aside so each start writes a fresh file.
fn backup_previous_log(log_dir: &str, service: &str) {
    let current = format!("{log_dir}/{service}.log");
    if Path::new(&current).exists() {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup = format!("{log_dir}/{service}.{stamp}.log");
        if std::fs::rename(&current, &backup).is_ok() {
            info!("Previous log file moved to {backup}");
        }
    }
}
