use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use tokio::sync::RwLock;
use tracing::Level;
use tracing::{debug, info, metadata::LevelFilter, trace};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Name of the log file, before the date suffix.
pub const LOG_FILE_NAME: &str = "kz.log";

// Dropping it flushes the file writer.
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

fn do_init(console_level: Level, file_level: Option<(Level, PathBuf)>) {
    let mut message = String::from("Logging with: console");

    // `RUST_LOG` narrows the console further, e.g. `kzooting_link::poller=trace`.
    let console_filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::default().add_directive(LevelFilter::from(console_level).into()),
    };

    // Stderr, so commands printing to stdout can be piped.
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let registry = tracing_subscriber::registry().with(console_layer);

    let maybe_file_layer = if let Some((level, output_dir)) = file_level {
        message += &format!(", file (in dir {output_dir:?})");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        *FILE_GUARD.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(LevelFilter::from(level));
        Some(file_layer)
    } else {
        None
    };

    registry.with(maybe_file_layer).init();

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(console_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(console_level, file_logging);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Flush what's left in the log file.
pub fn shutdown() {
    trace!("Shutting down");

    if let Some(guard) = FILE_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    {
        drop(guard);
    }
}
