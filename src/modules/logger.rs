use crate::modules::config::get_data_dir;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn get_log_dir() -> Result<PathBuf, String> {
    let data_dir = get_data_dir().map_err(|e| e.to_string())?;
    let log_dir = data_dir.join("logs");

    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)
            .map_err(|e| format!("Failed to create log directory: {}", e))?;
    }

    Ok(log_dir)
}

/// Initialize logger system
///
/// `default_level` applies when RUST_LOG is not set.
pub fn init_logger(default_level: &str) {
    // Capture log macro logs
    let _ = tracing_log::LogTracer::init();

    let log_dir = match get_log_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to initialize log directory: {}", e);
            return;
        }
    };

    // 1. File appender, daily rolling
    let file_appender = tracing_appender::rolling::daily(log_dir, "gateway.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // 2. Console output layer
    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    // 3. File output layer (no ANSI)
    let file_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true);

    // 4. Filter layer
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // 5. try_init so a second call (tests, embedding) is harmless
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    // The worker guard must live until exit
    std::mem::forget(_guard);

    info!("Logger system initialized (Console + File Persistence)");
}

/// Log info message
pub fn log_info(message: &str) {
    info!("{}", message);
}

/// Log warning message
pub fn log_warn(message: &str) {
    warn!("{}", message);
}
