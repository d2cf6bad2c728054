use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::core::config::LoggingConfig;

pub(crate) fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Install the global subscriber. Unknown levels fall back to INFO.
pub(crate) fn init_logging(cfg: &LoggingConfig) {
    let level = parse_level(&cfg.level);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level.unwrap_or(Level::INFO))
        .with_ansi(cfg.ansi)
        .with_target(false)
        .finish();
    // Already installed when the service is restarted in-process.
    tracing::subscriber::set_global_default(subscriber).ok();
    if level.is_none() {
        tracing::warn!("Unknown log level `{}`, using info", cfg.level);
    }
}
