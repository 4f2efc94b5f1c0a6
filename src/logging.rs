//! Structured logging setup using `tracing-subscriber`.
//!
//! Logs go to stderr so the target command keeps stdout to itself.
//! `RUST_LOG` wins when set; otherwise the `debug` toggle picks between
//! `debug` and `info`.

use tracing_subscriber::EnvFilter;

/// Env var selecting the log line format (`text` or `json`).
pub const LOG_FORMAT_VAR: &str = "SECRET_INJECTOR_LOG_FORMAT";

/// Env var whose value `true` (any case) turns on debug logging.
pub const DEBUG_VAR: &str = "debug";

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text without colours.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name; anything other than `json` is text.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) if name.trim().eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Returns `true` when the debug toggle is set to `true`.
pub fn debug_requested(env: impl Fn(&str) -> Option<String>) -> bool {
    env(DEBUG_VAR).is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
}

/// Default filter directive when `RUST_LOG` is not set.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Initialise the global subscriber. Call once, early in `main`.
pub fn init(debug: bool, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
