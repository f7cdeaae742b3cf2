//! Logging bootstrap
//!
//! Consistent tracing configuration for the engine and embedders. Console
//! output through tracing-subscriber with an env-filter override
//! (`SHADE_LOG=shade_core=trace` etc.).

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration matching the embedder config file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include module target
    #[serde(default = "default_true")]
    pub show_target: bool,

    /// Use ANSI colors
    #[serde(default)]
    pub ansi_colors: bool,

    /// Log level as string
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            timestamps: true,
            show_target: true,
            ansi_colors: false,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Verbose configuration for interactive debugging sessions
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            ..Default::default()
        }
    }

    fn level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Install the global subscriber. Safe to call more than once; subsequent
/// calls are ignored.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_env("SHADE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.level())));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(config.show_target)
        .with_ansi(config.ansi_colors);

    let result = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    // Already set by the embedder; keep theirs.
    let _ = result;
}
