//! Tracing/logging initialization.
//!
//! `RUST_LOG` always wins over the configured default directive;
//! `DOCFLOW_LOG_FORMAT` (`json` or `pretty`) picks the output format.

use tracing_subscriber::EnvFilter;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (default; for log shippers).
    #[default]
    Json,
    /// Human-readable lines for local development.
    Pretty,
}

impl LogFormat {
    /// Parse `json` / `pretty` (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" | "text" => Some(LogFormat::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_directive: String,
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl TracingConfig {
    /// Defaults, with the format taken from `DOCFLOW_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// An unknown format name keeps the default format.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(format) = lookup(LOG_FORMAT_VAR).as_deref().and_then(LogFormat::parse) {
            config.format = format;
        }
        config
    }
}

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_VAR: &str = "DOCFLOW_LOG_FORMAT";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn format_comes_from_the_environment_lookup() {
        let pretty = TracingConfig::from_lookup(|key| {
            (key == LOG_FORMAT_VAR).then(|| "pretty".to_string())
        });
        assert_eq!(pretty.format, LogFormat::Pretty);
        assert_eq!(pretty.default_directive, "info");

        let unknown = TracingConfig::from_lookup(|_| Some("xml".to_string()));
        assert_eq!(unknown, TracingConfig::default());
        assert_eq!(TracingConfig::from_lookup(|_| None).format, LogFormat::Json);
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_with(&TracingConfig::default());
        init_with(&TracingConfig {
            default_directive: "debug".to_string(),
            format: LogFormat::Pretty,
        });
    }
}
