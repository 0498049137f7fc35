//! Tracing subscriber initialisation for binaries embedding the runtime.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Level used when neither `RUST_LOG` nor `LOG_LEVEL` is set.
pub const DEFAULT_LEVEL: &str = "warn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub default_level: String,
    /// One JSON record per line instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: DEFAULT_LEVEL.to_string(),
            json: false,
        }
    }
}

/// Picks the filter directive: `RUST_LOG` verbatim, then `LOG_LEVEL`
/// lowercased, then the default. Blank values count as unset.
#[must_use]
pub fn resolve_filter_directive(rust_log: Option<&str>, log_level: Option<&str>, default_level: &str) -> String {
    fn non_blank(value: Option<&str>) -> Option<&str> {
        value.map(str::trim).filter(|value| !value.is_empty())
    }
    if let Some(directive) = non_blank(rust_log) {
        return directive.to_string();
    }
    non_blank(log_level).unwrap_or(default_level).to_ascii_lowercase()
}

/// Installs the global subscriber.
///
/// # Errors
///
/// An unparseable filter directive, or a global subscriber already being set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let log_level = std::env::var("LOG_LEVEL").ok();
    let directive = resolve_filter_directive(rust_log.as_deref(), log_level.as_deref(), &config.default_level);
    let filter = EnvFilter::try_new(&directive)?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    tracing::debug!(%directive, json = config.json, "logging initialised");
    Ok(())
}
