//! Tracing subscriber setup shared by binaries embedding the session core.

use chrono::Local;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{Result, SessionError};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str =
    "barter_session=info,barter_realtime=info,barter_cli=info,reqwest=warn";

/// Formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Output format of the console layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Resolve the filter: explicit directive, then `RUST_LOG`, then [`DEFAULT_LOG_FILTER`].
pub fn resolve_filter(directive: Option<&str>) -> Result<EnvFilter> {
    match directive {
        Some(directive) => EnvFilter::try_new(directive).map_err(|e| {
            SessionError::configuration(format!("invalid log filter `{directive}`: {e}"))
        }),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(directive: Option<&str>, format: LogFormat) -> Result<()> {
    let filter = resolve_filter(directive)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_timer(LocalTimer))
            .try_init(),
    };

    result.map_err(|e| {
        SessionError::configuration(format!("Failed to set global default subscriber: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directive_is_validated() {
        assert!(resolve_filter(Some("barter_session=debug")).is_ok());
        assert!(matches!(
            resolve_filter(Some("barter_session=loud")),
            Err(SessionError::Configuration { .. })
        ));
    }

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
