//! Structured logging setup.

use clap::ValueEnum;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT_GUARD: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    Json,
    /// Human-readable output for local runs.
    #[default]
    Plain,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// `WEBHOOK_LOG` first, then `RUST_LOG`, then the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    let directives = ["WEBHOOK_LOG", "RUST_LOG"]
        .into_iter()
        .find_map(|var| std::env::var(var).ok());
    filter_from(directives.as_deref(), default_level)
}

fn filter_from(directives: Option<&str>, default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Some(directives) = directives {
        return Ok(EnvFilter::try_new(directives)?);
    }
    let level = default_level.as_str().to_lowercase();
    Ok(EnvFilter::try_new(format!(
        "{level},crm_webhook_pipeline={level},tower_http=warn"
    ))?)
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logging(format: LogFormat, default_level: Level) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(default_level)?;

    let layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plain => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_uses_the_given_level() {
        let filter = filter_from(None, Level::DEBUG).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("crm_webhook_pipeline=debug"), "{rendered}");
        assert!(rendered.contains("tower_http=warn"), "{rendered}");
    }

    #[test]
    fn explicit_directives_replace_the_default() {
        let filter = filter_from(Some("warn,crm_webhook_pipeline::dispatch=trace"), Level::INFO).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("crm_webhook_pipeline::dispatch=trace"), "{rendered}");
        assert!(!rendered.contains("tower_http"), "{rendered}");
    }

    #[test]
    fn invalid_directives_are_reported() {
        assert!(matches!(
            filter_from(Some("crm_webhook_pipeline=loud"), Level::INFO),
            Err(LoggingError::FilterParse(_))
        ));
    }

    #[test]
    fn environment_lookup_builds_a_filter() {
        // Whatever the surrounding environment holds, the default path must parse.
        if std::env::var("WEBHOOK_LOG").is_err() && std::env::var("RUST_LOG").is_err() {
            assert!(build_env_filter(Level::INFO).is_ok());
        }
    }
}
