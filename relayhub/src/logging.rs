use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Install the global subscriber: pretty or JSON lines, to stdout or appended
/// to `file_path`.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config.level)?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let layer = if config.format == "json" {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_ansi(ansi)
            .with_file(false)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;
    Ok(())
}

/// `RUST_LOG` wins when set; otherwise the configured directives, such as
/// `info` or `info,relayhub_sfu=debug`. Configured directives are checked
/// either way.
fn build_filter(directives: &str) -> anyhow::Result<EnvFilter> {
    let configured = EnvFilter::builder()
        .parse(directives)
        .map_err(|e| anyhow::anyhow!("Invalid logging.level '{directives}': {e}"))?;
    Ok(EnvFilter::try_from_default_env().unwrap_or(configured))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_per_target_directives() {
        assert!(build_filter("info").is_ok());
        assert!(build_filter("warn,relayhub_sfu=debug,tower_http=trace").is_ok());
    }

    #[test]
    fn test_filter_rejects_bad_level() {
        let err = build_filter("relayhub_sfu=loud").unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }

    #[test]
    fn test_invalid_level_fails_before_install() {
        let config = LoggingConfig {
            level: "relayhub=loud".to_string(),
            ..Default::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
