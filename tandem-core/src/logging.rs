use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Initialize structured logging based on configuration
///
/// JSON or pretty output, to a file when `file_path` is set and to stderr
/// otherwise. `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let layer = fmt::layer()
        .with_writer(log_writer(config.file_path.as_deref())?)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_line_number(true);
    let layer = if config.format == "json" {
        layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .boxed()
    } else {
        layer.pretty().with_file(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()?;
    Ok(())
}

/// Appending file writer, or stderr so stdout stays free for session output
fn log_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    let Some(path) = file_path else {
        return Ok(BoxMakeWriter::new(std::io::stderr));
    };
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("debug").is_ok());
        assert!(parse_log_level("INFO").is_ok());
        assert!(parse_log_level("warning").is_ok());
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_init_logging_rejects_unknown_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_log_writer_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.log");
        let path = path.to_str().unwrap();

        for line in ["first\n", "second\n"] {
            let writer = log_writer(Some(path)).unwrap();
            writer.make_writer().write_all(line.as_bytes()).unwrap();
        }

        assert_eq!(std::fs::read_to_string(path).unwrap(), "first\nsecond\n");
    }
}
