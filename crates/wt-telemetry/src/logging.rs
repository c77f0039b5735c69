use tracing_subscriber::{fmt, EnvFilter};

/// Output style of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStyle {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event (suitable for Vector / Loki / ELK).
    Json,
}

/// Install the global subscriber, writing to stderr so command output on
/// stdout stays clean.
///
/// `RUST_LOG` wins when set; otherwise `default_level` is used as the filter
/// directive (e.g. "info", "wt_core=debug,warn"). An unparsable directive
/// falls back to `info`.
///
/// Returns `false` when a subscriber was already installed, which makes
/// repeated calls (e.g. from tests) harmless.
pub fn init_logging(service_name: &str, default_level: &str, style: LogStyle) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    let installed = match style {
        LogStyle::Pretty => builder.with_thread_ids(false).try_init().is_ok(),
        LogStyle::Json => builder
            .json()
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(service = service_name, style = ?style, "logging initialised");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init_logging("wt-test", "debug", LogStyle::Pretty);
        assert!(!init_logging("wt-test", "not a [valid directive", LogStyle::Json));
    }
}
