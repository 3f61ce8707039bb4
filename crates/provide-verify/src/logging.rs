//! Console logging.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub fn default_directive(level: &str) -> String {
    format!("provide_verify={level},warn")
}

/// Install the global subscriber: compact lines on stderr, so stdout stays
/// free for reports and stall diagnostics.
///
/// `RUST_LOG` wins over `level`. Calling this twice is a no-op.
pub fn init(level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        let directive = default_directive("debug");
        assert_eq!(directive, "provide_verify=debug,warn");
        assert!(EnvFilter::try_new(&directive).is_ok());
    }

    #[test]
    fn test_init_is_idempotent() {
        init("info");
        init("debug");
    }
}
