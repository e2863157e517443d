//! Tracing setup for the binaries. The library itself only emits events.

/// Default filter when `RUST_LOG` is unset
pub fn default_directive(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("location_reconciliation={level},reconciliation_server={level},tower_http=warn,warn")
}

/// Install a fmt subscriber writing to stderr. `RUST_LOG` wins over `directive`.
/// Calling it twice is harmless.
pub fn init_tracing(directive: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_levels() {
        assert!(default_directive(false).starts_with("location_reconciliation=info"));
        assert!(default_directive(true).contains("reconciliation_server=debug"));
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_tracing("info");
        init_tracing("debug");
    }
}
