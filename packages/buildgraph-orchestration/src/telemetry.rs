use tracing_subscriber::EnvFilter;

/// Overrides the filter passed to [`init_tracing`]
pub const LOG_ENV: &str = "BUILDGRAPH_LOG";

pub const DEFAULT_FILTER: &str = "info,buildgraph_orchestration=info,buildgraph_storage=warn";

/// Install the fmt subscriber. Returns `false` if one was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing(DEFAULT_FILTER);
        assert!(!init_tracing("debug"));
    }
}
