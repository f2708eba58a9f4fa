//! Logging setup and the optional `#[obs]` span instrumentation.

pub use strand_observability_macros::obs;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LOG_FILTER: &str = "strand=info,strandctl=info";

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// Explicit filter directive; falls back to `STRAND_LOG`, then `RUST_LOG`.
    pub filter: Option<String>,
    pub json: bool,
}

fn resolve_filter(options: &ObservabilityOptions) -> EnvFilter {
    if let Some(filter) = options.filter.as_deref()
        && let Ok(filter) = EnvFilter::try_new(filter)
    {
        return filter;
    }
    EnvFilter::try_from_env("STRAND_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init(options: ObservabilityOptions) {
    let filter = resolve_filter(&options);
    let result = if options.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing init failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins() {
        let filter = resolve_filter(&ObservabilityOptions {
            filter: Some("strand=trace".to_string()),
            json: false,
        });
        assert_eq!(filter.to_string(), "strand=trace");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init(ObservabilityOptions::default());
        init(ObservabilityOptions::default());
    }
}
