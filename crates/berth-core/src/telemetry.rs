//! Tracing setup for the `berth` binary.
//!
//! Berth's own crates log at the requested level while dependencies stay at
//! `warn`. `BERTH_LOG` overrides that with any `EnvFilter` directive string,
//! and `RUST_LOG` is honoured when `BERTH_LOG` is unset. Logs always go to
//! stderr so templates written to stdout stay parseable.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter override consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "BERTH_LOG";

const BERTH_TARGETS: &[&str] = &["berth", "berth_core", "berth_ci"];

/// Directives used when neither environment variable is set.
pub fn default_directives(level: Level) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        BERTH_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, level.as_str().to_lowercase())),
    );
    directives.join(",")
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber. Only the first call in a process has any
/// effect.
///
/// JSON output carries the current span, so run and rollout ids from
/// [`crate::obs`] appear on every event inside them.
pub fn init_tracing(json: bool, level: Level) {
    let filter = env_filter(level);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
