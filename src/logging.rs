//! Log setup for the watcher and its pipeline stages.
//!
//! Every stage logs under its own target, `protowatch::<component>`, so a
//! single stage can be turned up without drowning in the others:
//!
//! ```toml
//! [logging]
//! default = "warn"
//!
//! [logging.modules]
//! mirror = "debug"      # same as protowatch::mirror
//! scheduler = "info"    # every push and every held back change
//! notify = "error"
//! ```
//!
//! `RUST_LOG` replaces the whole section when set:
//! `RUST_LOG=protowatch::dispatch=debug protowatch watch`.

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Component names used by [`log_event!`](crate::log_event) and
/// [`debug_event!`](crate::debug_event). Config keys naming one of these
/// are widened to `protowatch::<name>`.
pub const COMPONENTS: &[&str] = &[
    "watcher",
    "coalescer",
    "stability",
    "retry",
    "mirror",
    "dispatch",
    "hierarchy",
    "profile",
    "scheduler",
    "publish",
];

static INIT: Once = Once::new();

/// `HH:MM:SS.mmm` in local time.
struct InstrumentClock;

impl FormatTime for InstrumentClock {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

fn target_for(key: &str) -> String {
    if COMPONENTS.contains(&key) {
        format!("{}::{key}", env!("CARGO_CRATE_NAME"))
    } else {
        key.to_string()
    }
}

/// `default,target=level,...`, with targets sorted so the string is stable.
fn filter_directives(config: &LoggingConfig) -> String {
    let mut overrides: Vec<_> = config
        .modules
        .iter()
        .map(|(key, level)| (target_for(key), level))
        .collect();
    overrides.sort();

    overrides
        .into_iter()
        .fold(config.default.clone(), |mut directives, (target, level)| {
            directives.push_str(&format!(",{target}={level}"));
            directives
        })
}

/// Install the subscriber. Later calls are ignored.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = match std::env::var("RUST_LOG") {
            Ok(_) => EnvFilter::from_default_env(),
            Err(_) => EnvFilter::new(filter_directives(config)),
        };

        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_timer(InstrumentClock)
            .with_filter(filter);

        tracing_subscriber::registry().with(layer).init();
    });
}

/// Info line under the component's target: `attached: optical_image S1/a.jpg`.
#[macro_export]
macro_rules! log_event {
    ($component:literal, $event:expr) => {
        tracing::info!(target: concat!("protowatch::", $component), "{}", $event)
    };
    ($component:literal, $event:expr, $($arg:tt)*) => {
        tracing::info!(target: concat!("protowatch::", $component), "{}: {}", $event, format!($($arg)*))
    };
}

/// Same as [`log_event!`](crate::log_event) at debug level.
#[macro_export]
macro_rules! debug_event {
    ($component:literal, $event:expr) => {
        tracing::debug!(target: concat!("protowatch::", $component), "{}", $event)
    };
    ($component:literal, $event:expr, $($arg:tt)*) => {
        tracing::debug!(target: concat!("protowatch::", $component), "{}: {}", $event, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_component_keys_are_widened() {
        let mut modules = HashMap::new();
        modules.insert("mirror".to_string(), "trace".to_string());
        modules.insert("notify".to_string(), "error".to_string());
        modules.insert("protowatch::watcher::source".to_string(), "debug".to_string());
        let config = LoggingConfig {
            default: "info".to_string(),
            modules,
        };

        assert_eq!(
            filter_directives(&config),
            "info,notify=error,protowatch::mirror=trace,protowatch::watcher::source=debug"
        );
    }

    #[test]
    fn test_no_overrides() {
        let config = LoggingConfig {
            default: "warn".to_string(),
            modules: HashMap::new(),
        };
        assert_eq!(filter_directives(&config), "warn");
    }
}
