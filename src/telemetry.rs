//! Process-wide logging setup for the `warden` binary.
//!
//! The library logs through the `log` facade; the subscriber installed here
//! also bridges those records, so one `RUST_LOG` filter covers both.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `level`. Only the
/// first call in a process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).try_init().ok();
    } else {
        registry.with(fmt::layer().with_target(false)).try_init().ok();
    }
}
