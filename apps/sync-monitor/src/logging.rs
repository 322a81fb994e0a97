//! Tracing/logging bootstrap for the monitor.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sync_monitor=debug,sync_core=debug,sync_remote=debug";

/// Install the global fmt subscriber.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `SYNC_MONITOR_LOG`
/// 3) `WACHAT_LOG`
/// 4) built-in default
pub fn init() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    filter_from_lookup(|key| env::var(key).ok())
}

fn filter_from_lookup<F>(mut lookup: F) -> EnvFilter
where
    F: FnMut(&str) -> Option<String>,
{
    for key in ["SYNC_MONITOR_LOG", "WACHAT_LOG"] {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
