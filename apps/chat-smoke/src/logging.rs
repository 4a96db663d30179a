//! Log setup for the smoke run.
//!
//! An explicit filter is taken from `RUST_LOG`, then `CHAT_SMOKE_LOG`, then
//! `CHAT_LOG`; a value that fails to parse is skipped. Without one, the run
//! logs the connection and reconciliation crates at `debug`, and
//! `CHAT_SMOKE_TRACE=chat_socket,chat_offline` raises the named crates to
//! `trace`.

use std::env;

use tracing::debug;
use tracing_subscriber::{EnvFilter, filter::Directive};

const FILTER_KEYS: [&str; 3] = ["RUST_LOG", "CHAT_SMOKE_LOG", "CHAT_LOG"];
const TRACE_KEY: &str = "CHAT_SMOKE_TRACE";
const BASE_FILTER: &str = "info,chat_smoke=debug";

/// Crates the smoke run exercises, with their level when not traced.
const CRATE_LEVELS: [(&str, &str); 4] = [
    ("chat_socket", "debug"),
    ("chat_offline", "debug"),
    ("chat_core", "info"),
    ("chat_platform", "info"),
];

struct FilterSelection {
    source: &'static str,
    filter: EnvFilter,
}

impl FilterSelection {
    fn resolve<F>(mut lookup: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        for key in FILTER_KEYS {
            if let Some(value) = lookup(key).filter(|value| !value.trim().is_empty())
                && let Ok(filter) = EnvFilter::try_new(value)
            {
                return Self {
                    source: key,
                    filter,
                };
            }
        }
        Self {
            source: TRACE_KEY,
            filter: crate_filter(lookup(TRACE_KEY).as_deref().unwrap_or_default()),
        }
    }
}

fn crate_filter(traced: &str) -> EnvFilter {
    let traced: Vec<&str> = traced.split(',').map(str::trim).collect();
    CRATE_LEVELS
        .iter()
        .fold(EnvFilter::new(BASE_FILTER), |filter, (name, level)| {
            let level = if traced.contains(name) { "trace" } else { level };
            match format!("{name}={level}").parse::<Directive>() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            }
        })
}

/// Install the global subscriber; a second call is a no-op.
pub fn init() {
    let selection = FilterSelection::resolve(|key| env::var(key).ok());
    let source = selection.source;
    let installed = tracing_subscriber::fmt()
        .compact()
        .with_target(true)
        .with_env_filter(selection.filter)
        .try_init()
        .is_ok();
    if installed {
        debug!(source, "smoke logging ready");
    }
}
