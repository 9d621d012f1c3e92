//! Log setup. Logs go to stderr so they never interleave with the chat
//! transcript on stdout.

use std::{env, io};

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,mambo_terminal=info,chat_supabase=info";

/// Environment keys checked after `RUST_LOG`, most specific first.
const FILTER_KEYS: [&str; 2] = ["MAMBO_TERMINAL_LOG", "MAMBO_LOG"];

pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(filter_directives(|key| env::var(key).ok()))
}

/// First parseable, non-blank directive among the Mambo keys, else the
/// default.
fn filter_directives(lookup: impl Fn(&str) -> Option<String>) -> String {
    FILTER_KEYS
        .into_iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_owned())
        .find(|value| !value.is_empty() && EnvFilter::try_new(value).is_ok())
        .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
}
