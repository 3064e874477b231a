//! Common helper functions for Duet.

use std::str::FromStr;

/// Longest session identifier the relay will route to.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Reads a boolean flag from the environment.
///
/// `1`, `true`, `yes` and `on` (any case) are truthy; anything else is false.
/// Returns `default` when the variable is not set.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

/// Reads and parses an environment variable, falling back to `default` when
/// it is unset or does not parse.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Checks that a session identifier looks like one the relay hands out.
///
/// Identifiers are opaque to clients, but the relay refuses to route to
/// anything empty, oversized or containing characters outside
/// `[A-Za-z0-9_-]`.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
