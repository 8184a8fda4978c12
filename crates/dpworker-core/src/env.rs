//! Environment variable utilities
//!
//! Typed lookups with a fallback, used by the configuration layer and the
//! logger. Values that fail to parse fall back to the default.
//!
//! ```ignore
//! use dpworker_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("DPW_NUM_WORKERS", 1);
//! let pin: bool = env_get_bool("DPW_PIN_WORKERS", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" are true and "0", "false", "no", "off" are
/// false (case-insensitive). Anything else, including unset, returns the
/// default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => parse_bool(&val).unwrap_or(default),
        Err(_) => default,
    }
}

/// Shared boolean spelling for env and config values
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__DPW_TEST_UNSET_VAR__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("__DPW_TEST_ENV_GET_U64__", " 1500 ");
        let val: u64 = env_get("__DPW_TEST_ENV_GET_U64__", 7);
        assert_eq!(val, 1500);

        std::env::set_var("__DPW_TEST_ENV_GET_BAD__", "lots");
        let val: u64 = env_get("__DPW_TEST_ENV_GET_BAD__", 7);
        assert_eq!(val, 7);
    }

    #[test]
    fn test_env_get_bool() {
        assert!(env_get_bool("__DPW_TEST_UNSET_VAR__", true));
        assert!(!env_get_bool("__DPW_TEST_UNSET_VAR__", false));

        std::env::set_var("__DPW_TEST_ENV_BOOL__", "Yes");
        assert!(env_get_bool("__DPW_TEST_ENV_BOOL__", false));

        std::env::set_var("__DPW_TEST_ENV_BOOL_OFF__", "off");
        assert!(!env_get_bool("__DPW_TEST_ENV_BOOL_OFF__", true));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
