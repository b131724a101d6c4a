//! Environment variable helpers.
//!
//! Configuration overrides take a lookup function instead of reading the
//! process environment directly, so tests can supply their own variables
//! without touching global state.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Read a variable from the process environment.
///
/// Empty values are treated as absent.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// The trimmed value of an optional setting, treating blank as absent.
pub fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Look up and parse a variable, returning `Ok(None)` when it is not set.
pub fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", key, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_present_treats_blank_as_absent() {
        assert_eq!(present(&None), None);
        assert_eq!(present(&Some(String::new())), None);
        assert_eq!(present(&Some("   ".to_string())), None);
        assert_eq!(
            present(&Some(" https://push.example ".to_string())),
            Some("https://push.example")
        );
    }

    #[test]
    fn test_parse_var_present() {
        let lookup = lookup_from(&[("INTERVAL", " 30 ")]);
        let value: Option<u64> = parse_var(&lookup, "INTERVAL").unwrap();
        assert_eq!(value, Some(30));
    }

    #[test]
    fn test_parse_var_absent() {
        let lookup = lookup_from(&[]);
        let value: Option<u64> = parse_var(&lookup, "INTERVAL").unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_parse_var_invalid() {
        let lookup = lookup_from(&[("INTERVAL", "soon")]);
        let result: Result<Option<u64>> = parse_var(&lookup, "INTERVAL");
        assert!(result.unwrap_err().to_string().contains("INTERVAL"));
    }
}
