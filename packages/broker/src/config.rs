//! Key/value configuration sources and parsing helpers.

use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration {0}")]
    Missing(String),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// A flat source of configuration values.
pub trait ConfigSource {
    /// The raw value for `key`; blank values count as unset.
    fn get(&self, key: &str) -> Option<String>;

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().and_then(non_blank)
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned().and_then(non_blank)
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse `key` if set.
pub fn parse_opt<T>(source: &impl ConfigSource, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    source
        .get(key)
        .map(|value| {
            value.parse::<T>().map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Parse `key`, falling back to `default` when unset.
pub fn parse_or<T>(source: &impl ConfigSource, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(source, key)?.unwrap_or(default))
}

/// Parse a required `key`.
pub fn parse_required<T>(source: &impl ConfigSource, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_opt(source, key)?.ok_or_else(|| ConfigError::Missing(key.to_string()))
}

/// Required boolean flag accepting `true/false`, `1/0`, `yes/no`, `on/off`.
pub fn parse_bool(source: &impl ConfigSource, key: &str) -> Result<bool, ConfigError> {
    let value = source.required(key)?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn blank_values_are_unset() {
        let src = source(&[("A", "  "), ("B", " x ")]);
        assert_eq!(ConfigSource::get(&src, "A"), None);
        assert_eq!(ConfigSource::get(&src, "B").as_deref(), Some("x"));
        assert_eq!(src.required("A"), Err(ConfigError::Missing("A".into())));
    }

    #[test]
    fn numbers_and_flags() {
        let src = source(&[("N", "42"), ("BAD", "forty"), ("F", "Off")]);
        assert_eq!(parse_or(&src, "N", 1u32), Ok(42));
        assert_eq!(parse_or(&src, "MISSING", 7u32), Ok(7));
        assert!(matches!(
            parse_required::<u32>(&src, "BAD"),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(parse_bool(&src, "F"), Ok(false));
        assert_eq!(
            parse_bool(&src, "MISSING"),
            Err(ConfigError::Missing("MISSING".into()))
        );
        assert!(parse_bool(&src, "N").is_err());
    }
}
