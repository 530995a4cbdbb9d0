//! Plugin hooks and plugin arguments.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::session::SchedulingSession;

/// A scheduler plugin, opened and closed once per scheduling session.
pub trait Plugin: Send {
    fn name(&self) -> &'static str;

    fn on_session_open(&mut self, session: &mut dyn SchedulingSession);

    fn on_session_close(&mut self, session: &mut dyn SchedulingSession);
}

/// Errors reading plugin arguments.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ArgumentError {
    #[error("argument '{key}' is not a number: '{value}'")]
    NotANumber { key: String, value: String },

    #[error("argument '{key}' is out of range: {value}")]
    OutOfRange { key: String, value: f64 },
}

/// Free-form string arguments configured for a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Arguments(BTreeMap<String, String>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Read a finite, non-negative float. `Ok(None)` if the key is absent.
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, ArgumentError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let value: f64 = raw.trim().parse().map_err(|_| ArgumentError::NotANumber {
            key: key.to_string(),
            value: raw.to_string(),
        })?;
        if !value.is_finite() || value < 0.0 {
            return Err(ArgumentError::OutOfRange {
                key: key.to_string(),
                value,
            });
        }
        Ok(Some(value))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Arguments {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_missing_key() {
        assert_eq!(Arguments::new().get_f64("overcommit-factor"), Ok(None));
    }

    #[rstest]
    #[case("1.5", 1.5)]
    #[case(" 2 ", 2.0)]
    #[case("0", 0.0)]
    fn test_valid_float(#[case] raw: &str, #[case] expected: f64) {
        let args = Arguments::new().with("factor", raw);
        assert_eq!(args.get_f64("factor"), Ok(Some(expected)));
    }

    #[rstest]
    #[case("high")]
    #[case("-1")]
    #[case("inf")]
    #[case("NaN")]
    fn test_invalid_float(#[case] raw: &str) {
        let args = Arguments::new().with("factor", raw);
        assert!(args.get_f64("factor").is_err());
    }

    #[test]
    fn test_deserialize_from_config() {
        let args: Arguments =
            serde_json::from_str(r#"{"overcommit-factor": "1.5"}"#).unwrap();
        assert_eq!(args.get("overcommit-factor"), Some("1.5"));
    }
}
