// packages/simlink/src/orchestrator/settings.rs
//! Configuration record handed to the simulation engine
//!
//! Keys are free-form. Known kinds (flags, counts, numbers, identifiers) get
//! typed accessors; everything is rendered as `--key=value` in key order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One setting value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Flag(bool),
    Count(u64),
    Number(f64),
    Text(String),
}

impl SettingValue {
    /// Infer the kind of a command-line value
    pub fn parse(raw: &str) -> Self {
        match raw {
            "true" => return SettingValue::Flag(true),
            "false" => return SettingValue::Flag(false),
            _ => {}
        }
        if let Ok(count) = raw.parse::<u64>() {
            return SettingValue::Count(count);
        }
        if let Ok(number) = raw.parse::<f64>() {
            if number.is_finite() {
                return SettingValue::Number(number);
            }
        }
        SettingValue::Text(raw.to_string())
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Flag(v) => write!(f, "{}", v),
            SettingValue::Count(v) => write!(f, "{}", v),
            SettingValue::Number(v) => write!(f, "{}", v),
            SettingValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Flag(v)
    }
}

impl From<u64> for SettingValue {
    fn from(v: u64) -> Self {
        SettingValue::Count(v)
    }
}

impl From<u32> for SettingValue {
    fn from(v: u32) -> Self {
        SettingValue::Count(v as u64)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Number(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Text(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Text(v)
    }
}

/// Ordered key/value settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimulationSettings(BTreeMap<String, SettingValue>);

impl SimulationSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.0.get(key)
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            SettingValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn count(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            SettingValue::Count(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value; counts are widened
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            SettingValue::Number(v) => Some(*v),
            SettingValue::Count(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            SettingValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
        self.0.iter()
    }

    /// Re-key entries whose name matches one of `keys` ignoring ASCII case
    ///
    /// Layered config sources fold keys to lower case; this puts back the
    /// spelling the engine expects.
    pub fn with_key_case<'a, I>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let originals: Vec<&str> = keys.into_iter().collect();
        Self(
            self.0
                .into_iter()
                .map(|(key, value)| {
                    let key = originals
                        .iter()
                        .find(|original| original.eq_ignore_ascii_case(&key))
                        .map(|original| original.to_string())
                        .unwrap_or(key);
                    (key, value)
                })
                .collect(),
        )
    }

    /// Render as `--key=value` arguments
    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(key, value)| format!("--{}={}", key, value))
            .collect()
    }

    /// Parse `--key=value` arguments; bare `--key` is a true flag and
    /// anything not starting with `--` is ignored
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut settings = Self::new();
        for arg in args {
            let Some(body) = arg.as_ref().strip_prefix("--") else {
                continue;
            };
            match body.split_once('=') {
                Some((key, raw)) => settings.insert(key, SettingValue::parse(raw)),
                None if !body.is_empty() => settings.insert(body, SettingValue::Flag(true)),
                None => {}
            }
        }
        settings
    }
}
