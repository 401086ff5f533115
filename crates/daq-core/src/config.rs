//! Flat section/key configuration map.
//!
//! The daemon reads an INI-style file (`[section]` headers, `key=value`
//! lines, `#` or `;` comments) into a [`ConfigMap`]; components then pull
//! typed values out of their own section. Numeric byte sizes accept the
//! suffixes `k,M,G,T,P` (base 1024), with decimal input allowed ("1.5M").

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Error type for configuration failures. All fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    /// Syntax error in the config text (line number, description).
    Syntax(usize, String),
    /// A key was present but its value could not be parsed.
    BadValue {
        section: String,
        key: String,
        value: String,
        expected: &'static str,
    },
    /// A mandatory key was missing.
    Missing { section: String, key: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Syntax(line, msg) => write!(f, "config syntax error, line {}: {}", line, msg),
            ConfigError::BadValue { section, key, value, expected } => {
                write!(f, "bad value for {}.{}: '{}' (expected {})", section, key, value, expected)
            }
            ConfigError::Missing { section, key } => write!(f, "missing mandatory key {}.{}", section, key),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parsed configuration: section name -> key -> raw string value.
///
/// Sections are kept sorted so that enumeration order (and therefore
/// equipment/consumer creation order) is deterministic.
#[derive(Debug, Default, Clone)]
pub struct ConfigMap {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses INI-style text. Keys outside any `[section]` go to the
    /// empty-named section.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut map = ConfigMap::new();
        let mut current = String::new();
        for (n, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| ConfigError::Syntax(n + 1, "unterminated section header".into()))?;
                current = name.trim().to_string();
                map.sections.entry(current.clone()).or_default();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax(n + 1, format!("expected key=value, got '{}'", line)));
            };
            map.sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(map)
    }

    /// Inserts a value, creating the section if needed. Used by tests and
    /// by the daemon to fold CLI overrides into the map.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Names of all sections starting with the given prefix, in sorted order.
    pub fn sections_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.sections
            .keys()
            .filter(|s| s.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn get_str(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    pub fn get_str_or(&self, section: &str, key: &str, default: &str) -> String {
        self.get_str(section, key).unwrap_or(default).to_string()
    }

    pub fn require_str(&self, section: &str, key: &str) -> Result<String, ConfigError> {
        self.get_str(section, key)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::Missing { section: section.into(), key: key.into() })
    }

    fn parsed<T: FromStr>(&self, section: &str, key: &str, expected: &'static str) -> Result<Option<T>, ConfigError> {
        match self.get_str(section, key) {
            None => Ok(None),
            Some(v) => v.parse::<T>().map(Some).map_err(|_| ConfigError::BadValue {
                section: section.into(),
                key: key.into(),
                value: v.into(),
                expected,
            }),
        }
    }

    pub fn get_i64(&self, section: &str, key: &str) -> Result<Option<i64>, ConfigError> {
        self.parsed(section, key, "integer")
    }

    pub fn get_i64_or(&self, section: &str, key: &str, default: i64) -> Result<i64, ConfigError> {
        Ok(self.get_i64(section, key)?.unwrap_or(default))
    }

    pub fn get_f64(&self, section: &str, key: &str) -> Result<Option<f64>, ConfigError> {
        self.parsed(section, key, "number")
    }

    pub fn get_f64_or(&self, section: &str, key: &str, default: f64) -> Result<f64, ConfigError> {
        Ok(self.get_f64(section, key)?.unwrap_or(default))
    }

    /// Booleans accept 0/1 (the native form in config files) plus
    /// true/false for readability.
    pub fn get_bool_or(&self, section: &str, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get_str(section, key) {
            None => Ok(default),
            Some("0") | Some("false") => Ok(false),
            Some("1") | Some("true") => Ok(true),
            Some(v) => Err(ConfigError::BadValue {
                section: section.into(),
                key: key.into(),
                value: v.into(),
                expected: "0/1",
            }),
        }
    }

    /// Byte size with optional k/M/G/T/P suffix (base 1024).
    pub fn get_bytes(&self, section: &str, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.get_str(section, key) {
            None => Ok(None),
            Some(v) => parse_bytes(v).map(Some).ok_or_else(|| ConfigError::BadValue {
                section: section.into(),
                key: key.into(),
                value: v.into(),
                expected: "byte size (suffix k,M,G,T,P)",
            }),
        }
    }

    pub fn get_bytes_or(&self, section: &str, key: &str, default: u64) -> Result<u64, ConfigError> {
        Ok(self.get_bytes(section, key)?.unwrap_or(default))
    }

    /// Comma-separated integer list; empty/missing value gives an empty list.
    pub fn get_int_list(&self, section: &str, key: &str) -> Result<Vec<i64>, ConfigError> {
        let Some(v) = self.get_str(section, key) else {
            return Ok(Vec::new());
        };
        parse_int_list(v).ok_or_else(|| ConfigError::BadValue {
            section: section.into(),
            key: key.into(),
            value: v.into(),
            expected: "comma-separated integers",
        })
    }
}

/// Parses a human-readable byte size ("512", "64k", "1.5M", "2G").
/// Suffixes are powers of 1024. Returns `None` on malformed input.
pub fn parse_bytes(input: &str) -> Option<u64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let (num, multiplier): (&str, u64) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1 << 10),
        Some('M') => (&s[..s.len() - 1], 1 << 20),
        Some('G') => (&s[..s.len() - 1], 1 << 30),
        Some('T') => (&s[..s.len() - 1], 1 << 40),
        Some('P') => (&s[..s.len() - 1], 1 << 50),
        _ => (s, 1),
    };
    let value: f64 = num.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as u64)
}

/// Parses a comma-separated list of integers. Empty input gives an empty
/// vector; blank elements are skipped.
pub fn parse_int_list(input: &str) -> Option<Vec<i64>> {
    let mut out = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.push(part.parse().ok()?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sections_and_values() {
        let text = "
# global settings
[readout]
rate = 1000
flushTimeout = 2.5

[equipment-dummy-1]
equipmentType=dummy
memoryPoolPageSize = 128k
enabled = 1
";
        let cfg = ConfigMap::parse(text).unwrap();
        assert_eq!(cfg.get_i64_or("readout", "rate", -1).unwrap(), 1000);
        assert_eq!(cfg.get_f64_or("readout", "flushTimeout", 0.0).unwrap(), 2.5);
        assert_eq!(
            cfg.get_bytes("equipment-dummy-1", "memoryPoolPageSize").unwrap(),
            Some(128 * 1024)
        );
        assert!(cfg.get_bool_or("equipment-dummy-1", "enabled", false).unwrap());
        assert_eq!(cfg.sections_with_prefix("equipment-"), vec!["equipment-dummy-1"]);
    }

    #[test]
    fn missing_and_defaults() {
        let cfg = ConfigMap::parse("[a]\nx=1\n").unwrap();
        assert_eq!(cfg.get_i64("a", "y").unwrap(), None);
        assert_eq!(cfg.get_i64_or("a", "y", 7).unwrap(), 7);
        assert!(cfg.require_str("a", "y").is_err());
    }

    #[test]
    fn bad_values_are_errors() {
        let cfg = ConfigMap::parse("[a]\nx=notanumber\n").unwrap();
        assert!(cfg.get_i64("a", "x").is_err());
        assert!(cfg.get_bool_or("a", "x", false).is_err());
    }

    #[test]
    fn byte_suffixes() {
        assert_eq!(parse_bytes("512"), Some(512));
        assert_eq!(parse_bytes("64k"), Some(64 * 1024));
        assert_eq!(parse_bytes("1.5M"), Some(3 * 512 * 1024));
        assert_eq!(parse_bytes("2G"), Some(2 << 30));
        assert_eq!(parse_bytes("1T"), Some(1 << 40));
        assert_eq!(parse_bytes("1P"), Some(1 << 50));
        assert_eq!(parse_bytes(""), None);
        assert_eq!(parse_bytes("12Q"), None);
        assert_eq!(parse_bytes("-1k"), None);
    }

    #[test]
    fn int_lists() {
        assert_eq!(parse_int_list("1,2, 3"), Some(vec![1, 2, 3]));
        assert_eq!(parse_int_list(""), Some(vec![]));
        assert_eq!(parse_int_list("1,x"), None);
    }

    #[test]
    fn syntax_errors() {
        assert!(ConfigMap::parse("[unterminated\n").is_err());
        assert!(ConfigMap::parse("novalue\n").is_err());
    }
}
