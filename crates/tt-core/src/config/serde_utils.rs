//! Shared serde helpers for configuration files

/// Durations stored as whole seconds.
///
/// Deserialization also accepts a suffixed string (`"500ms"`, `"30s"`,
/// `"5m"`, `"1h"`) so sub-second timeouts can be written in TOML.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "tt_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(D::Error::custom),
        }
    }
}

/// Parse `"<n>ms"`, `"<n>s"`, `"<n>m"`, `"<n>h"` or a bare number of seconds
pub fn parse_duration(text: &str) -> Result<std::time::Duration, String> {
    use std::time::Duration;

    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {:?}", text))?;

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        #[serde(with = "duration_secs")]
        timeout: Duration,
    }

    #[test]
    fn test_duration_secs_serialize() {
        let config = TestConfig {
            timeout: Duration::from_secs(30),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"timeout":30}"#);
    }

    #[test]
    fn test_duration_accepts_number_or_text() {
        let config: TestConfig = serde_json::from_str(r#"{"timeout":60}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(60));

        let config: TestConfig = toml::from_str(r#"timeout = "250ms""#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));

        let config: TestConfig = toml::from_str(r#"timeout = "5m""#).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10 fortnights").is_err());
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
    }
}
