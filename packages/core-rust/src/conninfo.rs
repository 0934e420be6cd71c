//! Connection-info descriptors: `{name, ip, port}`, normalized for
//! byte-wise comparison.
//!
//! Two nodes agree they are "the same node" by comparing the normalized
//! string form of their conninfo, not the structured fields directly —
//! see `SPEC_FULL.md` Open Question (b).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Default OpenCluster port, used when a conninfo omits `port`.
pub const DEFAULT_PORT: u16 = 31336;

/// A node's connection descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnInfo {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl ConnInfo {
    /// Builds a descriptor directly, without going through JSON.
    #[must_use]
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port: port.unwrap_or(DEFAULT_PORT),
        }
    }

    /// Parses a conninfo JSON object `{name, ip, port}`. `port` defaults
    /// to [`DEFAULT_PORT`] when absent.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        #[derive(Deserialize)]
        struct Raw {
            name: Option<String>,
            #[serde(default)]
            ip: String,
            #[serde(default)]
            port: Option<i64>,
        }

        let raw: Raw = serde_json::from_str(raw)?;
        let name = raw.name.ok_or(CoreError::MissingName)?;
        let port = match raw.port {
            None => DEFAULT_PORT,
            Some(p) if (0..=i64::from(u16::MAX)).contains(&p) => {
                u16::try_from(p).expect("range checked above")
            }
            Some(p) => return Err(CoreError::InvalidPort(p)),
        };
        Ok(Self { name, ip: raw.ip, port })
    }

    /// Canonical normalized form: a JSON object with sorted keys and no
    /// whitespace. This is the string two conninfo values are compared by.
    #[must_use]
    pub fn normalized(&self) -> String {
        // Field order below is the sort order of the key names
        // (`ip` < `name` < `port`), so this literal construction already
        // produces sorted-key, whitespace-free JSON without needing a
        // generic canonicalizer.
        format!(
            r#"{{"ip":{},"name":{},"port":{}}}"#,
            serde_json::to_string(&self.ip).unwrap_or_else(|_| "\"\"".to_string()),
            serde_json::to_string(&self.name).unwrap_or_else(|_| "\"\"".to_string()),
            self.port,
        )
    }
}

impl PartialEq for ConnInfo {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for ConnInfo {}

impl std::hash::Hash for ConnInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_object() {
        let info = ConnInfo::parse(r#"{"name":"node-a","ip":"127.0.0.1","port":13600}"#).unwrap();
        assert_eq!(info.name, "node-a");
        assert_eq!(info.ip, "127.0.0.1");
        assert_eq!(info.port, 13600);
    }

    #[test]
    fn defaults_port_when_absent() {
        let info = ConnInfo::parse(r#"{"name":"node-a","ip":"127.0.0.1"}"#).unwrap();
        assert_eq!(info.port, DEFAULT_PORT);
    }

    #[test]
    fn missing_name_is_an_error() {
        let err = ConnInfo::parse(r#"{"ip":"127.0.0.1"}"#).unwrap_err();
        assert!(matches!(err, CoreError::MissingName));
    }

    #[test]
    fn equality_ignores_key_order_and_whitespace() {
        let a = ConnInfo::parse(r#"{"name":"node-a","ip":"10.0.0.1","port":9000}"#).unwrap();
        let b = ConnInfo::parse(r#"{  "port" : 9000, "ip":"10.0.0.1",  "name":"node-a" }"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn equality_byte_compares_normalized_form_not_fields() {
        let a = ConnInfo::new("node-a", "10.0.0.1", Some(9000));
        let b = ConnInfo::new("node-a", "10.0.0.1", None);
        assert_ne!(a.port, b.port);
        assert_ne!(a, b);
    }

    #[test]
    fn normalized_has_sorted_keys_and_no_whitespace() {
        let info = ConnInfo::new("node-a", "127.0.0.1", Some(13600));
        assert_eq!(
            info.normalized(),
            r#"{"ip":"127.0.0.1","name":"node-a","port":13600}"#
        );
    }
}
