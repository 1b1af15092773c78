//! The declarative configuration schema (spec §3, §6): a named routing
//! unit (`Rule`) binding a set of listening ports to a pool of upstream
//! targets, and the `Config` that collects all rules into the desired
//! total state.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// A named routing unit: `key` is the stable identity used by the differ;
/// `ports` are the listening ports sharing `targets`, the upstream pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub key: String,
    pub ports: BTreeSet<u16>,
    pub targets: BTreeSet<String>,
}

impl Rule {
    /// A rule with no ports or targets yet, identified by `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Rule {
            key: key.into(),
            ports: BTreeSet::new(),
            targets: BTreeSet::new(),
        }
    }
}

/// The desired total state: an unordered collection of rules. Equality is
/// key-set, per-key port-set, per-key target-set equality (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub rules: Vec<Rule>,
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        let mut a: Vec<&Rule> = self.rules.iter().collect();
        let mut b: Vec<&Rule> = other.rules.iter().collect();
        a.sort_by(|x, y| x.key.cmp(&y.key));
        b.sort_by(|x, y| x.key.cmp(&y.key));
        a == b
    }
}

impl Config {
    /// Rule invariants on ingest (spec §6): non-empty, unique keys; ports in
    /// `1..=65535` and bound to at most one rule; targets parseable as
    /// `host:port`. Violations are reported naming the offending field; the
    /// whole config is rejected on the first violation found (no partial
    /// apply).
    pub fn validate(&self) -> Result<(), ProxyError> {
        let mut seen_keys = HashSet::new();
        let mut seen_ports: HashSet<u16> = HashSet::new();

        for rule in &self.rules {
            if rule.key.is_empty() {
                return Err(ProxyError::VerificationError {
                    field: "key",
                    message: "rule key must not be empty".into(),
                });
            }
            if !seen_keys.insert(rule.key.as_str()) {
                return Err(ProxyError::VerificationError {
                    field: "key",
                    message: format!("duplicate rule key `{}`", rule.key),
                });
            }
            for &port in &rule.ports {
                if port == 0 {
                    return Err(ProxyError::VerificationError {
                        field: "ports",
                        message: format!("port out of range in rule `{}`: {port}", rule.key),
                    });
                }
                if !seen_ports.insert(port) {
                    return Err(ProxyError::VerificationError {
                        field: "ports",
                        message: format!("port {port} is bound by more than one rule"),
                    });
                }
            }
            for target in &rule.targets {
                if parse_host_port(target).is_none() {
                    return Err(ProxyError::VerificationError {
                        field: "targets",
                        message: format!("not a valid host:port in rule `{}`: {target}", rule.key),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Minimal `host:port` syntax check: exactly one `:` with a non-empty host
/// and a numeric port. Good enough for config ingest; the actual dial (via
/// `ToSocketAddrs`) does real resolution.
fn parse_host_port(s: &str) -> Option<(&str, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host, port))
}
