//! Credential store
//!
//! File-backed mapping from username to secret, optionally restricted to
//! a set of allowed forwarding targets. One line per user:
//!
//! ```text
//! username:secret[:allowed,allowed,...]
//! ```
//!
//! Each allowed entry matches a spec's target as `host:port`, with `*`
//! matching any host or any port, and an `R:` prefix matching reverse
//! rules. A user without an allowed list may request any spec. Blank
//! lines and `#` comments are ignored.
//!
//! The store is read-only for the lifetime of a session and may be
//! shared across sessions; it is reloaded only by restarting the server.

use crate::forward::ForwardSpec;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Credential store errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Failed to read credential store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed credential line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Pattern restricting which targets a user may forward to
#[derive(Debug, Clone, PartialEq, Eq)]
struct SpecPattern {
    reverse: bool,
    host: String,
    port: Option<u16>,
}

impl SpecPattern {
    fn parse(raw: &str, line: usize) -> Result<Self, AuthError> {
        let (reverse, rest) = match raw.strip_prefix("R:") {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let (host, port) = rest.rsplit_once(':').ok_or_else(|| AuthError::Malformed {
            line,
            reason: format!("allowed entry '{}' is not host:port", raw),
        })?;
        if host.is_empty() {
            return Err(AuthError::Malformed {
                line,
                reason: format!("allowed entry '{}' has an empty host", raw),
            });
        }

        let port = match port {
            "*" => None,
            p => Some(p.parse::<u16>().map_err(|_| AuthError::Malformed {
                line,
                reason: format!("allowed entry '{}' has an invalid port", raw),
            })?),
        };

        Ok(SpecPattern {
            reverse,
            host: host.to_string(),
            port,
        })
    }

    fn matches(&self, spec: &ForwardSpec) -> bool {
        self.reverse == spec.reverse
            && (self.host == "*" || self.host == spec.target_host)
            && self.port.map_or(true, |p| p == spec.target_port)
    }
}

struct UserEntry {
    secret: String,
    /// Empty means every spec is permitted
    allowed: Vec<SpecPattern>,
}

/// File-backed username/secret store with per-user forwarding limits
pub struct CredentialStore {
    users: HashMap<String, UserEntry>,
}

impl CredentialStore {
    /// An empty store; rejects every credential
    pub fn empty() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    /// Load a store from its file form
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse the line-oriented store format
    pub fn parse(content: &str) -> Result<Self, AuthError> {
        let mut users = HashMap::new();

        for (idx, raw_line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (username, rest) = line.split_once(':').ok_or_else(|| AuthError::Malformed {
                line: line_no,
                reason: "expected username:secret".to_string(),
            })?;
            let (secret, allowed_list) = match rest.split_once(':') {
                Some((secret, allowed)) => (secret, Some(allowed)),
                None => (rest, None),
            };
            if username.is_empty() || secret.is_empty() {
                return Err(AuthError::Malformed {
                    line: line_no,
                    reason: "empty username or secret".to_string(),
                });
            }

            let mut allowed = Vec::new();
            if let Some(list) = allowed_list {
                for raw in list.split(',') {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        continue;
                    }
                    allowed.push(SpecPattern::parse(raw, line_no)?);
                }
            }

            users.insert(
                username.to_string(),
                UserEntry {
                    secret: secret.to_string(),
                    allowed,
                },
            );
        }

        Ok(Self { users })
    }

    /// Check a presented credential
    pub fn validate(&self, username: &str, secret: &str) -> bool {
        self.users
            .get(username)
            .map_or(false, |entry| entry.secret == secret)
    }

    /// Check whether a validated user may activate `spec`
    pub fn authorize(&self, username: &str, spec: &ForwardSpec) -> bool {
        match self.users.get(username) {
            Some(entry) => {
                entry.allowed.is_empty() || entry.allowed.iter().any(|p| p.matches(spec))
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORE: &str = "\
# test users
alice:wonderland
bob:builder:files.internal:3000,R:127.0.0.1:22

carol:s3cret:*:443
";

    fn spec(raw: &str) -> ForwardSpec {
        raw.parse().unwrap()
    }

    #[test]
    fn test_parse_store() {
        let store = CredentialStore::parse(STORE).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_validate() {
        let store = CredentialStore::parse(STORE).unwrap();
        assert!(store.validate("alice", "wonderland"));
        assert!(!store.validate("alice", "wrong"));
        assert!(!store.validate("mallory", "wonderland"));
    }

    #[test]
    fn test_authorize_unrestricted_user() {
        let store = CredentialStore::parse(STORE).unwrap();
        assert!(store.authorize("alice", &spec("2001:anything.example:9999")));
        assert!(store.authorize("alice", &spec("R:9000:127.0.0.1:22")));
    }

    #[test]
    fn test_authorize_restricted_user() {
        let store = CredentialStore::parse(STORE).unwrap();
        assert!(store.authorize("bob", &spec("2001:files.internal:3000")));
        assert!(!store.authorize("bob", &spec("2001:files.internal:3001")));
        assert!(!store.authorize("bob", &spec("2001:other.internal:3000")));

        // Direction is part of the pattern
        assert!(store.authorize("bob", &spec("R:9000:127.0.0.1:22")));
        assert!(!store.authorize("bob", &spec("2001:127.0.0.1:22")));

        // Unknown users are never authorized
        assert!(!store.authorize("mallory", &spec("2001:3000")));
    }

    #[test]
    fn test_wildcard_host() {
        let store = CredentialStore::parse(STORE).unwrap();
        assert!(store.authorize("carol", &spec("2001:any.host:443")));
        assert!(!store.authorize("carol", &spec("2001:any.host:80")));
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(CredentialStore::parse("justausername").is_err());
        assert!(CredentialStore::parse("user:").is_err());
        assert!(CredentialStore::parse("user:pass:noport").is_err());
        assert!(CredentialStore::parse("user:pass:host:badport").is_err());
    }

    #[test]
    fn test_empty_store_rejects_all() {
        let store = CredentialStore::empty();
        assert!(!store.validate("alice", "wonderland"));
        assert!(!store.authorize("alice", &spec("2001:3000")));
    }
}
