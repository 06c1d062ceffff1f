//! Credentials for the Jenkins remote API.
//!
//! Jenkins accepts an API token (sent as the `token` query parameter, used for
//! remote build triggers) and/or a username/password pair (HTTP Basic Auth).
//! Credentials discovered at different levels of the object graph are combined
//! with [`Credentials::merge`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Authentication material for the remote API.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// API/build token.
    #[serde(default)]
    pub token: Option<String>,
    /// Username for HTTP Basic Auth.
    #[serde(default)]
    pub username: Option<String>,
    /// Password or user API token for HTTP Basic Auth.
    #[serde(default)]
    pub password: Option<String>,
}

impl Credentials {
    /// No authentication.
    pub fn none() -> Self {
        Self::default()
    }

    /// Token authentication.
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// HTTP Basic Auth.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    /// Returns true if nothing is configured.
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.username.is_none() && self.password.is_none()
    }

    /// Merges `newer` over `self` field by field.
    ///
    /// Non-null fields of `newer` win. Changing an existing username to a
    /// different one is rejected with [`Error::ConflictingCredentials`].
    pub fn merge(&self, newer: &Credentials) -> Result<Credentials> {
        if let (Some(existing), Some(requested)) = (&self.username, &newer.username) {
            if existing != requested {
                return Err(Error::ConflictingCredentials {
                    existing: existing.clone(),
                    requested: requested.clone(),
                });
            }
        }

        Ok(Credentials {
            token: newer.token.clone().or_else(|| self.token.clone()),
            username: newer.username.clone().or_else(|| self.username.clone()),
            password: newer.password.clone().or_else(|| self.password.clone()),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Credentials")
            .field("token", &redact(&self.token))
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_newer_fields() {
        let base = Credentials::basic("alice", "old");
        let newer = Credentials {
            password: Some("new".to_string()),
            token: Some("t0k".to_string()),
            username: None,
        };

        let merged = base.merge(&newer).unwrap();

        assert_eq!(merged.username.as_deref(), Some("alice"));
        assert_eq!(merged.password.as_deref(), Some("new"));
        assert_eq!(merged.token.as_deref(), Some("t0k"));
    }

    #[test]
    fn merge_keeps_existing_when_newer_is_empty() {
        let base = Credentials::token("abc");
        let merged = base.merge(&Credentials::none()).unwrap();
        assert_eq!(merged, base);
    }

    #[test]
    fn merge_rejects_username_change() {
        let base = Credentials::basic("alice", "pw");
        let err = base.merge(&Credentials::basic("bob", "pw")).unwrap_err();
        assert!(matches!(
            err,
            Error::ConflictingCredentials { ref existing, ref requested }
                if existing == "alice" && requested == "bob"
        ));
    }

    #[test]
    fn merge_accepts_same_username() {
        let base = Credentials::basic("alice", "pw");
        assert!(base.merge(&Credentials::basic("alice", "pw2")).is_ok());
    }

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials {
            token: Some("super-secret-token".to_string()),
            username: Some("alice".to_string()),
            password: Some("hunter2".to_string()),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("hunter2"));
    }
}
