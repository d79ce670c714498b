//! Subscriber entity

use serde::{Deserialize, Serialize};

/// Credentials of a user allowed to register
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Subscriber {
    pub username: String,
    pub domain: String,
    /// Plaintext password, only used when no HA1 is stored
    pub password: Option<String>,
    pub ha1: Option<String>, // MD5(username:realm:password)
    pub enabled: bool,
}

impl Subscriber {
    pub fn new(username: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            password: None,
            ha1: None,
            enabled: true,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_ha1(mut self, ha1: impl Into<String>) -> Self {
        self.ha1 = Some(ha1.into());
        self
    }

    /// Get SIP URI
    pub fn sip_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// Stored HA1, or one derived from the plaintext password for `realm`
    pub fn ha1_for_realm(&self, realm: &str) -> Option<String> {
        match (&self.ha1, &self.password) {
            (Some(ha1), _) => Some(ha1.to_ascii_lowercase()),
            (None, Some(password)) => Some(format!(
                "{:x}",
                md5::compute(format!("{}:{}:{}", self.username, realm, password))
            )),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ha1_prefers_stored_value() {
        let subscriber = Subscriber::new("alice", "example.com")
            .with_password("secret")
            .with_ha1("ABCDEF");
        assert_eq!(subscriber.ha1_for_realm("example.com").as_deref(), Some("abcdef"));
    }

    #[test]
    fn test_ha1_derived_from_password() {
        let subscriber = Subscriber::new("alice", "example.com").with_password("secret");
        let expected = format!("{:x}", md5::compute("alice:example.com:secret"));
        assert_eq!(subscriber.ha1_for_realm("example.com"), Some(expected));
        assert_eq!(Subscriber::new("bob", "example.com").ha1_for_realm("example.com"), None);
    }
}
