use serde::{Deserialize, Serialize};

use latchkey_core::AuthResult;

use crate::model::{USER_SOURCE_OIDC, User};
use crate::validate::validate_entity_id;

/// Verified identity handed over by an external login flow.
///
/// Signature and issuer checks happened upstream; nothing here re-verifies
/// them. Only the shape of the attributes is checked before a user is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Stable subject, used as the username.
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Provenance recorded on users created from these claims.
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    USER_SOURCE_OIDC.to_string()
}

impl IdentityClaims {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: None,
            friendly_name: None,
            source: default_source(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = Some(name.into());
        self
    }

    /// The user to create when these claims are seen for the first time.
    pub fn to_user(&self) -> AuthResult<User> {
        validate_entity_id("username", &self.username)?;
        let mut user = User::new(self.username.clone()).with_source(self.source.clone());
        user.email = self.email.clone();
        user.friendly_name = self.friendly_name.clone();
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_core::AuthError;

    #[test]
    fn derived_user_carries_claim_attributes() {
        let claims = IdentityClaims::new("alice")
            .with_email("alice@example.com")
            .with_friendly_name("Alice");
        let user = claims.to_user().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.email.as_deref(), Some("alice@example.com"));
        assert_eq!(user.friendly_name.as_deref(), Some("Alice"));
        assert_eq!(user.source, USER_SOURCE_OIDC);
    }

    #[test]
    fn source_defaults_when_absent() {
        let claims: IdentityClaims = serde_json::from_str(r#"{"username":"bob"}"#).unwrap();
        assert_eq!(claims.source, USER_SOURCE_OIDC);
    }

    #[test]
    fn malformed_subject_is_rejected() {
        let err = IdentityClaims::new("not a name").to_user().unwrap_err();
        assert!(matches!(err, AuthError::Validation { field: "username", .. }));
    }
}
