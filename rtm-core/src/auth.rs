//! Role-secret authentication.
//!
//! The scheme is a two-step HMAC handshake: the client sends
//! `auth/handshake` naming its role, the server answers with a `nonce`, and
//! the client proves possession of the role secret by replying with
//! `auth/authenticate` carrying `base64(HMAC-MD5(secret, nonce))`.
//!
//! The connection drives the exchange; a delegate only supplies the
//! method-specific pieces, so custom schemes can be plugged in by
//! implementing [`AuthDelegate`].

use base64::{engine::general_purpose, Engine};
use hmac::{Hmac, Mac};
use md5::Md5;
use serde_json::{json, Value};
use thiserror::Error;

/// Method name of the built-in role/secret scheme.
pub const ROLE_SECRET_METHOD: &str = "role_secret";

/// `base64(HMAC-MD5(secret, nonce))`, the credential hash of the
/// role-secret scheme.
pub fn role_secret_hash(secret: &[u8], nonce: &[u8]) -> String {
    // HMAC accepts keys of any length, so construction cannot fail
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(secret).expect("any key length is valid");
    mac.update(nonce);
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Authentication failures, surfaced through the auth callback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Only one auth flow may be in progress per connection
    #[error("authentication is already in progress")]
    AlreadyInProgress,

    /// The handshake reply carried no usable nonce
    #[error("no nonce in handshake reply")]
    MissingNonce,

    /// The server rejected the handshake or the credentials
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// No reply arrived within the allotted time
    #[error("authentication timed out")]
    TimedOut,
}

/// Terminal outcome of one authentication flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Done,
    Error(AuthError),
}

/// A capability that produces the method-specific parts of an auth flow.
///
/// Successful delegates are retained by the client so authentication can be
/// silently replayed after a reconnect.
pub trait AuthDelegate: Send + Sync {
    /// Method name sent in both the handshake and the authenticate PDUs.
    fn method(&self) -> &str;

    /// The `data` object of the `auth/handshake` request body.
    fn handshake_data(&self) -> Value;

    /// Credentials derived from the handshake reply's `data` object.
    fn credentials(&self, handshake_data: &Value) -> Result<Value, AuthError>;
}

/// The built-in role/secret delegate.
pub struct RoleSecretAuthDelegate {
    role: String,
    secret: Vec<u8>,
}

impl RoleSecretAuthDelegate {
    pub fn new(role: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self { role: role.into(), secret: secret.into() }
    }
}

impl AuthDelegate for RoleSecretAuthDelegate {
    fn method(&self) -> &str {
        ROLE_SECRET_METHOD
    }

    fn handshake_data(&self) -> Value {
        json!({ "role": self.role })
    }

    fn credentials(&self, handshake_data: &Value) -> Result<Value, AuthError> {
        let nonce = handshake_data
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingNonce)?;
        Ok(json!({ "hash": role_secret_hash(&self.secret, nonce.as_bytes()) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_the_fixed_vector() {
        assert_eq!(role_secret_hash(b"sekret", b"n0nce"), "SJoKafBz8fMIA8t8OWYAXw==");
    }

    #[test]
    fn role_secret_delegate_builds_credentials() {
        let delegate = RoleSecretAuthDelegate::new("superuser", "sekret");
        assert_eq!(delegate.method(), "role_secret");
        assert_eq!(delegate.handshake_data(), json!({"role": "superuser"}));

        let creds = delegate.credentials(&json!({"nonce": "n0nce"})).unwrap();
        assert_eq!(creds, json!({"hash": "SJoKafBz8fMIA8t8OWYAXw=="}));
    }

    #[test]
    fn missing_nonce_is_an_error() {
        let delegate = RoleSecretAuthDelegate::new("role", "secret");
        assert_eq!(
            delegate.credentials(&json!({"data": {}})).unwrap_err(),
            AuthError::MissingNonce
        );
    }
}
