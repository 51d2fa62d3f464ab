//! Authentication of the INIT/HELLO auth token.
//!
//! Credentials are checked against SHA-256 hashes of
//! `principal:credentials` stored in configuration, so plaintext secrets
//! never live on the server.

use crate::config::AuthConfig;
use graphwire_protocol::{Value, ValueMap};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Authenticated identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub scheme: String,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            name: String::new(),
            scheme: AuthScheme::NONE.to_string(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// Auth token keys and schemes.
pub struct AuthScheme;

impl AuthScheme {
    pub const SCHEME: &'static str = "scheme";
    pub const PRINCIPAL: &'static str = "principal";
    pub const CREDENTIALS: &'static str = "credentials";

    pub const NONE: &'static str = "none";
    pub const BASIC: &'static str = "basic";
}

/// Authentication failures. The message is sent to the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unsupported authentication scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("auth token is missing '{0}'")]
    MissingField(&'static str),

    #[error("the client is unauthorized due to authentication failure")]
    InvalidCredentials,

    #[error("authentication is required")]
    Required,
}

/// Checks an auth token and resolves the principal.
///
/// Called once per connection, after INIT/HELLO decoding.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &ValueMap) -> Result<Principal, AuthError>;
}

/// Validates `basic` credentials against pre-configured hashes.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    /// SHA-256 hex strings of `principal:credentials`.
    valid_hashes: HashSet<String>,
    required: bool,
}

impl TokenAuthenticator {
    pub fn new(hashes: impl IntoIterator<Item = String>, required: bool) -> Self {
        Self {
            valid_hashes: hashes
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
            required,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.credential_hashes.iter().cloned(), config.required)
    }

    /// Accepts every token, including `none`.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), false)
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Returns the number of configured credentials.
    pub fn credential_count(&self) -> usize {
        self.valid_hashes.len()
    }

    /// Hashes a principal/credentials pair using SHA-256, returning a
    /// lowercase hex string.
    pub fn hash_credentials(principal: &str, credentials: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(principal.as_bytes());
        hasher.update(b":");
        hasher.update(credentials.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn field<'a>(token: &'a ValueMap, key: &'static str) -> Result<&'a str, AuthError> {
        token
            .get(key)
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingField(key))
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &ValueMap) -> Result<Principal, AuthError> {
        let scheme = match token.get(AuthScheme::SCHEME) {
            None | Some(Value::Null) => AuthScheme::NONE,
            Some(value) => value
                .as_str()
                .ok_or(AuthError::MissingField(AuthScheme::SCHEME))?,
        };

        match scheme {
            AuthScheme::NONE if self.required => Err(AuthError::Required),
            AuthScheme::NONE => Ok(Principal::anonymous()),
            AuthScheme::BASIC => {
                let principal = Self::field(token, AuthScheme::PRINCIPAL)?;
                let credentials = Self::field(token, AuthScheme::CREDENTIALS)?;

                // With nothing configured and auth optional, any identity is taken at its word.
                let open = !self.required && self.valid_hashes.is_empty();
                if open
                    || self
                        .valid_hashes
                        .contains(&Self::hash_credentials(principal, credentials))
                {
                    Ok(Principal {
                        name: principal.to_string(),
                        scheme: AuthScheme::BASIC.to_string(),
                    })
                } else {
                    Err(AuthError::InvalidCredentials)
                }
            }
            other => Err(AuthError::UnsupportedScheme(other.to_string())),
        }
    }
}
