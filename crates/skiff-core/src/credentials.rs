//! Credential lookup for password authentication
//!
//! A credential source is queried once per attempt. An empty string is a
//! valid answer and means key or agent authentication.

use std::collections::HashMap;

use zeroize::Zeroizing;

use crate::config::Endpoint;
use crate::error::{Result, SessionError};

/// Environment variable read by [`EnvCredentials::default`]
pub const PASSWORD_ENV_VAR: &str = "SKIFF_PASSWORD";

/// Supplies the secret for an endpoint
pub trait CredentialSource: Send + Sync {
    /// Plaintext secret for `endpoint`, or an empty string
    fn credential(&self, endpoint: &Endpoint) -> Result<String>;
}

/// No password: always key or agent authentication
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn credential(&self, _endpoint: &Endpoint) -> Result<String> {
        Ok(String::new())
    }
}

/// Fixed secrets keyed by `user@host`, with an optional fallback
#[derive(Default)]
pub struct StaticCredentials {
    by_endpoint: HashMap<String, Zeroizing<String>>,
    fallback: Option<Zeroizing<String>>,
}

impl StaticCredentials {
    /// Create an empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Secret for one `user@host`
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &Endpoint, secret: impl Into<String>) -> Self {
        self.by_endpoint
            .insert(endpoint_key(endpoint), Zeroizing::new(secret.into()));
        self
    }

    /// Secret used for any other endpoint
    #[must_use]
    pub fn with_fallback(mut self, secret: impl Into<String>) -> Self {
        self.fallback = Some(Zeroizing::new(secret.into()));
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn credential(&self, endpoint: &Endpoint) -> Result<String> {
        let secret = self
            .by_endpoint
            .get(&endpoint_key(endpoint))
            .or(self.fallback.as_ref());
        Ok(secret.map(|s| s.to_string()).unwrap_or_default())
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("endpoints", &self.by_endpoint.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Secret read from an environment variable at lookup time
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    /// Read from `var`
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(PASSWORD_ENV_VAR)
    }
}

impl CredentialSource for EnvCredentials {
    fn credential(&self, _endpoint: &Endpoint) -> Result<String> {
        match std::env::var(&self.var) {
            Ok(secret) => Ok(secret),
            Err(std::env::VarError::NotPresent) => Ok(String::new()),
            Err(std::env::VarError::NotUnicode(_)) => Err(SessionError::Credential(
                format!("{} is not valid UTF-8", self.var).into(),
            )),
        }
    }
}

fn endpoint_key(endpoint: &Endpoint) -> String {
    format!("{}@{}", endpoint.username, endpoint.host)
}
