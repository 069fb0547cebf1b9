use std::collections::HashMap;
use std::fmt;

use captura_core::AuthenticationError;

/// Login material for one portal account.
#[derive(Clone, PartialEq, Eq)]
pub struct PortalSecret {
    pub login: String,
    pub password: String,
}

impl PortalSecret {
    /// Parse the `login:password` form. The password may itself contain `:`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (login, password) = raw.split_once(':')?;
        if login.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            login: login.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for PortalSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalSecret")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Turns a credential's opaque `secret_ref` into login material.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, secret_ref: &str) -> Result<PortalSecret, AuthenticationError>;
}

/// Resolves `env:NAME` references from the process environment. The
/// variable holds `login:password`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, secret_ref: &str) -> Result<PortalSecret, AuthenticationError> {
        let name = secret_ref.strip_prefix("env:").ok_or_else(|| {
            AuthenticationError::SecretUnavailable(format!(
                "unsupported secret reference scheme: {secret_ref}"
            ))
        })?;
        let raw = std::env::var(name).map_err(|_| {
            AuthenticationError::SecretUnavailable(format!("environment variable {name} not set"))
        })?;
        PortalSecret::parse(&raw).ok_or_else(|| {
            AuthenticationError::SecretUnavailable(format!(
                "environment variable {name} is not in login:password form"
            ))
        })
    }
}

/// Fixed map of references to secrets.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, PortalSecret>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, secret_ref: impl Into<String>, secret: PortalSecret) -> Self {
        self.secrets.insert(secret_ref.into(), secret);
        self
    }
}

impl SecretResolver for StaticSecretResolver {
    fn resolve(&self, secret_ref: &str) -> Result<PortalSecret, AuthenticationError> {
        self.secrets.get(secret_ref).cloned().ok_or_else(|| {
            AuthenticationError::SecretUnavailable(format!("no secret for {secret_ref}"))
        })
    }
}
