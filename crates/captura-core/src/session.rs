use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::credential::{InstanceLevel, TribunalCode};

/// Opaque handle to an authenticated portal session.
///
/// Not `Clone`: a session is acquired once and handed back to its
/// authenticator for release exactly once.
pub struct Session {
    id: String,
    tribunal: TribunalCode,
    instance: InstanceLevel,
    token: String,
    api_url: String,
    logout_url: Option<String>,
    portal_user_id: Option<String>,
    api_timeout: Option<Duration>,
    opened_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        tribunal: TribunalCode,
        instance: InstanceLevel,
        token: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tribunal,
            instance,
            token: token.into(),
            api_url: api_url.into(),
            logout_url: None,
            portal_user_id: None,
            api_timeout: None,
            opened_at: Utc::now(),
        }
    }

    pub fn with_logout_url(mut self, url: impl Into<String>) -> Self {
        self.logout_url = Some(url.into());
        self
    }

    /// Id of the logged-in advogado as the portal knows it.
    pub fn with_portal_user_id(mut self, id: impl Into<String>) -> Self {
        self.portal_user_id = Some(id.into());
        self
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tribunal(&self) -> &TribunalCode {
        &self.tribunal
    }

    pub fn instance(&self) -> InstanceLevel {
        self.instance
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn logout_url(&self) -> Option<&str> {
        self.logout_url.as_deref()
    }

    pub fn portal_user_id(&self) -> Option<&str> {
        self.portal_user_id.as_deref()
    }

    pub fn api_timeout(&self) -> Option<Duration> {
        self.api_timeout
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tribunal", &self.tribunal)
            .field("instance", &self.instance)
            .field("token", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("portal_user_id", &self.portal_user_id)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}
