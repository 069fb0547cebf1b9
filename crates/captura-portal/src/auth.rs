//! Portal login and logout.
//!
//! Login is two steps: credentials are posted to the portal's login URL for
//! an access token, then the advogado id is read back from the API. If the
//! second step fails (or the whole future is dropped by a timeout) the
//! half-open session is logged out by [`LogoutGuard`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use captura_core::ports::SessionAuthenticator;
use captura_core::{AuthenticationError, Credential, Session, TribunalConfig};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::PortalError;
use crate::secret::SecretResolver;

#[derive(Serialize)]
struct LoginRequest<'a> {
    login: &'a str,
    senha: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// [`SessionAuthenticator`] for JSON login portals.
pub struct PortalAuthenticator {
    client: reqwest::Client,
    secrets: Arc<dyn SecretResolver>,
}

impl PortalAuthenticator {
    pub fn new(secrets: Arc<dyn SecretResolver>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secrets,
        }
    }

    pub fn with_client(client: reqwest::Client, secrets: Arc<dyn SecretResolver>) -> Self {
        Self { client, secrets }
    }

    async fn login(
        &self,
        credential: &Credential,
        config: &TribunalConfig,
        timeout: Option<Duration>,
    ) -> Result<LoginResponse, AuthenticationError> {
        let secret = self.secrets.resolve(&credential.secret_ref)?;
        let mut request = self.client.post(&config.login_url).json(&LoginRequest {
            login: &secret.login,
            senha: &secret.password,
        });
        if let Some(t) = timeout {
            request = request.timeout(t);
        }

        debug!(url = %config.login_url, credential_id = credential.id, "portal login");
        let resp = request
            .send()
            .await
            .map_err(|e| transport_error(PortalError::Http(e), timeout))?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthenticationError::InvalidCredential(format!(
                "portal rejected login for credential {} ({status})",
                credential.id
            )));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(AuthenticationError::PortalChanged(format!(
                "login endpoint {} not found",
                config.login_url
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(transport_error(
                PortalError::Server {
                    status: status.as_u16(),
                    body,
                },
                timeout,
            ));
        }
        resp.json::<LoginResponse>().await.map_err(|e| {
            AuthenticationError::PortalChanged(format!("unreadable login response: {e}"))
        })
    }

    async fn advogado_id(
        &self,
        config: &TribunalConfig,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<String, AuthenticationError> {
        let url = format!("{}/advogado", config.api_url.trim_end_matches('/'));
        let mut request = self.client.get(&url).bearer_auth(token);
        if let Some(t) = timeout {
            request = request.timeout(t);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| transport_error(PortalError::Http(e), timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AuthenticationError::PortalChanged(format!(
                "advogado lookup returned {status}"
            )));
        }
        let body: Value = resp.json().await.map_err(|e| {
            AuthenticationError::PortalChanged(format!("unreadable advogado response: {e}"))
        })?;
        match body.get("idAdvogado") {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(AuthenticationError::PortalChanged(
                "advogado id missing from portal response".into(),
            )),
        }
    }
}

#[async_trait]
impl SessionAuthenticator for PortalAuthenticator {
    async fn authenticate(
        &self,
        credential: &Credential,
        config: &TribunalConfig,
    ) -> Result<Session, AuthenticationError> {
        let login_timeout = config.custom_timeouts.login_ms.map(Duration::from_millis);
        let login = self.login(credential, config, login_timeout).await?;
        let token = login
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AuthenticationError::PortalChanged("login response carries no access_token".into())
            })?;

        let logout_url = format!("{}/logout", config.base_url.trim_end_matches('/'));
        let guard = LogoutGuard::new(self.client.clone(), logout_url.clone(), token.clone());
        let portal_user_id = self.advogado_id(config, &token, login_timeout).await?;
        guard.disarm();

        let session_id = login
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        info!(
            credential_id = credential.id,
            tribunal = %config.tribunal,
            instance = %config.instance,
            "portal session opened"
        );
        let mut session = Session::new(
            session_id,
            config.tribunal.clone(),
            config.instance,
            token,
            config.api_url.trim_end_matches('/'),
        )
        .with_logout_url(logout_url)
        .with_portal_user_id(portal_user_id);
        if let Some(ms) = config.custom_timeouts.api_ms {
            session = session.with_api_timeout(Duration::from_millis(ms));
        }
        Ok(session)
    }

    async fn close(&self, session: Session) {
        let Some(url) = session.logout_url() else {
            return;
        };
        match logout(&self.client, url, session.token()).await {
            Ok(()) => debug!(session = session.id(), tribunal = %session.tribunal(), "portal session closed"),
            Err(e) => warn!(
                session = session.id(),
                tribunal = %session.tribunal(),
                error = %e,
                "portal logout failed"
            ),
        }
    }
}

async fn logout(client: &reqwest::Client, url: &str, token: &str) -> Result<(), PortalError> {
    let resp = client.post(url).bearer_auth(token).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(PortalError::Server {
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}

fn transport_error(e: PortalError, timeout: Option<Duration>) -> AuthenticationError {
    match timeout {
        Some(t) if e.is_timeout() => AuthenticationError::Timeout(t.as_millis() as u64),
        _ => AuthenticationError::Transport(e.to_string()),
    }
}

/// Logs a half-open session out when dropped while still armed.
struct LogoutGuard {
    pending: Option<(reqwest::Client, String, String)>,
}

impl LogoutGuard {
    fn new(client: reqwest::Client, url: String, token: String) -> Self {
        Self {
            pending: Some((client, url, token)),
        }
    }

    fn disarm(mut self) {
        self.pending = None;
    }
}

impl Drop for LogoutGuard {
    fn drop(&mut self) {
        let Some((client, url, token)) = self.pending.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match logout(&client, &url, &token).await {
                        Ok(()) => debug!(url = %url, "released half-open portal session"),
                        Err(e) => warn!(url = %url, error = %e, "failed to release half-open portal session"),
                    }
                });
            }
            Err(_) => warn!(url = %url, "no runtime to release half-open portal session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::{PortalSecret, StaticSecretResolver};
    use captura_core::{CustomTimeouts, InstanceLevel};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> Credential {
        Credential {
            id: 5,
            advogado_id: 1,
            tribunal: "TRT2".parse().unwrap(),
            instance: InstanceLevel::PrimeiroGrau,
            secret_ref: "trt2".into(),
        }
    }

    fn config(server: &MockServer) -> TribunalConfig {
        TribunalConfig {
            tribunal: "TRT2".parse().unwrap(),
            instance: InstanceLevel::PrimeiroGrau,
            system: "PJE".into(),
            base_url: server.uri(),
            login_url: format!("{}/login", server.uri()),
            api_url: format!("{}/api", server.uri()),
            custom_timeouts: CustomTimeouts::default(),
        }
    }

    fn authenticator() -> PortalAuthenticator {
        let secrets =
            StaticSecretResolver::new().with("trt2", PortalSecret::parse("user:pw").unwrap());
        PortalAuthenticator::new(Arc::new(secrets))
    }

    async fn logout_calls(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/logout")
            .count()
    }

    #[tokio::test]
    async fn login_then_close_logs_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/advogado"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"idAdvogado": 42})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/logout"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let auth = authenticator();
        let session = auth.authenticate(&credential(), &config(&server)).await.unwrap();
        assert_eq!(session.token(), "tok");
        assert_eq!(session.portal_user_id(), Some("42"));
        assert_eq!(session.api_url(), format!("{}/api", server.uri()));
        auth.close(session).await;
    }

    #[tokio::test]
    async fn rejected_login_is_invalid_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = authenticator()
            .authenticate(&credential(), &config(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::InvalidCredential(_)));
        assert_eq!(logout_calls(&server).await, 0);
    }

    #[tokio::test]
    async fn missing_token_means_portal_changed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let err = authenticator()
            .authenticate(&credential(), &config(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::PortalChanged(_)));
    }

    #[tokio::test]
    async fn failure_after_login_releases_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/advogado"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/logout"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let err = authenticator()
            .authenticate(&credential(), &config(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::PortalChanged(_)));

        // The logout runs on a spawned task.
        let mut released = 0;
        for _ in 0..100 {
            released = logout_calls(&server).await;
            if released > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn slow_login_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "tok"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let mut cfg = config(&server);
        cfg.custom_timeouts.login_ms = Some(50);
        let err = authenticator()
            .authenticate(&credential(), &cfg)
            .await
            .unwrap_err();
        assert_eq!(err, AuthenticationError::Timeout(50));
    }

    #[tokio::test]
    async fn unknown_secret_fails_before_any_request() {
        let server = MockServer::start().await;
        let mut cred = credential();
        cred.secret_ref = "missing".into();
        let err = authenticator()
            .authenticate(&cred, &config(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::SecretUnavailable(_)));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }
}
