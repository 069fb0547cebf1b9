//! HTTP integration with court portals: authenticated sessions and the
//! generic API-backed capture performer.

mod auth;
mod error;
mod performer;
mod secret;

pub use auth::PortalAuthenticator;
pub use error::PortalError;
pub use performer::ApiCapturePerformer;
pub use secret::{EnvSecretResolver, PortalSecret, SecretResolver, StaticSecretResolver};
