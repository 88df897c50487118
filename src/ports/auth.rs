use async_trait::async_trait;
use http::HeaderMap;

use crate::core::error::GatewayError;

/// Caller identity established by an [`Authenticator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub scopes: Vec<String>,
}

impl Identity {
    /// True when `allowed` is empty or shares at least one scope with this identity.
    pub fn has_any_scope(&self, allowed: &[String]) -> bool {
        allowed.is_empty() || allowed.iter().any(|scope| self.scopes.contains(scope))
    }
}

/// Authentication collaborator consulted for routes that require it.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Establish the caller's identity from the request headers, or fail with
    /// [`GatewayError::AuthenticationDenied`].
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, GatewayError>;
}
