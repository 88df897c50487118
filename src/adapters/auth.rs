use std::collections::HashMap;

use async_trait::async_trait;
use http::{HeaderMap, header};

use crate::{
    config::{AuthenticationConfig, TokenGrant},
    core::error::GatewayError,
    ports::auth::{Authenticator, Identity},
};

/// Accepts every caller as an anonymous identity with no scopes.
///
/// Routes that list allowed scopes still reject it with 403.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAuthenticator;

#[async_trait]
impl Authenticator for AllowAllAuthenticator {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<Identity, GatewayError> {
        Ok(Identity {
            subject: "anonymous".to_string(),
            scopes: Vec::new(),
        })
    }
}

/// Resolves `Authorization: Bearer <token>` against a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, TokenGrant>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, TokenGrant>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &AuthenticationConfig) -> Self {
        Self::new(config.tokens.clone())
    }

    fn bearer_token(headers: &HeaderMap) -> Result<&str, GatewayError> {
        let value = headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| denied("missing Authorization header"))?
            .to_str()
            .map_err(|_| denied("Authorization header is not valid text"))?;

        let (scheme, token) = value
            .split_once(' ')
            .ok_or_else(|| denied("malformed Authorization header"))?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(denied("unsupported authorization scheme"));
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(denied("empty bearer token"));
        }
        Ok(token)
    }
}

fn denied(reason: &str) -> GatewayError {
    GatewayError::AuthenticationDenied {
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, GatewayError> {
        let token = Self::bearer_token(headers)?;
        let grant = self.tokens.get(token).ok_or_else(|| denied("unknown token"))?;
        tracing::debug!("Authenticated subject {}", grant.subject);
        Ok(Identity {
            subject: grant.subject.clone(),
            scopes: grant.scopes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn authenticator() -> StaticTokenAuthenticator {
        let mut tokens = HashMap::new();
        tokens.insert(
            "s3cret".to_string(),
            TokenGrant {
                subject: "ada".to_string(),
                scopes: vec!["read".to_string()],
            },
        );
        StaticTokenAuthenticator::new(tokens)
    }

    fn headers(authorization: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(authorization));
        headers
    }

    #[tokio::test]
    async fn test_known_token() {
        let identity = authenticator()
            .authenticate(&headers("Bearer s3cret"))
            .await
            .unwrap();
        assert_eq!(identity.subject, "ada");
        assert_eq!(identity.scopes, vec!["read".to_string()]);
    }

    #[tokio::test]
    async fn test_scheme_is_case_insensitive() {
        assert!(
            authenticator()
                .authenticate(&headers("bearer s3cret"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_rejections() {
        let auth = authenticator();
        for value in ["Bearer nope", "Basic s3cret", "Bearer", "Bearer  "] {
            let result = auth.authenticate(&headers(value)).await;
            assert!(
                matches!(result, Err(GatewayError::AuthenticationDenied { .. })),
                "{value} should be denied"
            );
        }
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()).await,
            Err(GatewayError::AuthenticationDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_allow_all() {
        let identity = AllowAllAuthenticator
            .authenticate(&HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(identity.subject, "anonymous");
        assert!(identity.has_any_scope(&[]));
        assert!(!identity.has_any_scope(&["read".to_string()]));
    }
}
