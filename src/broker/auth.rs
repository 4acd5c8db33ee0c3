use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct AuthDecision {
    pub principal: String,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication rejected: {0}")]
    Rejected(String),
}

/// CONNECT interceptor. One policy for every client; what used to be two
/// hard-coded paths (admin vs anonymous user) is a role in the decision.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        headers: &HashMap<String, String>,
        remote_addr: &str,
    ) -> Result<AuthDecision, AuthError>;
}

/// Shared-token authenticator: a valid `auth` header grants admin; an
/// end-user client without one is accepted as anonymous when the knob
/// allows it.
pub struct TokenAuthenticator {
    admin_token: Option<String>,
    allow_anonymous: bool,
}

impl TokenAuthenticator {
    pub fn new(admin_token: Option<String>, allow_anonymous: bool) -> Self {
        Self {
            admin_token,
            allow_anonymous,
        }
    }

    fn token_is_admin(&self, token: Option<&str>) -> bool {
        match (&self.admin_token, token) {
            (Some(expected), Some(got)) => expected == got,
            _ => false,
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(
        &self,
        headers: &HashMap<String, String>,
        remote_addr: &str,
    ) -> Result<AuthDecision, AuthError> {
        let token = headers.get("auth").map(|s| s.as_str());
        let requested = headers.get("role").map(|s| s.as_str()).unwrap_or("user");

        if self.token_is_admin(token) {
            return Ok(AuthDecision {
                principal: "admin".to_string(),
                role: Role::Admin,
            });
        }

        if requested == "admin" {
            return Err(AuthError::Rejected(
                "admin connection requires a valid token".to_string(),
            ));
        }

        if self.allow_anonymous {
            Ok(AuthDecision {
                principal: remote_addr.to_string(),
                role: Role::Anonymous,
            })
        } else {
            Err(AuthError::Rejected(
                "anonymous connections are disabled".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn valid_token_grants_admin() {
        let auth = TokenAuthenticator::new(Some("s3cret".to_string()), true);
        let decision = auth
            .authenticate(&headers(&[("auth", "s3cret")]), "1.2.3.4")
            .await
            .unwrap();
        assert_eq!(decision.role, Role::Admin);
    }

    #[tokio::test]
    async fn admin_request_without_token_is_rejected() {
        let auth = TokenAuthenticator::new(Some("s3cret".to_string()), true);
        assert!(auth
            .authenticate(&headers(&[("role", "admin"), ("auth", "wrong")]), "1.2.3.4")
            .await
            .is_err());
        assert!(auth
            .authenticate(&headers(&[("role", "admin")]), "1.2.3.4")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn user_without_token_becomes_anonymous_when_allowed() {
        let auth = TokenAuthenticator::new(Some("s3cret".to_string()), true);
        let decision = auth.authenticate(&headers(&[]), "1.2.3.4").await.unwrap();
        assert_eq!(decision.role, Role::Anonymous);
        assert_eq!(decision.principal, "1.2.3.4");
    }

    #[tokio::test]
    async fn anonymous_knob_off_rejects_tokenless_users() {
        let auth = TokenAuthenticator::new(Some("s3cret".to_string()), false);
        assert!(auth.authenticate(&headers(&[]), "1.2.3.4").await.is_err());
    }

    #[tokio::test]
    async fn invalid_user_token_still_degrades_to_anonymous() {
        let auth = TokenAuthenticator::new(Some("s3cret".to_string()), true);
        let decision = auth
            .authenticate(&headers(&[("auth", "stale")]), "1.2.3.4")
            .await
            .unwrap();
        assert_eq!(decision.role, Role::Anonymous);
    }
}
