//! Bearer-token validation.
//!
//! Tokens follow the Docker token scheme: the auth service issues a JWT
//! whose `access` claim lists the granted scope set. This module checks
//! signature, expiry, and audience, and translates the claims into an
//! [`Authorization`](super::Authorization).

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{
    insufficient_scope, unauthorized, AuthRequest, Authorization, Authorizer, Scope, ScopeSet,
    UserIdentity,
};
use crate::error::RegistryError;

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User name; `peer:<hostname>` for peers, `scanner` for the security
    /// scanner, empty for anonymous grants.
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: usize,
    pub iat: usize,
    /// Granted scope set, Docker token format.
    pub access: Vec<AccessEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl TokenClaims {
    fn identity(&self) -> UserIdentity {
        if self.sub.is_empty() {
            UserIdentity::Anonymous
        } else if let Some(host) = self.sub.strip_prefix("peer:") {
            UserIdentity::Peer(host.to_string())
        } else if self.sub == "scanner" {
            UserIdentity::Scanner
        } else {
            UserIdentity::Regular(self.sub.clone())
        }
    }

    fn scope_set(&self) -> ScopeSet {
        ScopeSet::new(
            self.access
                .iter()
                .map(|entry| Scope {
                    resource_type: entry.resource_type.clone(),
                    resource_name: entry.name.clone(),
                    actions: entry.actions.clone(),
                })
                .collect(),
        )
    }
}

pub struct JwtAuthorizer {
    secret: String,
    issuer: String,
    enable_anonymous_pull: bool,
}

impl JwtAuthorizer {
    pub fn new(secret: String, issuer: String, enable_anonymous_pull: bool) -> Self {
        Self {
            secret,
            issuer,
            enable_anonymous_pull,
        }
    }

    fn decode_claims(&self, token: &str, audience: &str) -> Result<TokenClaims, RegistryError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[audience]);
        validation.validate_aud = true;

        decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_ref()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| RegistryError::unauthorized(format!("invalid bearer token: {e}")))
    }
}

#[async_trait::async_trait]
impl Authorizer for JwtAuthorizer {
    async fn authorize(&self, request: &AuthRequest) -> Result<Authorization, RegistryError> {
        let header = match &request.authorization_header {
            Some(h) => h.as_str(),
            None => {
                let pull_only = !request.required_scopes.is_empty()
                    && request.required_scopes.iter().all(|s| {
                        s.resource_type == "repository"
                            && s.actions.iter().all(|a| a == "pull")
                    });
                if self.enable_anonymous_pull
                    && pull_only
                    && !request.flags.no_implicit_anonymous
                {
                    return Ok(Authorization {
                        user: UserIdentity::Anonymous,
                        scopes: ScopeSet::new(request.required_scopes.clone()),
                        audience: request.service_host.clone(),
                    });
                }
                return Err(unauthorized(&request.service_host, &request.required_scopes));
            }
        };

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized(&request.service_host, &request.required_scopes))?;

        let claims = self
            .decode_claims(token, &request.service_host)
            .map_err(|mut e| {
                // renew the challenge so clients know where to go
                e.headers.push((
                    axum::http::header::HeaderName::from_static("www-authenticate"),
                    axum::http::HeaderValue::from_str(&super::challenge_header_value(
                        &request.service_host,
                        &request.required_scopes,
                        None,
                    ))
                    .unwrap_or(axum::http::HeaderValue::from_static("Bearer")),
                ));
                e
            })?;

        let scopes = claims.scope_set();
        for required in &request.required_scopes {
            if !scopes.covers(required) {
                return Err(insufficient_scope(
                    &request.service_host,
                    &request.required_scopes,
                ));
            }
        }

        Ok(Authorization {
            user: claims.identity(),
            scopes,
            audience: claims.aud,
        })
    }
}

/// Mints a token in the shape the external auth service issues. The
/// registry never calls this in production; it documents the wire contract
/// and backs the test suite.
pub fn issue_token(
    secret: &str,
    issuer: &str,
    audience: &str,
    subject: &str,
    access: Vec<AccessEntry>,
) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as usize)
        .unwrap_or(0);
    let claims = TokenClaims {
        sub: subject.to_string(),
        iss: issuer.to_string(),
        aud: audience.to_string(),
        exp: now + 3600,
        iat: now,
        access,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
    .expect("static JWT parameters cannot fail to encode")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthFlags;

    const SECRET: &str = "test-secret";
    const ISSUER: &str = "anchorage";
    const HOST: &str = "registry.example.org";

    fn authorizer() -> JwtAuthorizer {
        JwtAuthorizer::new(SECRET.to_string(), ISSUER.to_string(), false)
    }

    fn request_for(scopes: Vec<Scope>, header: Option<String>) -> AuthRequest {
        AuthRequest {
            authorization_header: header,
            required_scopes: scopes,
            flags: AuthFlags::default(),
            service_host: HOST.to_string(),
        }
    }

    fn pull_access(repo: &str) -> Vec<AccessEntry> {
        vec![AccessEntry {
            resource_type: "repository".into(),
            name: repo.into(),
            actions: vec!["pull".into(), "push".into()],
        }]
    }

    #[tokio::test]
    async fn test_missing_header_yields_challenge() {
        let request = request_for(vec![Scope::repository("test1/foo", &["pull"])], None);
        let err = authorizer().authorize(&request).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
        let challenge = err.headers[0].1.to_str().unwrap().to_string();
        assert!(challenge.contains("realm=\"https://registry.example.org/keppel/v1/auth\""));
        assert!(challenge.contains("scope=\"repository:test1/foo:pull\""));
    }

    #[tokio::test]
    async fn test_valid_token_grants_access() {
        let token = issue_token(SECRET, ISSUER, HOST, "alice", pull_access("test1/foo"));
        let request = request_for(
            vec![Scope::repository("test1/foo", &["pull", "push"])],
            Some(format!("Bearer {token}")),
        );
        let authz = authorizer().authorize(&request).await.unwrap();
        assert_eq!(authz.user, UserIdentity::Regular("alice".into()));
        assert!(authz.scopes.contains("repository", "test1/foo", "push"));
    }

    #[tokio::test]
    async fn test_insufficient_scope_is_403() {
        let token = issue_token(SECRET, ISSUER, HOST, "alice", pull_access("test1/foo"));
        let request = request_for(
            vec![Scope::repository("test1/foo", &["delete"])],
            Some(format!("Bearer {token}")),
        );
        let err = authorizer().authorize(&request).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::FORBIDDEN);
        assert!(err.headers[0]
            .1
            .to_str()
            .unwrap()
            .contains("error=\"insufficient_scope\""));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let token = issue_token("other-secret", ISSUER, HOST, "alice", pull_access("test1/foo"));
        let request = request_for(
            vec![Scope::repository("test1/foo", &["pull"])],
            Some(format!("Bearer {token}")),
        );
        let err = authorizer().authorize(&request).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_peer_and_scanner_identities() {
        let token = issue_token(SECRET, ISSUER, HOST, "peer:registry-two.example.org", vec![]);
        let request = request_for(vec![], Some(format!("Bearer {token}")));
        let authz = authorizer().authorize(&request).await.unwrap();
        assert!(authz.user.is_peer());

        let token = issue_token(SECRET, ISSUER, HOST, "scanner", vec![]);
        let request = request_for(vec![], Some(format!("Bearer {token}")));
        let authz = authorizer().authorize(&request).await.unwrap();
        assert!(authz.user.is_scanner());
    }

    #[tokio::test]
    async fn test_anonymous_pull_when_enabled() {
        let authorizer = JwtAuthorizer::new(SECRET.into(), ISSUER.into(), true);
        let request = request_for(vec![Scope::repository("test1/foo", &["pull"])], None);
        let authz = authorizer.authorize(&request).await.unwrap();
        assert!(authz.user.is_anonymous());

        // pushes still require a token
        let request = request_for(vec![Scope::repository("test1/foo", &["pull", "push"])], None);
        assert!(authorizer.authorize(&request).await.is_err());
    }
}
