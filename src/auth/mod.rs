//! Token authorization.
//!
//! Token issuance lives in an external auth service; this module only
//! validates presented credentials against the scopes a request needs and
//! renders the `WWW-Authenticate` challenges pointing at that service.

use axum::http::{header::HeaderName, HeaderValue, StatusCode};

use crate::error::RegistryError;

pub mod jwt;
pub mod scope;

pub use scope::{Scope, ScopeSet};

/// Who is making the request, as established by the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIdentity {
    Regular(String),
    Anonymous,
    /// Another registry in the peer group, pulling for replication.
    Peer(String),
    /// The vulnerability scanner. Sees true 404s and does not bump
    /// last-pulled timestamps.
    Scanner,
}

impl UserIdentity {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, UserIdentity::Anonymous)
    }

    pub fn is_peer(&self) -> bool {
        matches!(self, UserIdentity::Peer(_))
    }

    pub fn is_scanner(&self) -> bool {
        matches!(self, UserIdentity::Scanner)
    }

    pub fn name(&self) -> String {
        match self {
            UserIdentity::Regular(name) => name.clone(),
            UserIdentity::Anonymous => "anonymous".to_string(),
            UserIdentity::Peer(host) => format!("peer:{host}"),
            UserIdentity::Scanner => "scanner".to_string(),
        }
    }
}

/// A validated credential: the user behind it and what it may do.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub user: UserIdentity,
    pub scopes: ScopeSet,
    pub audience: String,
}

/// Behavior switches the router passes alongside the scope requirements.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthFlags {
    pub allows_anycast: bool,
    pub allows_domain_remapping: bool,
    /// When set, a missing Authorization header is always a 401 even if
    /// anonymous pull is enabled.
    pub no_implicit_anonymous: bool,
}

/// What the router asks the authorizer to check.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Raw `Authorization` header value, if any.
    pub authorization_header: Option<String>,
    pub required_scopes: Vec<Scope>,
    pub flags: AuthFlags,
    /// Public host of this request after `X-Forwarded-Host` resolution;
    /// becomes the challenge service and the expected token audience.
    pub service_host: String,
}

#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns the authorization or a registry error ready to be sent,
    /// including its challenge headers.
    async fn authorize(&self, request: &AuthRequest) -> Result<Authorization, RegistryError>;
}

/// Builds the `Bearer` challenge for the given host and scope set.
pub fn challenge_header_value(
    service_host: &str,
    scopes: &[Scope],
    error: Option<&str>,
) -> String {
    let mut value = format!(
        "Bearer realm=\"https://{service_host}/keppel/v1/auth\",service=\"{service_host}\""
    );
    if !scopes.is_empty() {
        let rendered: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
        value.push_str(&format!(",scope=\"{}\"", rendered.join(" ")));
    }
    if let Some(error) = error {
        value.push_str(&format!(",error=\"{error}\""));
    }
    value
}

/// 401 with a well-formed challenge.
pub fn unauthorized(service_host: &str, scopes: &[Scope]) -> RegistryError {
    let challenge = challenge_header_value(service_host, scopes, None);
    RegistryError::unauthorized("authentication required").with_header(
        HeaderName::from_static("www-authenticate"),
        HeaderValue::from_str(&challenge)
            .unwrap_or_else(|_| HeaderValue::from_static("Bearer")),
    )
}

/// 403 with a renewed challenge carrying `error="insufficient_scope"`.
pub fn insufficient_scope(service_host: &str, scopes: &[Scope]) -> RegistryError {
    let challenge = challenge_header_value(service_host, scopes, Some("insufficient_scope"));
    RegistryError::denied("token lacks required scope")
        .with_status(StatusCode::FORBIDDEN)
        .with_header(
            HeaderName::from_static("www-authenticate"),
            HeaderValue::from_str(&challenge)
                .unwrap_or_else(|_| HeaderValue::from_static("Bearer")),
        )
}
