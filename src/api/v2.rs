//! Registry v2 API surface: route parsing, the per-request gate, and
//! dispatch.
//!
//! Repository names may contain slashes, so the repo-scoped endpoints
//! cannot be expressed as fixed axum route patterns; a fallback handler
//! parses the path instead. Every repo-scoped request runs the same gate:
//! name validation, scope authorization, account resolution (with anycast
//! forwarding for accounts hosted elsewhere), then repository loading per
//! the endpoint's strategy.

use std::collections::HashMap;
use std::sync::OnceLock;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use regex::Regex;
use uuid::Uuid;

use crate::{
    auth::{self, AuthFlags, AuthRequest, Authorization, Scope},
    config::Config,
    database::queries,
    error::{ErrorCode, RegistryError, Result},
    federation::FORWARDED_BY_HEADER,
    handlers,
    models::{Account, Repository},
    server::AppState,
};

pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";
pub const API_VERSION: &str = "registry/2.0";

fn repo_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[a-z0-9]+(?:[._-][a-z0-9]+)*)(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
            .expect("static regex")
    })
}

fn account_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9-]{1,48}$").expect("static regex"))
}

pub fn registry_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(api_version_check))
        .route("/v2/_catalog", get(handlers::catalog::get_catalog))
        .route("/healthcheck", get(healthcheck))
        .fallback(dispatch)
        .layer(middleware::from_fn(add_api_version_header))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Every response carries the API version marker, including errors.
async fn add_api_version_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        API_VERSION_HEADER,
        HeaderValue::from_static(API_VERSION),
    );
    response
}

async fn healthcheck() -> &'static str {
    "ok"
}

/// `GET /v2/` — authentication probe. Returns `{}` for any valid token.
async fn api_version_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let info = RequestInfo::from_headers(&state.config, &headers);
    state
        .authorizer
        .authorize(&AuthRequest {
            authorization_header: header_string(&headers, header::AUTHORIZATION.as_str()),
            required_scopes: vec![],
            flags: AuthFlags {
                allows_anycast: true,
                allows_domain_remapping: true,
                no_implicit_anonymous: true,
            },
            service_host: info.service_host.clone(),
        })
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "{}",
    )
        .into_response())
}

// ------------------------------------------------------------ route model

/// A repo-scoped endpoint, parsed from the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    UploadStart,
    Upload(Uuid),
    Blob(String),
    Manifest(String),
    Referrers(String),
    TagList,
}

/// Splits `/v2/<repo>/...` into the repo path and the endpoint. The repo
/// path still contains the account segment on path-form requests.
pub fn parse_route(path: &str) -> Option<(String, Endpoint)> {
    let rest = path.strip_prefix("/v2/")?;
    let segments: Vec<&str> = rest.split('/').collect();
    let n = segments.len();

    // POST /v2/<repo>/blobs/uploads/  (trailing slash yields an empty tail)
    if n >= 4 && segments[n - 3] == "blobs" && segments[n - 2] == "uploads" && segments[n - 1].is_empty()
    {
        return repo_of(&segments[..n - 3]).map(|r| (r, Endpoint::UploadStart));
    }
    if n >= 4 && segments[n - 3] == "blobs" && segments[n - 2] == "uploads" {
        let uuid = Uuid::parse_str(segments[n - 1]).ok()?;
        return repo_of(&segments[..n - 3]).map(|r| (r, Endpoint::Upload(uuid)));
    }
    if n >= 3 && segments[n - 2] == "blobs" {
        return repo_of(&segments[..n - 2])
            .map(|r| (r, Endpoint::Blob(segments[n - 1].to_string())));
    }
    if n >= 3 && segments[n - 2] == "manifests" {
        return repo_of(&segments[..n - 2])
            .map(|r| (r, Endpoint::Manifest(segments[n - 1].to_string())));
    }
    if n >= 3 && segments[n - 2] == "referrers" {
        return repo_of(&segments[..n - 2])
            .map(|r| (r, Endpoint::Referrers(segments[n - 1].to_string())));
    }
    if n >= 3 && segments[n - 2] == "tags" && segments[n - 1] == "list" {
        return repo_of(&segments[..n - 2]).map(|r| (r, Endpoint::TagList));
    }
    None
}

fn repo_of(segments: &[&str]) -> Option<String> {
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments.join("/"))
}

// ------------------------------------------------------------ request info

/// Host-derived facts about a request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Public host after `X-Forwarded-Host` resolution.
    pub service_host: String,
    pub is_anycast: bool,
    /// Account taken from the leading subdomain on domain-remapped URLs.
    pub remapped_account: Option<String>,
    /// Peer that already forwarded this request, guarding against loops.
    pub forwarded_by: Option<String>,
}

impl RequestInfo {
    pub fn from_headers(config: &Config, headers: &HeaderMap) -> Self {
        let host = header_string(headers, "x-forwarded-host")
            .or_else(|| header_string(headers, header::HOST.as_str()))
            .unwrap_or_else(|| config.api.public_hostname.clone());
        let host = host.split(':').next().unwrap_or("").to_string();

        let is_anycast = config.api.anycast_hostname.as_deref() == Some(host.as_str());
        let remapped_account = host
            .strip_suffix(&format!(".{}", config.api.public_hostname))
            .filter(|label| !label.is_empty() && !label.contains('.'))
            .map(str::to_string);

        Self {
            service_host: host,
            is_anycast,
            remapped_account,
            forwarded_by: header_string(headers, FORWARDED_BY_HEADER),
        }
    }
}

pub fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decoded query parameters.
pub fn query_params(query: Option<&str>) -> HashMap<String, String> {
    match query {
        Some(q) => url::form_urlencoded::parse(q.as_bytes())
            .into_owned()
            .collect(),
        None => HashMap::new(),
    }
}

// -------------------------------------------------------------------- gate

/// How a handler wants a missing repository treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStrategy {
    MustExist,
    /// Create on demand for pushes to normal accounts.
    CreateOnPush,
    /// Create on demand for first-pull on replica accounts.
    CreateOnFirstPull,
}

/// Everything the gate established about an authorized repo-scoped
/// request.
pub struct RequestContext {
    pub account: Account,
    pub repo: Repository,
    pub authz: Authorization,
    pub service_host: String,
    pub is_anycast: bool,
    pub forwarded_by: Option<String>,
    /// Repo path exactly as it appeared in the URL; `Location` headers are
    /// built from this so domain-remapped clients get remapped URLs back.
    pub url_repo_path: String,
}

enum Gated {
    Proceed(Box<RequestContext>),
    /// The request was reverse-proxied to the primary peer.
    Forwarded(Response),
}

#[allow(clippy::too_many_arguments)]
async fn gate(
    state: &AppState,
    info: &RequestInfo,
    method: &Method,
    headers: &HeaderMap,
    path_and_query: &str,
    account_name: &str,
    repo_name: &str,
    url_repo_path: &str,
    strategy: RepoStrategy,
    supports_anycast: bool,
) -> Result<Gated> {
    if !account_name_regex().is_match(account_name) || !repo_name_regex().is_match(repo_name) {
        return Err(RegistryError::new(ErrorCode::NameInvalid).into());
    }

    let actions: &[&str] = if *method == Method::DELETE {
        &["delete"]
    } else if *method == Method::GET || *method == Method::HEAD {
        &["pull"]
    } else {
        &["pull", "push"]
    };
    let full_repo_name = format!("{account_name}/{repo_name}");
    let required_scopes = vec![Scope::repository(&full_repo_name, actions)];

    let authz = state
        .authorizer
        .authorize(&AuthRequest {
            authorization_header: header_string(headers, header::AUTHORIZATION.as_str()),
            required_scopes: required_scopes.clone(),
            flags: AuthFlags {
                allows_anycast: supports_anycast,
                allows_domain_remapping: true,
                no_implicit_anonymous: false,
            },
            service_host: info.service_host.clone(),
        })
        .await?;

    if info.is_anycast && *method != Method::GET && *method != Method::HEAD {
        return Err(RegistryError::unsupported("anycast requests may only pull").into());
    }

    let account = match queries::get_account(&state.database, account_name).await? {
        Some(account) => account,
        None => {
            if info.is_anycast && supports_anycast && info.forwarded_by.is_none() {
                if let Some(primary) = state
                    .federation
                    .find_primary_account(account_name)
                    .await?
                {
                    let response = state
                        .peer_proxy
                        .reverse_proxy(&primary, method.clone(), path_and_query, headers.clone())
                        .await?;
                    return Ok(Gated::Forwarded(response));
                }
            }
            return Err(RegistryError::new(ErrorCode::NameUnknown).into());
        }
    };

    let repo = match strategy {
        RepoStrategy::CreateOnPush => {
            if account.is_replica() {
                return Err(
                    RegistryError::unsupported("cannot push to replica account").into(),
                );
            }
            queries::get_or_create_repo(&state.database, &account.name, repo_name).await?
        }
        RepoStrategy::CreateOnFirstPull if account.is_replica() => {
            if account.external_peer_url.is_some()
                && authz.user.is_anonymous()
                && !authz
                    .scopes
                    .contains("keppel_account", &account.name, "anonymous_first_pull")
            {
                return Err(auth::unauthorized(&info.service_host, &required_scopes).into());
            }
            queries::get_or_create_repo(&state.database, &account.name, repo_name).await?
        }
        _ => queries::get_repo(&state.database, &account.name, repo_name)
            .await?
            .ok_or_else(|| RegistryError::new(ErrorCode::NameUnknown))?,
    };

    Ok(Gated::Proceed(Box::new(RequestContext {
        account,
        repo,
        authz,
        service_host: info.service_host.clone(),
        is_anycast: info.is_anycast,
        forwarded_by: info.forwarded_by.clone(),
        url_repo_path: url_repo_path.to_string(),
    })))
}

// ---------------------------------------------------------------- dispatch

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    match route_request(state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn route_request(state: AppState, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let params = query_params(parts.uri.query());

    let (repo_path, endpoint) = parse_route(&path)
        .ok_or_else(|| RegistryError::new(ErrorCode::NameUnknown).with_message("no such API endpoint"))?;

    let info = RequestInfo::from_headers(&state.config, &parts.headers);
    let url_repo_path = repo_path.clone();
    let (account_name, repo_name) = match &info.remapped_account {
        Some(account) => (account.clone(), repo_path),
        None => {
            let (account, repo) = repo_path
                .split_once('/')
                .ok_or_else(|| RegistryError::new(ErrorCode::NameInvalid))?;
            (account.to_string(), repo.to_string())
        }
    };

    let method = parts.method.clone();
    let is_pull = method == Method::GET || method == Method::HEAD;
    let (strategy, supports_anycast) = match &endpoint {
        Endpoint::UploadStart if method == Method::POST => (RepoStrategy::CreateOnPush, false),
        Endpoint::Upload(_)
            if method == Method::GET
                || method == Method::PATCH
                || method == Method::PUT
                || method == Method::DELETE =>
        {
            (RepoStrategy::MustExist, false)
        }
        Endpoint::Blob(_) if is_pull => (RepoStrategy::MustExist, true),
        Endpoint::Blob(_) if method == Method::DELETE => (RepoStrategy::MustExist, false),
        Endpoint::Manifest(_) if is_pull => (RepoStrategy::CreateOnFirstPull, true),
        Endpoint::Manifest(_) if method == Method::PUT => (RepoStrategy::CreateOnPush, false),
        Endpoint::Manifest(_) if method == Method::DELETE => (RepoStrategy::MustExist, false),
        Endpoint::Referrers(_) if method == Method::GET => (RepoStrategy::MustExist, false),
        Endpoint::TagList if method == Method::GET => (RepoStrategy::MustExist, false),
        _ => {
            return Err(RegistryError::unsupported("method not allowed on this endpoint").into())
        }
    };

    let ctx = match gate(
        &state,
        &info,
        &method,
        &parts.headers,
        &path_and_query,
        &account_name,
        &repo_name,
        &url_repo_path,
        strategy,
        supports_anycast,
    )
    .await?
    {
        Gated::Forwarded(response) => return Ok(response),
        Gated::Proceed(ctx) => *ctx,
    };

    match endpoint {
        Endpoint::UploadStart => {
            handlers::uploads::start_upload(state, ctx, &parts.headers, &params, body).await
        }
        Endpoint::Upload(uuid) => {
            if method == Method::PATCH {
                handlers::uploads::patch_upload(state, ctx, uuid, &parts.headers, &params, body)
                    .await
            } else if method == Method::PUT {
                handlers::uploads::put_upload(state, ctx, uuid, &parts.headers, &params, body)
                    .await
            } else if method == Method::GET {
                handlers::uploads::get_upload_status(state, ctx, uuid, &params).await
            } else {
                handlers::uploads::cancel_upload(state, ctx, uuid).await
            }
        }
        Endpoint::Blob(digest) => {
            if method == Method::DELETE {
                handlers::blobs::delete_blob(state, ctx, &digest).await
            } else {
                handlers::blobs::get_blob(state, ctx, &digest, method == Method::HEAD).await
            }
        }
        Endpoint::Manifest(reference) => {
            if method == Method::PUT {
                handlers::manifests::put_manifest(state, ctx, &reference, &parts.headers, body)
                    .await
            } else if method == Method::DELETE {
                handlers::manifests::delete_manifest(state, ctx, &reference).await
            } else {
                handlers::manifests::get_manifest(
                    state,
                    ctx,
                    &reference,
                    &parts.headers,
                    method == Method::HEAD,
                )
                .await
            }
        }
        Endpoint::Referrers(digest) => {
            handlers::referrers::list_referrers(state, ctx, &digest, &params).await
        }
        Endpoint::TagList => handlers::catalog::list_tags(state, ctx, &params).await,
    }
}

/// Reads a request body to completion. The 4 GiB ceiling matches the
/// largest layer the registry accepts in one request.
pub async fn read_body(body: Body) -> Result<bytes::Bytes> {
    axum::body::to_bytes(body, 4 << 30)
        .await
        .map_err(|e| RegistryError::new(ErrorCode::BlobUploadInvalid)
            .with_message(format!("reading request body: {e}"))
            .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_uploads() {
        let (repo, endpoint) = parse_route("/v2/test1/foo/blobs/uploads/").unwrap();
        assert_eq!(repo, "test1/foo");
        assert_eq!(endpoint, Endpoint::UploadStart);

        let uuid = Uuid::new_v4();
        let (repo, endpoint) =
            parse_route(&format!("/v2/test1/lib/deep/foo/blobs/uploads/{uuid}")).unwrap();
        assert_eq!(repo, "test1/lib/deep/foo");
        assert_eq!(endpoint, Endpoint::Upload(uuid));

        assert!(parse_route("/v2/test1/foo/blobs/uploads/not-a-uuid").is_none());
    }

    #[test]
    fn test_parse_route_blobs_and_manifests() {
        let (repo, endpoint) = parse_route("/v2/test1/foo/blobs/sha256:abc").unwrap();
        assert_eq!(repo, "test1/foo");
        assert_eq!(endpoint, Endpoint::Blob("sha256:abc".into()));

        let (repo, endpoint) = parse_route("/v2/test1/foo/manifests/latest").unwrap();
        assert_eq!(repo, "test1/foo");
        assert_eq!(endpoint, Endpoint::Manifest("latest".into()));

        let (repo, endpoint) = parse_route("/v2/test1/foo/referrers/sha256:abc").unwrap();
        assert_eq!(repo, "test1/foo");
        assert_eq!(endpoint, Endpoint::Referrers("sha256:abc".into()));

        let (repo, endpoint) = parse_route("/v2/test1/foo/tags/list").unwrap();
        assert_eq!(repo, "test1/foo");
        assert_eq!(endpoint, Endpoint::TagList);
    }

    #[test]
    fn test_parse_route_rejects_garbage() {
        assert!(parse_route("/v2/").is_none());
        assert!(parse_route("/v2/foo").is_none());
        assert!(parse_route("/v2/foo/manifests").is_none());
        assert!(parse_route("/other/foo/manifests/latest").is_none());
        assert!(parse_route("/v2//blobs/sha256:abc").is_none());
    }

    #[test]
    fn test_name_validation_regexes() {
        assert!(repo_name_regex().is_match("foo"));
        assert!(repo_name_regex().is_match("lib/ssl-1.0_beta"));
        assert!(!repo_name_regex().is_match("Foo"));
        assert!(!repo_name_regex().is_match("foo//bar"));
        assert!(!repo_name_regex().is_match("-foo"));

        assert!(account_name_regex().is_match("test1"));
        assert!(!account_name_regex().is_match("Test1"));
        assert!(!account_name_regex().is_match(&"a".repeat(49)));
    }

    #[test]
    fn test_request_info_host_resolution() {
        let config = Config::default(); // public host registry.example.org
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "registry.example.org".parse().unwrap());
        let info = RequestInfo::from_headers(&config, &headers);
        assert_eq!(info.service_host, "registry.example.org");
        assert!(!info.is_anycast);
        assert!(info.remapped_account.is_none());

        headers.insert(
            "x-forwarded-host",
            "test1.registry.example.org".parse().unwrap(),
        );
        let info = RequestInfo::from_headers(&config, &headers);
        assert_eq!(info.remapped_account.as_deref(), Some("test1"));
    }

    #[test]
    fn test_request_info_anycast() {
        let mut config = Config::default();
        config.api.anycast_hostname = Some("registry.anycast.example.org".to_string());
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "registry.anycast.example.org:443".parse().unwrap());
        let info = RequestInfo::from_headers(&config, &headers);
        assert!(info.is_anycast);
    }

    #[test]
    fn test_query_params_decoding() {
        let params = query_params(Some("digest=sha256%3Aabc&state=AAAA"));
        assert_eq!(params.get("digest").unwrap(), "sha256:abc");
        assert_eq!(params.get("state").unwrap(), "AAAA");
    }
}
