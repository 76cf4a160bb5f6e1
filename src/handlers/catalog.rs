//! Catalog and tag listings with Registry v2 pagination.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{
    api::v2::{header_string, RequestContext},
    auth::{AuthFlags, AuthRequest},
    database::queries,
    error::Result,
    server::AppState,
};

/// `GET /v2/_catalog?n=N&last=L` — repositories visible to the token's
/// account-view scopes, sorted by `account/repo`.
pub async fn get_catalog(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response> {
    let info = crate::api::v2::RequestInfo::from_headers(&state.config, &headers);
    let authz = state
        .authorizer
        .authorize(&AuthRequest {
            authorization_header: header_string(&headers, header::AUTHORIZATION.as_str()),
            required_scopes: vec![],
            flags: AuthFlags {
                allows_anycast: false,
                allows_domain_remapping: false,
                no_implicit_anonymous: true,
            },
            service_host: info.service_host.clone(),
        })
        .await?;

    let limit = match parse_limit(&params) {
        Ok(limit) => limit,
        Err(response) => return Ok(response),
    };
    let last = params.get("last").map(String::as_str).unwrap_or("");
    if !last.is_empty() && !last.contains('/') {
        return Ok((
            StatusCode::BAD_REQUEST,
            "marker \"last\" must be a full repository name",
        )
            .into_response());
    }

    // tokens without account-view scopes see an empty catalog, not a 404
    let visible_accounts = authz.scopes.accounts_with_view();
    let mut names: Vec<String> = queries::list_all_repos(&state.database)
        .await?
        .into_iter()
        .filter(|repo| visible_accounts.contains(&repo.account_name))
        .map(|repo| repo.full_name())
        .collect();
    names.sort();

    let (page, truncated) = paginate(names, last, limit);

    let mut response = Json(json!({ "repositories": page.clone() })).into_response();
    if truncated {
        if let (Some(limit), Some(last_name)) = (limit, page.last()) {
            let link = format!("</v2/_catalog?n={limit}&last={last_name}>; rel=\"next\"");
            if let Ok(value) = link.parse() {
                response.headers_mut().insert(header::LINK, value);
            }
        }
    }
    Ok(response)
}

/// `GET /v2/<repo>/tags/list?n=N&last=L` — tags of one repository, sorted
/// by name.
pub async fn list_tags(
    state: AppState,
    ctx: RequestContext,
    params: &HashMap<String, String>,
) -> Result<Response> {
    let limit = match parse_limit(params) {
        Ok(limit) => limit,
        Err(response) => return Ok(response),
    };
    let last = params.get("last").map(String::as_str).unwrap_or("");

    let names: Vec<String> = queries::list_tags(&state.database, &ctx.repo.id)
        .await?
        .into_iter()
        .map(|tag| tag.name)
        .collect();

    let (page, truncated) = paginate(names, last, limit);

    let mut response = Json(json!({
        "name": ctx.repo.full_name(),
        "tags": page.clone(),
    }))
    .into_response();
    if truncated {
        if let (Some(limit), Some(last_name)) = (limit, page.last()) {
            let link = format!(
                "</v2/{}/tags/list?n={limit}&last={last_name}>; rel=\"next\"",
                ctx.url_repo_path
            );
            if let Ok(value) = link.parse() {
                response.headers_mut().insert(header::LINK, value);
            }
        }
    }
    Ok(response)
}

/// Parses `n`. Absent means unlimited; `0` or non-numeric is a client
/// error.
fn parse_limit(params: &HashMap<String, String>) -> std::result::Result<Option<usize>, Response> {
    match params.get("n") {
        None => Ok(None),
        Some(raw) => match raw.parse::<usize>() {
            Ok(0) | Err(_) => Err((
                StatusCode::BAD_REQUEST,
                "query parameter \"n\" must be a positive integer",
            )
                .into_response()),
            Ok(n) => Ok(Some(n)),
        },
    }
}

/// Returns the page after `last`, capped at `limit`, plus whether more
/// entries remain.
fn paginate(sorted: Vec<String>, last: &str, limit: Option<usize>) -> (Vec<String>, bool) {
    let remaining: Vec<String> = sorted
        .into_iter()
        .filter(|name| last.is_empty() || name.as_str() > last)
        .collect();
    match limit {
        Some(limit) if remaining.len() > limit => (remaining[..limit].to_vec(), true),
        _ => (remaining, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate() {
        let names = vec![
            "test1/bar".to_string(),
            "test1/foo".to_string(),
            "test2/app".to_string(),
        ];

        let (page, truncated) = paginate(names.clone(), "", None);
        assert_eq!(page.len(), 3);
        assert!(!truncated);

        let (page, truncated) = paginate(names.clone(), "", Some(2));
        assert_eq!(page, vec!["test1/bar", "test1/foo"]);
        assert!(truncated);

        let (page, truncated) = paginate(names, "test1/foo", Some(2));
        assert_eq!(page, vec!["test2/app"]);
        assert!(!truncated);
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(&HashMap::new()).unwrap(), None);

        let params = HashMap::from([("n".to_string(), "10".to_string())]);
        assert_eq!(parse_limit(&params).unwrap(), Some(10));

        let params = HashMap::from([("n".to_string(), "0".to_string())]);
        assert!(parse_limit(&params).is_err());

        let params = HashMap::from([("n".to_string(), "ten".to_string())]);
        assert!(parse_limit(&params).is_err());
    }
}
