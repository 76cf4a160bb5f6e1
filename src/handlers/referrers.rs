//! Referrers service: lists manifests whose `subject` points at a digest.

use std::collections::HashMap;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use serde_json::json;

use crate::{
    api::v2::RequestContext,
    database::queries,
    digest::Digest,
    error::{Error, Result},
    manifest::OCI_INDEX,
    server::AppState,
};

pub const FILTERS_APPLIED_HEADER: &str = "oci-filters-applied";

/// `GET /v2/<repo>/referrers/<digest>?artifactType=T` — an OCI image index
/// over all manifests in this repo whose subject is the given digest.
pub async fn list_referrers(
    state: AppState,
    ctx: RequestContext,
    digest: &str,
    params: &HashMap<String, String>,
) -> Result<Response> {
    let digest: Digest = digest.parse()?;
    let artifact_type = params.get("artifactType").map(String::as_str);

    let referrers = queries::list_referrers(
        &state.database,
        &ctx.repo.id,
        &digest.to_string(),
        artifact_type,
    )
    .await?;

    let manifests: Vec<serde_json::Value> = referrers
        .iter()
        .map(|m| {
            let annotations = m
                .annotations_json
                .as_deref()
                .and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok());
            let mut entry = json!({
                "mediaType": m.media_type,
                "digest": m.digest,
                "size": m.size_bytes,
                "artifactType": m
                    .artifact_type
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .unwrap_or(&m.media_type),
            });
            if let Some(annotations) = annotations {
                entry["annotations"] = annotations;
            }
            entry
        })
        .collect();

    // `manifests` is always an array, even when empty
    let body = json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": manifests,
    });

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, OCI_INDEX);
    if artifact_type.is_some() {
        builder = builder.header(FILTERS_APPLIED_HEADER, "artifactType");
    }
    Ok(builder
        .body(Body::from(serde_json::to_vec(&body)?))
        .map_err(|e| Error::Internal(anyhow::anyhow!("building response: {e}")))?)
}
