//! Manifest service: PUT/GET/HEAD/DELETE of manifests and tags.
//!
//! PUT runs the full validation pipeline: media-type agreement, reference
//! resolution inside the repository, size cross-checks, label extraction
//! from the image config, account label rules, and tag policies. GET
//! performs content negotiation, redirecting platform-matched children of
//! image lists when the client cannot consume the list itself.

use std::collections::HashMap;

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::StreamExt;

use crate::{
    api::v2::{header_string, RequestContext},
    audit::{self, AuditAction},
    database::queries,
    digest::{is_digest, Digest},
    error::{Error, ErrorCode, RegistryError, Result},
    handlers::ensure_quota,
    manifest::{self, ParsedManifest},
    models::Manifest,
    ratelimit::RateLimitAction,
    server::AppState,
    storage::StorageError,
};

pub const VULNERABILITY_STATUS_HEADER: &str = "x-keppel-vulnerability-status";
pub const MIN_LAYER_CREATED_HEADER: &str = "x-keppel-min-layer-created-at";
pub const MAX_LAYER_CREATED_HEADER: &str = "x-keppel-max-layer-created-at";
pub const NO_COUNT_PULL_HEADER: &str = "x-keppel-no-count-towards-last-pulled";

/// `PUT /v2/<repo>/manifests/<reference>`.
pub async fn put_manifest(
    state: AppState,
    ctx: RequestContext,
    reference: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response> {
    if ctx.account.is_deleting {
        return Err(RegistryError::unsupported("account is being deleted").into());
    }

    let media_type = header_string(headers, header::CONTENT_TYPE.as_str()).unwrap_or_default();
    if !manifest::is_manifest_media_type(&media_type) {
        return Err(RegistryError::manifest_invalid(format!(
            "request does not have a recognized manifest media type (got {media_type:?})"
        ))
        .into());
    }

    let content = crate::api::v2::read_body(body).await?;
    let digest = Digest::from_bytes(&content);

    let tag_name = if is_digest(reference) {
        let requested: Digest = reference.parse()?;
        if requested != digest {
            return Err(RegistryError::digest_invalid(format!(
                "content hashes to {digest}, not to the requested {requested}"
            ))
            .into());
        }
        None
    } else {
        Some(reference.to_string())
    };

    let parsed = manifest::parse(&media_type, &content)?;

    // every referenced blob must exist and be mounted in this repo
    let mut blob_ids = Vec::new();
    let mut config_blob = None;
    for desc in parsed.blob_descriptors() {
        let blob = queries::get_blob_in_repo(&state.database, &ctx.repo.id, &desc.digest)
            .await?
            .ok_or_else(|| {
                RegistryError::new(ErrorCode::ManifestBlobUnknown).with_message(format!(
                    "manifest references blob {} which does not exist in this repository",
                    desc.digest
                ))
            })?;
        if blob.size_bytes != desc.size {
            return Err(RegistryError::manifest_invalid(format!(
                "manifest declares {} bytes for blob {}, but it has {}",
                desc.size, desc.digest, blob.size_bytes
            ))
            .into());
        }
        if !desc.media_type.as_deref().unwrap_or("").is_empty()
            && blob.media_type != desc.media_type.clone().unwrap_or_default()
        {
            queries::set_blob_media_type(
                &state.database,
                &blob.id,
                desc.media_type.as_deref().unwrap_or(""),
            )
            .await?;
        }
        // only actual image configs are parsed for labels; OCI artifacts
        // carry arbitrary config blobs
        if parsed
            .config
            .as_ref()
            .is_some_and(|c| c.digest == desc.digest)
            && desc
                .media_type
                .as_deref()
                .is_some_and(manifest::is_image_config_media_type)
        {
            config_blob = Some(blob.clone());
        }
        blob_ids.push(blob.id);
    }

    // every referenced child manifest must exist in this repo
    let mut child_rows = Vec::new();
    for desc in &parsed.children {
        let child = queries::get_manifest(&state.database, &ctx.repo.id, &desc.digest)
            .await?
            .ok_or_else(|| {
                RegistryError::new(ErrorCode::ManifestUnknown).with_message(format!(
                    "manifest references manifest {} which does not exist in this repository",
                    desc.digest
                ))
            })?;
        if child.size_bytes != desc.size {
            return Err(RegistryError::manifest_invalid(format!(
                "manifest declares {} bytes for submanifest {}, but it has {}",
                desc.size, desc.digest, child.size_bytes
            ))
            .into());
        }
        child_rows.push(child);
    }

    let (labels_json, min_created, max_created) = if let Some(config_blob) = &config_blob {
        let info = read_image_config(&state, &ctx, config_blob).await?;

        let missing: Vec<String> = ctx
            .account
            .required_label_names()
            .into_iter()
            .filter(|name| !info.labels.contains_key(name))
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::manifest_invalid(format!(
                "image does not carry required labels: {}",
                missing.join(", ")
            ))
            .into());
        }

        let labels_json = (!info.labels.is_empty())
            .then(|| serde_json::to_string(&info.labels))
            .transpose()?;
        (labels_json, info.min_layer_created_at, info.max_layer_created_at)
    } else if !child_rows.is_empty() {
        // a list carries the labels all of its children agree on
        let labels = intersect_child_labels(&child_rows);
        let labels_json = (!labels.is_empty())
            .then(|| serde_json::to_string(&labels))
            .transpose()?;
        let min = child_rows.iter().filter_map(|c| c.min_layer_created_at).min();
        let max = child_rows.iter().filter_map(|c| c.max_layer_created_at).max();
        (labels_json, min, max)
    } else {
        (None, None, None)
    };

    // tag policies may protect an existing tag from being repointed
    if let Some(tag_name) = &tag_name {
        let protected = ctx
            .account
            .tag_policies()
            .iter()
            .any(|p| p.block_overwrite && p.matches(&ctx.repo.name, tag_name));
        if protected {
            if let Some(existing) = queries::get_tag(&state.database, &ctx.repo.id, tag_name).await? {
                if existing.digest != digest.to_string() {
                    return Err(RegistryError::denied(format!(
                        "cannot overwrite tag {tag_name:?} because it is protected by a tag policy"
                    ))
                    .with_status(StatusCode::CONFLICT)
                    .into());
                }
            }
        }
    }

    let exists = queries::get_manifest(&state.database, &ctx.repo.id, &digest.to_string())
        .await?
        .is_some();
    if !exists {
        ensure_quota(&state.database, &ctx.account).await?;
    }

    let now = Utc::now();
    let row = Manifest {
        repo_id: ctx.repo.id,
        digest: digest.to_string(),
        media_type: media_type.clone(),
        size_bytes: content.len() as i64,
        pushed_at: now,
        validated_at: now,
        last_pulled_at: None,
        min_layer_created_at: min_created,
        max_layer_created_at: max_created,
        artifact_type: parsed.artifact_type.clone(),
        subject_digest: parsed.subject.as_ref().map(|s| s.digest.clone()),
        labels_json,
        annotations_json: parsed
            .annotations
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        vulnerability_status: None,
    };

    // storage first, then the DB commit; a failed commit orphans at most
    // one manifest object for the janitor
    state
        .storage
        .write_manifest(&ctx.account.name, &ctx.repo.name, &digest.to_string(), &content)
        .await
        .map_err(|e| Error::storage(e.to_string()))?;

    let outcome = match queries::insert_manifest(
        &state.database,
        &queries::NewManifest {
            manifest: row,
            content: content.to_vec(),
            blob_ids,
            child_digests: parsed.children.iter().map(|d| d.digest.clone()).collect(),
            tag_name: tag_name.clone(),
        },
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = state
                .storage
                .delete_manifest(&ctx.account.name, &ctx.repo.name, &digest.to_string())
                .await;
            return Err(e);
        }
    };

    if outcome.manifest_inserted {
        audit::record(
            AuditAction::PushManifest,
            &ctx.authz.user,
            &ctx.account.name,
            &ctx.repo.name,
            &digest.to_string(),
        );
    }
    if outcome.tag_changed {
        if let Some(tag_name) = &tag_name {
            audit::record(
                AuditAction::PushTag,
                &ctx.authz.user,
                &ctx.account.name,
                &ctx.repo.name,
                tag_name,
            );
        }
    }

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(
            header::LOCATION,
            format!("/v2/{}/manifests/{digest}", ctx.url_repo_path),
        )
        .header(header::CONTENT_LENGTH, "0")
        .header("docker-content-digest", digest.to_string())
        .body(Body::empty())
        .map_err(build_error)?)
}

/// `GET`/`HEAD /v2/<repo>/manifests/<reference>`.
pub async fn get_manifest(
    state: AppState,
    ctx: RequestContext,
    reference: &str,
    headers: &HeaderMap,
    is_head: bool,
) -> Result<Response> {
    state
        .ratelimit
        .check(&ctx.account.name, RateLimitAction::ManifestPull, 1)
        .await
        .map_err(RegistryError::from)?;

    let tag_name = (!is_digest(reference)).then(|| reference.to_string());

    let mut found = resolve_manifest(&state, &ctx, reference).await?;
    if found.is_none() && ctx.account.is_replica() {
        found = replicate_on_pull(&state, &ctx, reference).await?;
    }
    let row = found.ok_or_else(|| RegistryError::new(ErrorCode::ManifestUnknown))?;

    let content =
        match queries::get_manifest_content(&state.database, &ctx.repo.id, &row.digest).await? {
            Some(content) => content,
            None => state
                .storage
                .read_manifest(&ctx.account.name, &ctx.repo.name, &row.digest)
                .await
                .map_err(|e| match e {
                    StorageError::NotFound => {
                        Error::Registry(RegistryError::new(ErrorCode::ManifestUnknown))
                    }
                    other => Error::storage(other.to_string()),
                })?,
        };

    let accepted = accepted_media_types(headers);
    if !is_acceptable(&accepted, &row.media_type) {
        // a list may still satisfy the client through one of its children
        if manifest::is_list_media_type(&row.media_type) {
            if let Some(child) = negotiate_list_child(&ctx, &row, &content, &accepted)? {
                return Ok(Response::builder()
                    .status(StatusCode::TEMPORARY_REDIRECT)
                    .header(
                        header::LOCATION,
                        format!("/v2/{}/manifests/{child}", ctx.url_repo_path),
                    )
                    .header("docker-content-digest", child)
                    .body(Body::empty())
                    .map_err(build_error)?);
            }
        }
        return Err(RegistryError::new(ErrorCode::ManifestUnknown)
            .with_status(StatusCode::NOT_ACCEPTABLE)
            .with_message("manifest media type is not covered by the Accept header")
            .into());
    }

    let counts_as_pull = !is_head
        && !ctx.authz.user.is_scanner()
        && header_string(headers, NO_COUNT_PULL_HEADER).as_deref() != Some("1");
    if counts_as_pull {
        queries::touch_manifest_pulled(&state.database, &ctx.repo.id, &row.digest).await?;
        if let Some(tag_name) = &tag_name {
            queries::touch_tag_pulled(&state.database, &ctx.repo.id, tag_name).await?;
        }
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, row.media_type.clone())
        .header(header::CONTENT_LENGTH, content.len().to_string())
        .header("docker-content-digest", row.digest.clone());
    if let Some(status) = &row.vulnerability_status {
        if !status.is_empty() {
            builder = builder.header(VULNERABILITY_STATUS_HEADER, status);
        }
    }
    if let Some(t) = row.min_layer_created_at {
        builder = builder.header(MIN_LAYER_CREATED_HEADER, t.timestamp().to_string());
    }
    if let Some(t) = row.max_layer_created_at {
        builder = builder.header(MAX_LAYER_CREATED_HEADER, t.timestamp().to_string());
    }

    let body = if is_head {
        Body::empty()
    } else {
        Body::from(content)
    };
    Ok(builder.body(body).map_err(build_error)?)
}

/// `DELETE /v2/<repo>/manifests/<reference>` — by digest or by tag.
pub async fn delete_manifest(
    state: AppState,
    ctx: RequestContext,
    reference: &str,
) -> Result<Response> {
    if !is_digest(reference) {
        // tag deletion removes only the tag row
        let tag = queries::get_tag(&state.database, &ctx.repo.id, reference)
            .await?
            .ok_or_else(|| RegistryError::new(ErrorCode::ManifestUnknown))?;

        let protected = ctx
            .account
            .tag_policies()
            .iter()
            .any(|p| p.block_delete && p.matches(&ctx.repo.name, &tag.name));
        if protected {
            return Err(RegistryError::denied(format!(
                "cannot delete tag {:?} because it is protected by a tag policy",
                tag.name
            ))
            .with_status(StatusCode::CONFLICT)
            .into());
        }

        queries::delete_tag(&state.database, &ctx.repo.id, &tag.name).await?;
        audit::record(
            AuditAction::DeleteTag,
            &ctx.authz.user,
            &ctx.account.name,
            &ctx.repo.name,
            &tag.name,
        );
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    let digest: Digest = reference.parse()?;
    queries::get_manifest(&state.database, &ctx.repo.id, &digest.to_string())
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::ManifestUnknown))?;

    let tags = queries::list_tags_for_digest(&state.database, &ctx.repo.id, &digest.to_string())
        .await?;
    for tag in &tags {
        let protected = ctx
            .account
            .tag_policies()
            .iter()
            .any(|p| p.block_delete && p.matches(&ctx.repo.name, &tag.name));
        if protected {
            return Err(RegistryError::denied(format!(
                "cannot delete manifest because tag {:?} is protected by a tag policy",
                tag.name
            ))
            .with_status(StatusCode::CONFLICT)
            .into());
        }
    }

    if let Some(parent) =
        queries::find_parent_manifest(&state.database, &ctx.repo.id, &digest.to_string()).await?
    {
        return Err(RegistryError::denied(format!(
            "manifest is still referenced by manifest {parent}"
        ))
        .with_status(StatusCode::CONFLICT)
        .into());
    }

    queries::delete_manifest(&state.database, &ctx.repo.id, &digest.to_string()).await?;
    if let Err(e) = state
        .storage
        .delete_manifest(&ctx.account.name, &ctx.repo.name, &digest.to_string())
        .await
    {
        tracing::warn!(error = %e, "deleting manifest object failed");
    }

    audit::record(
        AuditAction::DeleteManifest,
        &ctx.authz.user,
        &ctx.account.name,
        &ctx.repo.name,
        &digest.to_string(),
    );
    Ok(StatusCode::ACCEPTED.into_response())
}

// ---------------------------------------------------------------- helpers

async fn resolve_manifest(
    state: &AppState,
    ctx: &RequestContext,
    reference: &str,
) -> Result<Option<Manifest>> {
    let digest = if is_digest(reference) {
        reference.parse::<Digest>()?.to_string()
    } else {
        match queries::get_tag(&state.database, &ctx.repo.id, reference).await? {
            Some(tag) => tag.digest,
            None => return Ok(None),
        }
    };
    queries::get_manifest(&state.database, &ctx.repo.id, &digest).await
}

/// First-pull replication. Peers and the scanner always see the true 404
/// so that a replica of a replica cannot mask non-existence.
async fn replicate_on_pull(
    state: &AppState,
    ctx: &RequestContext,
    reference: &str,
) -> Result<Option<Manifest>> {
    let from_peer = ctx.account.upstream_peer_hostname.is_some();
    if from_peer && (ctx.authz.user.is_peer() || ctx.authz.user.is_scanner()) {
        return Ok(None);
    }
    if !from_peer
        && ctx.authz.user.is_anonymous()
        && !ctx
            .authz
            .scopes
            .contains("keppel_account", &ctx.account.name, "anonymous_first_pull")
    {
        return Err(crate::auth::unauthorized(&ctx.service_host, &[]).into());
    }

    let replicated = state
        .replicator
        .replicate_manifest(
            &state.database,
            state.storage.as_ref(),
            &ctx.account,
            &ctx.repo,
            reference,
        )
        .await?;
    Ok(replicated.map(|(row, _)| row))
}

async fn read_image_config(
    state: &AppState,
    ctx: &RequestContext,
    blob: &crate::models::Blob,
) -> Result<manifest::ImageConfigInfo> {
    let (mut stream, _) = state
        .storage
        .read_blob(&ctx.account.name, &blob.storage_id)
        .await
        .map_err(|e| match e {
            StorageError::NotFound => Error::Registry(
                RegistryError::new(ErrorCode::ManifestBlobUnknown)
                    .with_message("image config blob has no stored content"),
            ),
            other => Error::storage(other.to_string()),
        })?;

    let mut content = Vec::with_capacity(blob.size_bytes.max(0) as usize);
    while let Some(chunk) = stream.next().await {
        content.extend_from_slice(&chunk.map_err(|e| Error::storage(e.to_string()))?);
    }
    Ok(manifest::parse_image_config(&content)?)
}

fn intersect_child_labels(children: &[Manifest]) -> HashMap<String, String> {
    let mut iter = children.iter().map(|c| {
        c.labels_json
            .as_deref()
            .and_then(|j| serde_json::from_str::<HashMap<String, String>>(j).ok())
            .unwrap_or_default()
    });
    let mut common = match iter.next() {
        Some(first) => first,
        None => return HashMap::new(),
    };
    for labels in iter {
        common.retain(|k, v| labels.get(k) == Some(v));
    }
    common
}

/// All media types the client accepts, across repeated `Accept` headers.
fn accepted_media_types(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|entry| entry.split(';').next().unwrap_or("").trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn is_acceptable(accepted: &[String], media_type: &str) -> bool {
    accepted.is_empty()
        || accepted
            .iter()
            .any(|a| a == media_type || a == "application/json" || a == "*/*")
}

/// Picks a child of an image list that matches the account's platform
/// filter and the client's Accept set. Returns the child digest.
fn negotiate_list_child(
    ctx: &RequestContext,
    row: &Manifest,
    content: &[u8],
    accepted: &[String],
) -> Result<Option<String>> {
    let parsed: ParsedManifest = manifest::parse(&row.media_type, content)?;
    let platform_filter = ctx.account.platform_filter();

    for child in &parsed.children {
        let platform_ok = match (&child.platform, platform_filter.is_empty()) {
            (_, true) => true,
            (Some(platform), false) => platform_filter.contains(platform),
            (None, false) => false,
        };
        let media_type_ok = child
            .media_type
            .as_deref()
            .is_some_and(|mt| is_acceptable(accepted, mt));
        if platform_ok && media_type_ok {
            return Ok(Some(child.digest.clone()));
        }
    }
    Ok(None)
}

fn build_error(e: axum::http::Error) -> Error {
    Error::Internal(anyhow::anyhow!("building response: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::ACCEPT,
            "application/vnd.oci.image.index.v1+json;q=0.9, application/json"
                .parse()
                .unwrap(),
        );
        headers.append(header::ACCEPT, "text/html".parse().unwrap());
        let accepted = accepted_media_types(&headers);
        assert_eq!(
            accepted,
            vec![
                "application/vnd.oci.image.index.v1+json",
                "application/json",
                "text/html"
            ]
        );
    }

    #[test]
    fn test_is_acceptable() {
        let accepted = vec!["application/vnd.oci.image.manifest.v1+json".to_string()];
        assert!(is_acceptable(&accepted, "application/vnd.oci.image.manifest.v1+json"));
        assert!(!is_acceptable(&accepted, "application/vnd.oci.image.index.v1+json"));
        // empty Accept means anything goes
        assert!(is_acceptable(&[], "application/vnd.oci.image.index.v1+json"));
        // application/json acts as a wildcard for manifests
        assert!(is_acceptable(
            &["application/json".to_string()],
            "application/vnd.oci.image.index.v1+json"
        ));
    }

    #[test]
    fn test_intersect_child_labels() {
        fn child(labels: &str) -> Manifest {
            let now = Utc::now();
            Manifest {
                repo_id: uuid::Uuid::new_v4(),
                digest: "sha256:x".into(),
                media_type: manifest::OCI_MANIFEST.into(),
                size_bytes: 1,
                pushed_at: now,
                validated_at: now,
                last_pulled_at: None,
                min_layer_created_at: None,
                max_layer_created_at: None,
                artifact_type: None,
                subject_digest: None,
                labels_json: Some(labels.to_string()),
                annotations_json: None,
                vulnerability_status: None,
            }
        }

        let children = vec![
            child(r#"{"a":"1","b":"2","c":"3"}"#),
            child(r#"{"a":"1","b":"9"}"#),
        ];
        let common = intersect_child_labels(&children);
        assert_eq!(common.len(), 1);
        assert_eq!(common.get("a").unwrap(), "1");
    }
}
