//! Blob service: GET/HEAD/DELETE of blobs in a repository.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::{
    api::v2::RequestContext,
    database::queries,
    digest::Digest,
    error::{Error, ErrorCode, RegistryError, Result},
    manifest::is_image_config_media_type,
    models::Blob,
    ratelimit::RateLimitAction,
    server::AppState,
    storage::StorageError,
};

/// `GET`/`HEAD /v2/<repo>/blobs/<digest>`.
pub async fn get_blob(
    state: AppState,
    ctx: RequestContext,
    digest: &str,
    is_head: bool,
) -> Result<Response> {
    let digest: Digest = digest.parse()?;

    state
        .ratelimit
        .check(&ctx.account.name, RateLimitAction::BlobPull, 1)
        .await
        .map_err(RegistryError::from)?;

    let blob = queries::get_blob_in_repo(&state.database, &ctx.repo.id, &digest.to_string())
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::BlobUnknown))?;

    // anycast pulls are charged by the byte
    if !is_head && ctx.forwarded_by.is_some() {
        state
            .ratelimit
            .check(
                &ctx.account.name,
                RateLimitAction::AnycastBlobBytePull,
                blob.size_bytes.max(0) as u64,
            )
            .await
            .map_err(RegistryError::from)?;
    }

    if blob.is_unbacked() {
        if !ctx.account.is_replica() {
            return Err(Error::Internal(anyhow::anyhow!(
                "blob {} in non-replica account {} has no storage backing",
                blob.digest,
                ctx.account.name
            )));
        }
        if is_head {
            // size and media type are already known from the manifest
            return Ok(blob_headers(&blob, &digest)
                .body(Body::empty())
                .map_err(build_error)?);
        }
        let (stream, size) = state
            .replicator
            .replicate_blob(
                state.database.clone(),
                state.storage.clone(),
                &ctx.account,
                &ctx.repo,
                &blob,
            )
            .await?;
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type_of(&blob))
            .header(header::CONTENT_LENGTH, size.to_string())
            .header("docker-content-digest", digest.to_string())
            .body(Body::from_stream(stream))
            .map_err(build_error)?);
    }

    // image config blobs are always proxied so CORS applies uniformly
    if !is_image_config_media_type(&blob.media_type) {
        match state
            .storage
            .url_for_blob(&ctx.account.name, &blob.storage_id)
            .await
        {
            Ok(url) => {
                return Ok(Response::builder()
                    .status(StatusCode::TEMPORARY_REDIRECT)
                    .header(header::LOCATION, url)
                    .header("docker-content-digest", digest.to_string())
                    .body(Body::empty())
                    .map_err(build_error)?);
            }
            Err(StorageError::CannotGenerateUrl) => {}
            Err(e) => return Err(Error::storage(e.to_string())),
        }
    }

    if is_head {
        return Ok(blob_headers(&blob, &digest)
            .body(Body::empty())
            .map_err(build_error)?);
    }

    let (stream, size) = state
        .storage
        .read_blob(&ctx.account.name, &blob.storage_id)
        .await
        .map_err(|e| match e {
            StorageError::NotFound => Error::Registry(RegistryError::new(ErrorCode::BlobUnknown)),
            other => Error::storage(other.to_string()),
        })?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_of(&blob))
        .header(header::CONTENT_LENGTH, size.to_string())
        .header("docker-content-digest", digest.to_string())
        .body(Body::from_stream(stream))
        .map_err(build_error)?)
}

/// `DELETE /v2/<repo>/blobs/<digest>` — removes only the blob mount. The
/// blob row and object outlive it until the janitor finds them globally
/// unreferenced.
pub async fn delete_blob(state: AppState, ctx: RequestContext, digest: &str) -> Result<Response> {
    let digest: Digest = digest.parse()?;

    let blob = queries::get_blob_in_repo(&state.database, &ctx.repo.id, &digest.to_string())
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::BlobUnknown))?;

    if queries::blob_is_referenced(&state.database, &ctx.repo.id, &blob.id).await? {
        return Err(RegistryError::unsupported(
            "blob is referenced by a manifest in this repository",
        )
        .into());
    }

    queries::unmount_blob(&state.database, &ctx.repo.id, &blob.id).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

fn blob_headers(blob: &Blob, digest: &Digest) -> axum::http::response::Builder {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_of(blob))
        .header(header::CONTENT_LENGTH, blob.size_bytes.to_string())
        .header("docker-content-digest", digest.to_string())
}

fn content_type_of(blob: &Blob) -> String {
    if blob.media_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        blob.media_type.clone()
    }
}

fn build_error(e: axum::http::Error) -> Error {
    Error::Internal(anyhow::anyhow!("building response: {e}"))
}
