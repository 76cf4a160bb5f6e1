//! Blob upload engine: monolithic, streamed, and chunked uploads with
//! resumable hash state, plus cross-repo mounts.
//!
//! An upload session is identified by a v4 UUID and owns one storage
//! object. The running SHA-256 state round-trips to the client inside the
//! `state` query parameter of each `Location` URL, so no hash state is
//! held between requests. Any failure after the first written byte aborts
//! the session end-to-end: storage chunks are discarded and the row is
//! deleted.

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use crate::{
    api::v2::{header_string, RequestContext},
    database::queries,
    digest::Digest,
    error::{Error, ErrorCode, RegistryError, Result},
    handlers::ensure_quota,
    hasher::ResumableSha256,
    models::Upload,
    server::AppState,
};

pub const SESSION_ID_HEADER: &str = "blob-upload-session-id";

type Params = std::collections::HashMap<String, String>;

/// `POST /v2/<repo>/blobs/uploads/` — allocate a session, perform a
/// monolithic upload, or mount a blob from another repo of the account.
pub async fn start_upload(
    state: AppState,
    ctx: RequestContext,
    headers: &HeaderMap,
    params: &Params,
    body: Body,
) -> Result<Response> {
    if let (Some(from), Some(mount_digest)) = (params.get("from"), params.get("mount")) {
        return mount_blob(state, ctx, from, mount_digest).await;
    }
    if let Some(digest) = params.get("digest") {
        return monolithic_upload(state, ctx, digest, headers, body).await;
    }

    ensure_quota(&state.database, &ctx.account).await?;

    let uuid = Uuid::new_v4();
    let upload = Upload {
        uuid,
        repo_id: ctx.repo.id,
        storage_id: uuid.to_string(),
        size_bytes: 0,
        digest: String::new(),
        num_chunks: 0,
        updated_at: Utc::now(),
    };
    queries::insert_upload(&state.database, &upload).await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, upload_location(&ctx, &uuid, None))
        .header(header::RANGE, "0-0")
        .header(header::CONTENT_LENGTH, "0")
        .header(SESSION_ID_HEADER, uuid.to_string())
        .body(Body::empty())
        .map_err(response_build_error)?)
}

/// Cross-repo mount within the same account. Mounting across accounts is
/// forbidden because blob rows are scoped per account.
async fn mount_blob(
    state: AppState,
    ctx: RequestContext,
    from: &str,
    mount_digest: &str,
) -> Result<Response> {
    let digest: Digest = mount_digest.parse()?;

    let source_repo_name = from
        .strip_prefix(&format!("{}/", ctx.account.name))
        .ok_or_else(|| {
            RegistryError::unsupported("cannot mount blobs across accounts")
        })?;

    let source_repo = queries::get_repo(&state.database, &ctx.account.name, source_repo_name)
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::BlobUnknown))?;
    let blob = queries::get_blob_in_repo(&state.database, &source_repo.id, &digest.to_string())
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::BlobUnknown))?;

    queries::mount_blob(&state.database, &blob.id, &ctx.repo.id).await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, blob_location(&ctx, &digest))
        .header(header::CONTENT_LENGTH, "0")
        .header("docker-content-digest", digest.to_string())
        .body(Body::empty())
        .map_err(response_build_error)?)
}

/// Single-request upload: stream into storage while hashing, then verify
/// length and digest before committing.
async fn monolithic_upload(
    state: AppState,
    ctx: RequestContext,
    digest_param: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response> {
    ensure_quota(&state.database, &ctx.account).await?;
    let expected: Digest = digest_param.parse()?;
    let declared_length = content_length(headers);

    let storage_id = Uuid::new_v4().to_string();
    let mut hasher = ResumableSha256::new();
    let data = read_body_hashed(body, &mut hasher).await?;

    if let Some(declared) = declared_length {
        if declared != data.len() as u64 {
            return Err(RegistryError::size_invalid(format!(
                "Content-Length was {declared} but request body carried {} bytes",
                data.len()
            ))
            .with_status(StatusCode::BAD_REQUEST)
            .into());
        }
    }
    let actual = hasher.digest();
    if actual != expected {
        return Err(RegistryError::digest_invalid(format!(
            "expected digest {expected}, but content hashes to {actual}"
        ))
        .into());
    }

    state
        .storage
        .append_to_blob(&ctx.account.name, &storage_id, 1, data.clone())
        .await
        .map_err(|e| Error::storage(e.to_string()))?;
    if let Err(e) = state
        .storage
        .finalize_blob(&ctx.account.name, &storage_id, 1)
        .await
    {
        let _ = state
            .storage
            .abort_blob_upload(&ctx.account.name, &storage_id, 1)
            .await;
        return Err(Error::storage(e.to_string()));
    }

    commit_and_respond(&state, &ctx, &expected, data.len() as i64, &storage_id).await
}

/// `PATCH /v2/<repo>/blobs/uploads/<uuid>` — append one chunk.
pub async fn patch_upload(
    state: AppState,
    ctx: RequestContext,
    uuid: Uuid,
    headers: &HeaderMap,
    params: &Params,
    body: Body,
) -> Result<Response> {
    let upload = queries::get_upload(&state.database, &ctx.repo.id, &uuid)
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::BlobUploadUnknown))?;

    let mut hasher = resume_hasher(&upload, params.get("state").map(String::as_str))?;

    // Content-Range present means a chunked upload with strict accounting;
    // otherwise the entire body is streamed in as one chunk.
    let expected_chunk_len = match header_string(headers, header::CONTENT_RANGE.as_str()) {
        Some(range) => {
            let (start, end) = parse_content_range(&range)?;
            let length = content_length(headers).ok_or_else(|| {
                RegistryError::size_invalid("chunked upload requires Content-Length")
            })?;
            if start != upload.size_bytes as u64 {
                return Err(RegistryError::size_invalid(format!(
                    "chunk must start at offset {}, not {start}",
                    upload.size_bytes
                ))
                .into());
            }
            if end + 1 - start != length {
                return Err(RegistryError::size_invalid(format!(
                    "Content-Range {start}-{end} disagrees with Content-Length {length}"
                ))
                .into());
            }
            Some(length)
        }
        None => None,
    };

    let data = match read_body_hashed(body, &mut hasher).await {
        Ok(data) => data,
        Err(e) => {
            abort_upload(&state, &ctx.account.name, &upload).await;
            return Err(e);
        }
    };

    if let Some(expected) = expected_chunk_len {
        if data.len() as u64 != expected {
            abort_upload(&state, &ctx.account.name, &upload).await;
            return Err(RegistryError::size_invalid(format!(
                "chunk declared {expected} bytes but carried {}",
                data.len()
            ))
            .into());
        }
    }

    let chunk_number = upload.num_chunks as u32 + 1;
    if let Err(e) = state
        .storage
        .append_to_blob(&ctx.account.name, &upload.storage_id, chunk_number, data.clone())
        .await
    {
        abort_upload(&state, &ctx.account.name, &upload).await;
        return Err(Error::storage(e.to_string()));
    }

    let new_size = upload.size_bytes + data.len() as i64;
    let running_digest = hasher.digest().to_string();
    queries::update_upload(
        &state.database,
        &uuid,
        new_size,
        &running_digest,
        chunk_number as i32,
    )
    .await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(
            header::LOCATION,
            upload_location(&ctx, &uuid, Some(&hasher.marshal())),
        )
        .header(header::RANGE, range_header(new_size))
        .header(header::CONTENT_LENGTH, "0")
        .header(SESSION_ID_HEADER, uuid.to_string())
        .body(Body::empty())
        .map_err(response_build_error)?)
}

/// `PUT /v2/<repo>/blobs/uploads/<uuid>?digest=D` — optionally consume a
/// final chunk, verify the digest, and commit the blob.
pub async fn put_upload(
    state: AppState,
    ctx: RequestContext,
    uuid: Uuid,
    headers: &HeaderMap,
    params: &Params,
    body: Body,
) -> Result<Response> {
    let upload = queries::get_upload(&state.database, &ctx.repo.id, &uuid)
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::BlobUploadUnknown))?;

    let expected: Digest = params
        .get("digest")
        .ok_or_else(|| RegistryError::digest_invalid("digest query parameter is required"))?
        .parse()?;

    let mut hasher = resume_hasher(&upload, params.get("state").map(String::as_str))?;
    let mut num_chunks = upload.num_chunks as u32;
    let mut total_size = upload.size_bytes;

    let has_final_chunk = content_length(headers).map_or(false, |l| l > 0);
    if has_final_chunk {
        let data = match read_body_hashed(body, &mut hasher).await {
            Ok(data) => data,
            Err(e) => {
                abort_upload(&state, &ctx.account.name, &upload).await;
                return Err(e);
            }
        };
        num_chunks += 1;
        total_size += data.len() as i64;
        if let Err(e) = state
            .storage
            .append_to_blob(&ctx.account.name, &upload.storage_id, num_chunks, data)
            .await
        {
            abort_upload(&state, &ctx.account.name, &upload).await;
            return Err(Error::storage(e.to_string()));
        }
    } else if num_chunks == 0 {
        // the storage object must exist even for an empty blob
        if let Err(e) = state
            .storage
            .append_to_blob(&ctx.account.name, &upload.storage_id, 1, Bytes::new())
            .await
        {
            abort_upload(&state, &ctx.account.name, &upload).await;
            return Err(Error::storage(e.to_string()));
        }
        num_chunks = 1;
    }

    let actual = hasher.digest();
    if actual != expected {
        abort_upload(&state, &ctx.account.name, &upload).await;
        return Err(RegistryError::digest_invalid(format!(
            "expected digest {expected}, but uploaded content hashes to {actual}"
        ))
        .into());
    }

    if let Err(e) = state
        .storage
        .finalize_blob(&ctx.account.name, &upload.storage_id, num_chunks)
        .await
    {
        abort_upload(&state, &ctx.account.name, &upload).await;
        return Err(Error::storage(e.to_string()));
    }

    queries::delete_upload(&state.database, &uuid).await?;
    commit_and_respond(&state, &ctx, &expected, total_size, &upload.storage_id).await
}

/// `GET /v2/<repo>/blobs/uploads/<uuid>` — session status probe.
pub async fn get_upload_status(
    state: AppState,
    ctx: RequestContext,
    uuid: Uuid,
    params: &Params,
) -> Result<Response> {
    let upload = queries::get_upload(&state.database, &ctx.repo.id, &uuid)
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::BlobUploadUnknown))?;

    let mut builder = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::RANGE, range_header(upload.size_bytes))
        .header(header::CONTENT_LENGTH, "0")
        .header(SESSION_ID_HEADER, uuid.to_string());

    // A Location is only useful when it carries a usable state: either the
    // upload is still empty, or the caller gave us the state to preserve.
    if upload.num_chunks == 0 {
        builder = builder.header(header::LOCATION, upload_location(&ctx, &uuid, None));
    } else if let Some(given_state) = params.get("state") {
        builder = builder.header(header::LOCATION, upload_location(&ctx, &uuid, Some(given_state)));
    }

    Ok(builder.body(Body::empty()).map_err(response_build_error)?)
}

/// `DELETE /v2/<repo>/blobs/uploads/<uuid>` — abort the session.
pub async fn cancel_upload(state: AppState, ctx: RequestContext, uuid: Uuid) -> Result<Response> {
    let upload = queries::get_upload(&state.database, &ctx.repo.id, &uuid)
        .await?
        .ok_or_else(|| RegistryError::new(ErrorCode::BlobUploadUnknown))?;

    if upload.num_chunks > 0 {
        let _ = state
            .storage
            .abort_blob_upload(&ctx.account.name, &upload.storage_id, upload.num_chunks as u32)
            .await;
    }
    queries::delete_upload(&state.database, &uuid).await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------- helpers

/// Insert-or-reuse the blob row, mount it, and answer 201. When a
/// concurrent upload won the insert race, the loser's storage object is
/// deleted and the surviving row serves both.
async fn commit_and_respond(
    state: &AppState,
    ctx: &RequestContext,
    digest: &Digest,
    size_bytes: i64,
    storage_id: &str,
) -> Result<Response> {
    let commit = match queries::commit_blob(
        &state.database,
        &ctx.account.name,
        &digest.to_string(),
        size_bytes,
        storage_id,
        "",
        &ctx.repo.id,
    )
    .await
    {
        Ok(commit) => commit,
        Err(e) => {
            // the DB commit failed; do not leave the storage object behind
            let _ = state.storage.delete_blob(&ctx.account.name, storage_id).await;
            return Err(e);
        }
    };

    if !commit.inserted && commit.blob.storage_id != storage_id {
        if let Err(e) = state.storage.delete_blob(&ctx.account.name, storage_id).await {
            tracing::warn!(error = %e, "deleting redundant blob object failed");
        }
    }

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, blob_location(ctx, digest))
        .header(header::CONTENT_LENGTH, "0")
        .header("docker-content-digest", digest.to_string())
        .body(Body::empty())
        .map_err(response_build_error)?)
}

/// Restores the running hash from the `state` query parameter, enforcing
/// consistency with the upload row.
fn resume_hasher(upload: &Upload, state_param: Option<&str>) -> Result<ResumableSha256> {
    let state_param = state_param.filter(|s| !s.is_empty());
    if upload.num_chunks == 0 {
        return match state_param {
            None => Ok(ResumableSha256::new()),
            Some(_) => Err(RegistryError::new(ErrorCode::BlobUploadInvalid)
                .with_message("upload has no content yet, but a state was given")
                .into()),
        };
    }

    let state = state_param.ok_or_else(|| {
        RegistryError::new(ErrorCode::BlobUploadInvalid)
            .with_message("state parameter is required to continue this upload")
            .with_status(StatusCode::RANGE_NOT_SATISFIABLE)
    })?;
    let hasher = ResumableSha256::unmarshal(state).map_err(|e| {
        RegistryError::new(ErrorCode::BlobUploadInvalid)
            .with_message(format!("cannot restore hash state: {e}"))
            .with_status(StatusCode::RANGE_NOT_SATISFIABLE)
    })?;

    if hasher.digest().to_string() != upload.digest {
        return Err(RegistryError::new(ErrorCode::BlobUploadInvalid)
            .with_message("hash state does not belong to this upload")
            .into());
    }
    Ok(hasher)
}

/// Streams the request body through the hash and into memory.
async fn read_body_hashed(body: Body, hasher: &mut ResumableSha256) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            RegistryError::new(ErrorCode::BlobUploadInvalid)
                .with_message(format!("reading request body: {e}"))
        })?;
        hasher.update(&chunk);
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Tears the session down end-to-end. Best-effort: an orphaned chunk is
/// swept by the janitor later.
async fn abort_upload(state: &AppState, account_name: &str, upload: &Upload) {
    if upload.num_chunks > 0 || !upload.storage_id.is_empty() {
        if let Err(e) = state
            .storage
            .abort_blob_upload(account_name, &upload.storage_id, upload.num_chunks as u32)
            .await
        {
            tracing::warn!(error = %e, upload = %upload.uuid, "storage abort failed");
        }
    }
    if let Err(e) = queries::delete_upload(&state.database, &upload.uuid).await {
        tracing::warn!(error = %e, upload = %upload.uuid, "deleting upload row failed");
    }
}

fn upload_location(ctx: &RequestContext, uuid: &Uuid, state: Option<&str>) -> String {
    let base = format!("/v2/{}/blobs/uploads/{uuid}", ctx.url_repo_path);
    match state {
        Some(state) => format!("{base}?state={state}"),
        None => base,
    }
}

fn blob_location(ctx: &RequestContext, digest: &Digest) -> String {
    format!("/v2/{}/blobs/{digest}", ctx.url_repo_path)
}

fn range_header(size_bytes: i64) -> String {
    format!("0-{}", (size_bytes - 1).max(0))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_string(headers, header::CONTENT_LENGTH.as_str())?.parse().ok()
}

/// `start-end`, with or without a `bytes=` prefix.
fn parse_content_range(range: &str) -> Result<(u64, u64)> {
    let range = range.strip_prefix("bytes=").unwrap_or(range);
    let malformed =
        || RegistryError::size_invalid(format!("malformed Content-Range header {range:?}"));

    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let start: u64 = start.parse().map_err(|_| malformed())?;
    let end: u64 = end.parse().map_err(|_| malformed())?;
    if start > end {
        return Err(malformed().into());
    }
    Ok((start, end))
}

fn response_build_error(e: axum::http::Error) -> Error {
    Error::Internal(anyhow::anyhow!("building response: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("0-99").unwrap(), (0, 99));
        assert_eq!(parse_content_range("bytes=100-199").unwrap(), (100, 199));
        assert!(parse_content_range("13-10").is_err());
        assert!(parse_content_range("abc").is_err());
        assert!(parse_content_range("-5").is_err());
    }

    #[test]
    fn test_range_header() {
        assert_eq!(range_header(0), "0-0");
        assert_eq!(range_header(1), "0-0");
        assert_eq!(range_header(100), "0-99");
    }

    #[test]
    fn test_resume_hasher_rules() {
        let mut upload = Upload {
            uuid: Uuid::new_v4(),
            repo_id: Uuid::new_v4(),
            storage_id: "s".into(),
            size_bytes: 0,
            digest: String::new(),
            num_chunks: 0,
            updated_at: Utc::now(),
        };

        // fresh upload: no state allowed
        assert!(resume_hasher(&upload, None).is_ok());
        assert!(resume_hasher(&upload, Some("AAAA")).is_err());

        // after a chunk: matching state required
        let mut h = ResumableSha256::new();
        h.update(b"part one");
        upload.num_chunks = 1;
        upload.size_bytes = 8;
        upload.digest = h.digest().to_string();
        let resumed = resume_hasher(&upload, Some(&h.marshal())).unwrap();
        assert_eq!(resumed.digest().to_string(), upload.digest);

        // missing or garbled state after a successful chunk => 416
        let err = resume_hasher(&upload, None).unwrap_err();
        match err {
            Error::Registry(e) => {
                assert_eq!(e.status, StatusCode::RANGE_NOT_SATISFIABLE);
            }
            other => panic!("unexpected error {other:?}"),
        }

        // a state belonging to different content => 400
        let mut other = ResumableSha256::new();
        other.update(b"different");
        let err = resume_hasher(&upload, Some(&other.marshal())).unwrap_err();
        match err {
            Error::Registry(e) => assert_eq!(e.status, StatusCode::BAD_REQUEST),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
