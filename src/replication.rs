//! First-pull replication.
//!
//! Replica accounts fill themselves lazily: a manifest pull that misses
//! locally fetches from the upstream and records every referenced blob as
//! announced-but-unreplicated; a blob pull that hits such a row streams
//! the bytes from the upstream into storage and to the client at the same
//! time. Concurrency control is delegated to the storage driver: the
//! second replicator of the same blob fails its first append and the
//! client is told to retry.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::{
    database::{queries, Database},
    digest::{is_digest, Digest},
    error::{Error, ErrorCode, RegistryError, Result},
    manifest,
    models::{Account, Blob, Manifest, Repository},
    storage::{BlobStream, StorageDriver, StorageError},
};

/// Seconds clients should wait before retrying a concurrent replication.
pub const RETRY_AFTER_SECS: u32 = 10;

pub struct Replicator {
    client: reqwest::Client,
}

impl Default for Replicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Replicator {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Base URL of the upstream namespace for this account, or None for
    /// non-replica accounts. Peer upstreams mirror the account name;
    /// external upstreams configure their namespace URL directly.
    fn upstream_base(account: &Account, repo: &Repository) -> Option<String> {
        if let Some(peer) = &account.upstream_peer_hostname {
            return Some(format!("https://{}/v2/{}/{}", peer, account.name, repo.name));
        }
        account
            .external_peer_url
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), repo.name))
    }

    fn apply_credentials(
        account: &Account,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match (&account.external_peer_username, &account.external_peer_password) {
            (Some(username), password) => request.basic_auth(username, password.as_deref()),
            _ => request,
        }
    }

    /// Fetches, stores, and indexes a manifest from the upstream. Returns
    /// None when the upstream does not have it either.
    pub async fn replicate_manifest(
        &self,
        db: &Database,
        storage: &dyn StorageDriver,
        account: &Account,
        repo: &Repository,
        reference: &str,
    ) -> Result<Option<(Manifest, Vec<u8>)>> {
        let base = match Self::upstream_base(account, repo) {
            Some(base) => base,
            None => return Ok(None),
        };
        let url = format!("{base}/manifests/{reference}");

        let accept = [
            manifest::DOCKER_MANIFEST,
            manifest::DOCKER_MANIFEST_LIST,
            manifest::OCI_MANIFEST,
            manifest::OCI_INDEX,
        ]
        .join(", ");
        let request = Self::apply_credentials(
            account,
            self.client.get(&url).header(reqwest::header::ACCEPT, accept),
        );

        let response = request.send().await?;
        match response.status().as_u16() {
            200 => {}
            404 => return Ok(None),
            status => return Err(upstream_error(status, "manifest fetch").into()),
        }

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(manifest::DOCKER_MANIFEST)
            .to_string();
        let content = response.bytes().await?.to_vec();
        let digest = Digest::from_bytes(&content);

        // digest-addressed pulls must return exactly the requested bytes
        if is_digest(reference) && reference != digest.to_string() {
            return Err(RegistryError::digest_invalid(
                "upstream returned mismatching manifest content",
            )
            .into());
        }

        let parsed = manifest::parse(&media_type, &content)?;

        // announce every referenced blob; bytes follow on first blob pull
        let mut blob_ids = Vec::new();
        for desc in parsed.blob_descriptors() {
            let blob = queries::announce_blob(
                db,
                &account.name,
                &desc.digest,
                desc.size,
                desc.media_type.as_deref().unwrap_or(""),
                &repo.id,
            )
            .await?;
            blob_ids.push(blob.id);
        }
        let child_digests: Vec<String> =
            parsed.children.iter().map(|d| d.digest.clone()).collect();

        storage
            .write_manifest(&account.name, &repo.name, &digest.to_string(), &content)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        let now = Utc::now();
        let row = Manifest {
            repo_id: repo.id,
            digest: digest.to_string(),
            media_type: media_type.clone(),
            size_bytes: content.len() as i64,
            pushed_at: now,
            validated_at: now,
            last_pulled_at: None,
            min_layer_created_at: None,
            max_layer_created_at: None,
            artifact_type: parsed.artifact_type.clone(),
            subject_digest: parsed.subject.as_ref().map(|s| s.digest.clone()),
            labels_json: None,
            annotations_json: parsed
                .annotations
                .as_ref()
                .map(|a| serde_json::to_string(a))
                .transpose()?,
            vulnerability_status: None,
        };

        let tag_name = (!is_digest(reference)).then(|| reference.to_string());
        queries::insert_manifest(
            db,
            &queries::NewManifest {
                manifest: row.clone(),
                content: content.clone(),
                blob_ids,
                child_digests,
                tag_name,
            },
        )
        .await?;

        Ok(Some((row, content)))
    }

    /// Streams an announced blob from the upstream into storage and to the
    /// caller simultaneously. The storage object only becomes readable
    /// (and the blob row backed) once the upstream stream completes.
    pub async fn replicate_blob(
        &self,
        db: Arc<Database>,
        storage: Arc<dyn StorageDriver>,
        account: &Account,
        repo: &Repository,
        blob: &Blob,
    ) -> Result<(BlobStream, u64)> {
        let base = Self::upstream_base(account, repo)
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("replica account has no upstream")))?;
        let url = format!("{base}/blobs/{}", blob.digest);

        let request = Self::apply_credentials(account, self.client.get(&url));
        let response = request.send().await?;
        match response.status().as_u16() {
            200 => {}
            404 => return Err(RegistryError::new(ErrorCode::BlobUnknown).into()),
            status => return Err(upstream_error(status, "blob fetch").into()),
        }

        let size = response
            .content_length()
            .unwrap_or(blob.size_bytes as u64);

        // replicated blobs are stored under their digest, so concurrent
        // replications collide on the storage id and only one proceeds
        let storage_id = blob.digest.clone();
        let account_name = account.name.clone();
        let blob_id = blob.id;

        let mut upstream = response.bytes_stream();
        let first_chunk = match upstream.next().await {
            None => Bytes::new(),
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(e.into()),
        };

        // claim the storage id before promising the client anything
        match storage
            .append_to_blob(&account_name, &storage_id, 1, first_chunk.clone())
            .await
        {
            Ok(()) => {}
            Err(StorageError::UploadInProgress) => {
                return Err(RegistryError::too_many_requests(RETRY_AFTER_SECS).into());
            }
            Err(e) => return Err(Error::storage(e.to_string())),
        }

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        tokio::spawn(async move {
            let mut num_chunks: u32 = 1;
            let mut total_bytes = first_chunk.len() as u64;
            let _ = tx.send(Ok(first_chunk)).await;

            let failure = loop {
                match upstream.next().await {
                    None => break None,
                    Some(Ok(chunk)) => {
                        num_chunks += 1;
                        total_bytes += chunk.len() as u64;
                        if let Err(e) = storage
                            .append_to_blob(&account_name, &storage_id, num_chunks, chunk.clone())
                            .await
                        {
                            break Some(format!("storage append failed: {e}"));
                        }
                        if tx.send(Ok(chunk)).await.is_err() {
                            break Some("client went away mid-replication".to_string());
                        }
                    }
                    Some(Err(e)) => break Some(format!("upstream read failed: {e}")),
                }
            };

            match failure {
                None => {
                    let committed = async {
                        storage
                            .finalize_blob(&account_name, &storage_id, num_chunks)
                            .await
                            .map_err(|e| Error::storage(e.to_string()))?;
                        queries::set_blob_backing(&db, &blob_id, &storage_id, total_bytes as i64)
                            .await
                    }
                    .await;
                    if let Err(e) = committed {
                        tracing::error!(error = %e, "committing replicated blob failed");
                        let _ = storage.delete_blob(&account_name, &storage_id).await;
                    }
                }
                Some(reason) => {
                    tracing::warn!(reason = %reason, "aborting blob replication");
                    let _ = storage
                        .abort_blob_upload(&account_name, &storage_id, num_chunks)
                        .await;
                    let _ = tx
                        .send(Err(std::io::Error::other(reason)))
                        .await;
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok((stream, size))
    }
}

fn upstream_error(status: u16, operation: &str) -> RegistryError {
    let status = axum::http::StatusCode::from_u16(status)
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    RegistryError::new(ErrorCode::Unknown)
        .with_status(status)
        .with_message(format!("upstream {operation} failed with status {status}"))
}
