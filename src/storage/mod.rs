//! Storage driver contract.
//!
//! Blob and manifest bytes live behind this trait; the metadata store only
//! records `storage_id`s. Production deployments plug an object store in
//! here, the filesystem driver serves single-node setups, and the
//! in-memory driver backs the test suite.

use bytes::Bytes;
use futures::stream::BoxStream;

pub mod filesystem;
pub mod inmemory;

pub use filesystem::FilesystemDriver;
pub use inmemory::InMemoryDriver;

pub type BlobStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found in storage")]
    NotFound,
    /// Another writer currently holds this storage id. Arbitration for
    /// concurrent first-pull replication relies on this signal.
    #[error("upload already in progress for this object")]
    UploadInProgress,
    #[error("this driver cannot generate pre-signed URLs")]
    CannotGenerateUrl,
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Byte-level blob/manifest persistence.
///
/// Chunk numbers start at 1 and must arrive in order within one upload.
/// `finalize_blob` is atomic: the object becomes readable only after it
/// returns, and a second writer racing on the same `storage_id` fails with
/// [`StorageError::UploadInProgress`] at its first append.
#[async_trait::async_trait]
pub trait StorageDriver: Send + Sync {
    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> StorageResult<()>;

    async fn finalize_blob(
        &self,
        account: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> StorageResult<()>;

    async fn abort_blob_upload(
        &self,
        account: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> StorageResult<()>;

    async fn delete_blob(&self, account: &str, storage_id: &str) -> StorageResult<()>;

    async fn read_blob(&self, account: &str, storage_id: &str) -> StorageResult<(BlobStream, u64)>;

    /// A URL clients can fetch the blob from directly, when the backend
    /// supports pre-signing.
    async fn url_for_blob(&self, account: &str, storage_id: &str) -> StorageResult<String>;

    async fn write_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
        content: &[u8],
    ) -> StorageResult<()>;

    async fn read_manifest(&self, account: &str, repo: &str, digest: &str)
        -> StorageResult<Vec<u8>>;

    async fn delete_manifest(&self, account: &str, repo: &str, digest: &str) -> StorageResult<()>;
}

/// Collects a blob stream into memory; test helper.
#[cfg(test)]
pub async fn collect_stream(stream: BlobStream) -> Vec<u8> {
    use futures::StreamExt;
    let mut out = Vec::new();
    let mut stream = stream;
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.expect("stream chunk failed"));
    }
    out
}
