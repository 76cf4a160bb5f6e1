//! In-memory storage driver for tests.

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;

use super::{BlobStream, StorageDriver, StorageError, StorageResult};

pub struct InMemoryDriver {
    blobs: DashMap<String, Vec<u8>>,
    uploads: DashMap<String, Vec<Vec<u8>>>,
    manifests: DashMap<String, Vec<u8>>,
    /// When set, `url_for_blob` returns `<prefix>/<account>/<storage_id>`
    /// instead of failing, so tests can exercise the redirect path.
    presign_prefix: Option<String>,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
            uploads: DashMap::new(),
            manifests: DashMap::new(),
            presign_prefix: None,
        }
    }

    pub fn with_presigned_urls(prefix: &str) -> Self {
        Self {
            presign_prefix: Some(prefix.to_string()),
            ..Self::new()
        }
    }

    fn blob_key(account: &str, storage_id: &str) -> String {
        format!("{account}/{storage_id}")
    }

    fn manifest_key(account: &str, repo: &str, digest: &str) -> String {
        format!("{account}/{repo}/{digest}")
    }

    /// Simulates a writer that appended chunks but never finalized, for
    /// exercising the concurrent-replication path.
    pub fn begin_upload_for_test(&self, account: &str, storage_id: &str) {
        self.uploads
            .insert(Self::blob_key(account, storage_id), vec![]);
    }
}

#[async_trait::async_trait]
impl StorageDriver for InMemoryDriver {
    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> StorageResult<()> {
        let key = Self::blob_key(account, storage_id);
        if chunk_number == 1 {
            if self.uploads.contains_key(&key) {
                return Err(StorageError::UploadInProgress);
            }
            self.uploads.insert(key, vec![data.to_vec()]);
        } else {
            let mut entry = self.uploads.get_mut(&key).ok_or(StorageError::NotFound)?;
            entry.push(data.to_vec());
        }
        Ok(())
    }

    async fn finalize_blob(
        &self,
        account: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> StorageResult<()> {
        let key = Self::blob_key(account, storage_id);
        let (_, chunks) = self.uploads.remove(&key).ok_or(StorageError::NotFound)?;
        if chunks.len() != num_chunks as usize {
            return Err(StorageError::NotFound);
        }
        self.blobs.insert(key, chunks.concat());
        Ok(())
    }

    async fn abort_blob_upload(
        &self,
        account: &str,
        storage_id: &str,
        _num_chunks: u32,
    ) -> StorageResult<()> {
        self.uploads.remove(&Self::blob_key(account, storage_id));
        Ok(())
    }

    async fn delete_blob(&self, account: &str, storage_id: &str) -> StorageResult<()> {
        self.blobs
            .remove(&Self::blob_key(account, storage_id))
            .ok_or(StorageError::NotFound)?;
        Ok(())
    }

    async fn read_blob(&self, account: &str, storage_id: &str) -> StorageResult<(BlobStream, u64)> {
        let data = self
            .blobs
            .get(&Self::blob_key(account, storage_id))
            .ok_or(StorageError::NotFound)?
            .clone();
        let size = data.len() as u64;
        let stream: BlobStream =
            futures::stream::once(async move { Ok(Bytes::from(data)) }).boxed();
        Ok((stream, size))
    }

    async fn url_for_blob(&self, account: &str, storage_id: &str) -> StorageResult<String> {
        match &self.presign_prefix {
            Some(prefix) => Ok(format!("{prefix}/{account}/{storage_id}")),
            None => Err(StorageError::CannotGenerateUrl),
        }
    }

    async fn write_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
        content: &[u8],
    ) -> StorageResult<()> {
        self.manifests
            .insert(Self::manifest_key(account, repo, digest), content.to_vec());
        Ok(())
    }

    async fn read_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
    ) -> StorageResult<Vec<u8>> {
        self.manifests
            .get(&Self::manifest_key(account, repo, digest))
            .map(|v| v.clone())
            .ok_or(StorageError::NotFound)
    }

    async fn delete_manifest(&self, account: &str, repo: &str, digest: &str) -> StorageResult<()> {
        self.manifests
            .remove(&Self::manifest_key(account, repo, digest));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::collect_stream;
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_chunked_write_then_read() {
        let driver = InMemoryDriver::new();
        driver
            .append_to_blob("acct", "s1", 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        driver
            .append_to_blob("acct", "s1", 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        driver.finalize_blob("acct", "s1", 2).await.unwrap();

        let (stream, size) = driver.read_blob("acct", "s1").await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(collect_stream(stream).await, b"hello world");
    }

    #[tokio::test]
    async fn test_concurrent_first_chunk_is_rejected() {
        let driver = InMemoryDriver::new();
        driver
            .append_to_blob("acct", "s1", 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let err = driver
            .append_to_blob("acct", "s1", 1, Bytes::from_static(b"y"))
            .await
            .unwrap_err();
        assert_matches!(err, StorageError::UploadInProgress);
    }

    #[tokio::test]
    async fn test_abort_discards_chunks() {
        let driver = InMemoryDriver::new();
        driver
            .append_to_blob("acct", "s1", 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        driver.abort_blob_upload("acct", "s1", 1).await.unwrap();
        assert!(matches!(
            driver.read_blob("acct", "s1").await,
            Err(StorageError::NotFound)
        ));
        // the id is free for a new upload again
        driver
            .append_to_blob("acct", "s1", 1, Bytes::from_static(b"y"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_presign_knob() {
        let plain = InMemoryDriver::new();
        assert_matches!(
            plain.url_for_blob("acct", "s1").await,
            Err(StorageError::CannotGenerateUrl)
        );

        let presigned = InMemoryDriver::with_presigned_urls("https://cdn.example.org");
        assert_eq!(
            presigned.url_for_blob("acct", "s1").await.unwrap(),
            "https://cdn.example.org/acct/s1"
        );
    }
}
