//! Filesystem storage driver.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/<account>/blobs/<storage_id>            finalized blobs
//! <root>/<account>/uploads/<storage_id>/<n>      in-flight chunks
//! <root>/<account>/manifests/<repo>/<digest>     raw manifest bytes
//! ```
//!
//! A blob becomes readable only when `finalize_blob` has concatenated its
//! chunks and renamed the result into `blobs/`; the rename is the atomic
//! commit point.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use dashmap::DashSet;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{BlobStream, StorageDriver, StorageError, StorageResult};

pub struct FilesystemDriver {
    root: PathBuf,
    /// Storage ids with an append in flight in this process. Lets a racing
    /// first append fail fast instead of mixing chunks into a directory
    /// another writer owns.
    in_flight: DashSet<String>,
}

impl FilesystemDriver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            in_flight: DashSet::new(),
        }
    }

    fn blob_path(&self, account: &str, storage_id: &str) -> PathBuf {
        self.root.join(account).join("blobs").join(storage_id)
    }

    fn upload_dir(&self, account: &str, storage_id: &str) -> PathBuf {
        self.root.join(account).join("uploads").join(storage_id)
    }

    fn manifest_path(&self, account: &str, repo: &str, digest: &str) -> PathBuf {
        self.root
            .join(account)
            .join("manifests")
            .join(repo)
            .join(digest)
    }

    fn flight_key(account: &str, storage_id: &str) -> String {
        format!("{account}/{storage_id}")
    }
}

#[async_trait::async_trait]
impl StorageDriver for FilesystemDriver {
    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_number: u32,
        data: Bytes,
    ) -> StorageResult<()> {
        let dir = self.upload_dir(account, storage_id);
        if chunk_number == 1 {
            if !self.in_flight.insert(Self::flight_key(account, storage_id)) {
                return Err(StorageError::UploadInProgress);
            }
            if tokio::fs::try_exists(&dir).await? {
                // left behind by another process; not ours to take over
                self.in_flight.remove(&Self::flight_key(account, storage_id));
                return Err(StorageError::UploadInProgress);
            }
            tokio::fs::create_dir_all(&dir).await?;
        } else if !tokio::fs::try_exists(&dir).await? {
            return Err(StorageError::NotFound);
        }

        let mut file = tokio::fs::File::create(dir.join(chunk_number.to_string())).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finalize_blob(
        &self,
        account: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> StorageResult<()> {
        let dir = self.upload_dir(account, storage_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(StorageError::NotFound);
        }

        let final_path = self.blob_path(account, storage_id);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = dir.join("assembled");
        let mut out = tokio::fs::File::create(&tmp_path).await?;
        for n in 1..=num_chunks {
            let chunk = tokio::fs::read(dir.join(n.to_string())).await?;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        drop(out);

        tokio::fs::rename(&tmp_path, &final_path).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        self.in_flight.remove(&Self::flight_key(account, storage_id));
        Ok(())
    }

    async fn abort_blob_upload(
        &self,
        account: &str,
        storage_id: &str,
        _num_chunks: u32,
    ) -> StorageResult<()> {
        let dir = self.upload_dir(account, storage_id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        self.in_flight.remove(&Self::flight_key(account, storage_id));
        Ok(())
    }

    async fn delete_blob(&self, account: &str, storage_id: &str) -> StorageResult<()> {
        let path = self.blob_path(account, storage_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_blob(&self, account: &str, storage_id: &str) -> StorageResult<(BlobStream, u64)> {
        let path = self.blob_path(account, storage_id);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let stream = ReaderStream::new(file).boxed();
        Ok((stream, size))
    }

    async fn url_for_blob(&self, _account: &str, _storage_id: &str) -> StorageResult<String> {
        Err(StorageError::CannotGenerateUrl)
    }

    async fn write_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
        content: &[u8],
    ) -> StorageResult<()> {
        let path = self.manifest_path(account, repo, digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn read_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
    ) -> StorageResult<Vec<u8>> {
        match tokio::fs::read(self.manifest_path(account, repo, digest)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_manifest(&self, account: &str, repo: &str, digest: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.manifest_path(account, repo, digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::collect_stream;
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_blob_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());

        driver
            .append_to_blob("test1", "s1", 1, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        driver
            .append_to_blob("test1", "s1", 2, Bytes::from_static(b"def"))
            .await
            .unwrap();

        // not readable before finalize
        assert!(matches!(
            driver.read_blob("test1", "s1").await,
            Err(StorageError::NotFound)
        ));

        driver.finalize_blob("test1", "s1", 2).await.unwrap();
        let (stream, size) = driver.read_blob("test1", "s1").await.unwrap();
        assert_eq!(size, 6);
        assert_eq!(collect_stream(stream).await, b"abcdef");

        driver.delete_blob("test1", "s1").await.unwrap();
        assert!(matches!(
            driver.read_blob("test1", "s1").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_single_flight_on_first_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());

        driver
            .append_to_blob("test1", "s1", 1, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_matches!(
            driver
                .append_to_blob("test1", "s1", 1, Bytes::from_static(b"xyz"))
                .await,
            Err(StorageError::UploadInProgress)
        );

        driver.abort_blob_upload("test1", "s1", 1).await.unwrap();
        driver
            .append_to_blob("test1", "s1", 1, Bytes::from_static(b"xyz"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_manifest_roundtrip_with_nested_repo() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());

        driver
            .write_manifest("test1", "lib/nested/repo", "sha256:m", b"{}")
            .await
            .unwrap();
        assert_eq!(
            driver
                .read_manifest("test1", "lib/nested/repo", "sha256:m")
                .await
                .unwrap(),
            b"{}"
        );
        driver
            .delete_manifest("test1", "lib/nested/repo", "sha256:m")
            .await
            .unwrap();
        assert_matches!(
            driver.read_manifest("test1", "lib/nested/repo", "sha256:m").await,
            Err(StorageError::NotFound)
        );
    }
}
