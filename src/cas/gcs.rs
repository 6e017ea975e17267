use super::blob_store::BlobStore;
use super::digest::Digest;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::client::{Storage, StorageControl};
use log::debug;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// GCS-backed blob store, one of the concrete CAS backends behind the
/// vendor-neutral client interface §4.1 and §6 describe.
pub struct GcsBlobStore {
    bucket_path: String,
    storage: Storage,
    control: StorageControl,
    prefix: Option<String>,
    upload_sem: Arc<Semaphore>,
    download_sem: Arc<Semaphore>,
}

impl GcsBlobStore {
    pub async fn new(bucket: String, prefix: Option<String>) -> Result<Self> {
        let storage = Storage::builder()
            .build()
            .await
            .context("failed to create GCS Storage client")?;
        let control = StorageControl::builder()
            .build()
            .await
            .context("failed to create GCS StorageControl client")?;

        let bucket_path = format!("projects/_/buckets/{bucket}");
        debug!("GcsBlobStore initialized for bucket: {bucket}");

        Ok(Self {
            bucket_path,
            storage,
            control,
            prefix,
            upload_sem: Arc::new(Semaphore::new(8)),
            download_sem: Arc::new(Semaphore::new(16)),
        })
    }

    fn object_name(&self, digest: &Digest) -> String {
        let key_path = format!("{}/{}/{}", digest.algorithm, digest.shard_prefix(), digest.hex());
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key_path}"),
            None => key_path,
        }
    }

    fn is_not_found_error(err: &google_cloud_storage::Error) -> bool {
        let s = err.to_string();
        s.contains("404") || s.contains("Not Found") || s.contains("not found") || s.contains("NoSuchKey")
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn contains(&self, digest: &Digest) -> Result<bool> {
        let object_name = self.object_name(digest);
        match self
            .control
            .get_object()
            .set_bucket(&self.bucket_path)
            .set_object(&object_name)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if Self::is_not_found_error(&err) => Ok(false),
            Err(err) => Err(anyhow::anyhow!("{err}")).context(format!("GCS error for {object_name}")),
        }
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        let _permit = self.download_sem.acquire().await?;
        let object_name = self.object_name(digest);

        let mut reader = self
            .storage
            .read_object(&self.bucket_path, &object_name)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context(format!("failed to get blob {digest} from GCS"))?;

        let mut data = Vec::new();
        while let Some(chunk) = reader.next().await {
            let chunk = chunk
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context(format!("failed to read blob {digest} chunk from GCS"))?;
            data.extend_from_slice(&chunk);
        }

        let bytes = Bytes::from(data);
        debug!("downloaded blob {digest} from GCS ({} bytes)", bytes.len());
        Ok(bytes)
    }

    async fn put(&self, content: Bytes) -> Result<Digest> {
        let _permit = self.upload_sem.acquire().await?;
        let digest = Digest::from_content(&content);

        if self.contains(&digest).await? {
            debug!("blob {digest} already exists in GCS, skipping upload");
            return Ok(digest);
        }

        let object_name = self.object_name(&digest);
        self.storage
            .write_object(&self.bucket_path, &object_name, content.clone())
            .send_buffered()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context(format!("failed to upload blob {digest} to GCS"))?;

        debug!("uploaded blob {digest} to GCS ({} bytes)", content.len());
        Ok(digest)
    }

    async fn contains_many(&self, digests: &[Digest]) -> Result<Vec<bool>> {
        let tasks = digests.iter().map(|d| self.contains(d));
        futures_util::future::try_join_all(tasks).await
    }

    async fn get_many(&self, digests: &[Digest]) -> Result<Vec<Bytes>> {
        let tasks = digests.iter().map(|d| self.get(d));
        futures_util::future::try_join_all(tasks).await
    }

    async fn put_many(&self, contents: Vec<Bytes>) -> Result<Vec<Digest>> {
        let tasks = contents.into_iter().map(|c| self.put(c));
        futures_util::future::try_join_all(tasks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires GCS credentials and bucket"]
    async fn gcs_blob_store_roundtrip() {
        let bucket = std::env::var("TEST_GCS_BUCKET").expect("TEST_GCS_BUCKET not set");
        let store = GcsBlobStore::new(bucket, Some("test".to_string()))
            .await
            .expect("failed to create GcsBlobStore");

        let content = Bytes::from("test content");
        let digest = store.put(content.clone()).await.expect("put failed");
        assert!(store.contains(&digest).await.expect("contains failed"));
        let retrieved = store.get(&digest).await.expect("get failed");
        assert_eq!(content, retrieved);
    }
}
