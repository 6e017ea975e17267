use super::blob_store::BlobStore;
use super::digest::Digest;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{meta::region::RegionProviderChain, BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use log::debug;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// S3-backed blob store, one of the concrete CAS backends behind the
/// vendor-neutral client interface §4.1 and §6 describe.
pub struct S3BlobStore {
    bucket: String,
    client: Client,
    prefix: Option<String>,
    upload_sem: Arc<Semaphore>,
    download_sem: Arc<Semaphore>,
}

impl S3BlobStore {
    pub async fn new(bucket: String, region: Option<String>, prefix: Option<String>) -> Result<Self> {
        let region_provider = match region {
            Some(r) => RegionProviderChain::first_try(Region::new(r)),
            None => RegionProviderChain::default_provider(),
        };
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        let client = Client::new(&config);

        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .context(format!("failed to access S3 bucket '{bucket}'"))?;

        debug!("S3BlobStore initialized for bucket: {bucket}");
        Ok(Self {
            bucket,
            client,
            prefix,
            upload_sem: Arc::new(Semaphore::new(8)),
            download_sem: Arc::new(Semaphore::new(16)),
        })
    }

    fn key_for(&self, digest: &Digest) -> String {
        let key_path = format!("{}/{}/{}", digest.algorithm, digest.shard_prefix(), digest.hex());
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key_path}"),
            None => key_path,
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn contains(&self, digest: &Digest) -> Result<bool> {
        let key = self.key_for(digest);
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let is_not_found = err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false);
                if is_not_found {
                    Ok(false)
                } else {
                    log::warn!("S3 head_object error for {key} (treating as miss): {err}");
                    Ok(false)
                }
            }
        }
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        let _permit = self.download_sem.acquire().await?;
        let key = self.key_for(digest);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .context(format!("failed to get blob {digest} from S3"))?;

        let data = response
            .body
            .collect()
            .await
            .context(format!("failed to read blob {digest} body from S3"))?
            .into_bytes();

        debug!("downloaded blob {digest} from S3 ({} bytes)", data.len());
        Ok(data)
    }

    async fn put(&self, content: Bytes) -> Result<Digest> {
        let _permit = self.upload_sem.acquire().await?;
        let digest = Digest::from_content(&content);

        if self.contains(&digest).await? {
            debug!("blob {digest} already exists in S3, skipping upload");
            return Ok(digest);
        }

        let key = self.key_for(&digest);
        let body = ByteStream::from(content.clone());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .context(format!("failed to upload blob {digest} to S3"))?;

        debug!("uploaded blob {digest} to S3 ({} bytes)", content.len());
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
    #[ignore = "requires AWS credentials and S3 bucket"]
    async fn s3_blob_store_roundtrip() {
        let bucket = std::env::var("TEST_S3_BUCKET").expect("TEST_S3_BUCKET not set");
        let store = S3BlobStore::new(bucket, None, Some("test".to_string()))
            .await
            .expect("failed to create S3BlobStore");

        let content = Bytes::from("test content");
        let digest = store.put(content.clone()).await.expect("put failed");
        assert!(store.contains(&digest).await.expect("contains failed"));
        let retrieved = store.get(&digest).await.expect("get failed");
        assert_eq!(content, retrieved);
    }
}
