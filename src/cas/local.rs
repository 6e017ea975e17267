use super::blob_store::BlobStore;
use super::digest::{Digest, HashAlgorithm};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Local filesystem blob store, sharded by the digest's leading byte so no
/// single directory accumulates every blob.
pub struct LocalBlobStore {
    root: PathBuf,
    algorithm: HashAlgorithm,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            algorithm: HashAlgorithm::Blake3,
        }
    }

    pub async fn init(&self) -> Result<()> {
        let blob_root = self.root.join(self.algorithm.to_string());
        fs::create_dir_all(&blob_root).await?;
        debug!("initialized local blob store at {}", blob_root.display());
        Ok(())
    }

    fn path_for(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(digest.algorithm.to_string())
            .join(digest.shard_prefix())
            .join(digest.hex())
    }

    /// Materialize a blob at `target_path` without copying the bytes
    /// through the caller's process, falling back to a copy on platforms
    /// without hard links.
    pub async fn hardlink_to<P: AsRef<Path>>(&self, digest: &Digest, target_path: P) -> Result<()> {
        let source = self.path_for(digest);
        let target = target_path.as_ref();

        if !source.exists() {
            anyhow::bail!("source blob {digest} does not exist");
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        #[cfg(unix)]
        {
            if fs::hard_link(&source, target).await.is_ok() {
                return Ok(());
            }
        }
        fs::copy(&source, target).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn contains(&self, digest: &Digest) -> Result<bool> {
        Ok(self.path_for(digest).exists())
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        let path = self.path_for(digest);
        if !path.exists() {
            anyhow::bail!("blob not found: {digest}");
        }
        let mut file = fs::File::open(&path).await?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }

    async fn put(&self, content: Bytes) -> Result<Digest> {
        let digest = Digest::from_content_with_algo(&content, self.algorithm.clone());
        let path = self.path_for(&digest);

        if path.exists() {
            debug!("blob {digest} already present, skipping write");
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let suffix: u64 = rand::random();
        let temp_path = path.with_extension(format!("tmp.{suffix}"));
        fs::write(&temp_path, &content).await?;

        if let Err(e) = fs::rename(&temp_path, &path).await {
            if path.exists() {
                let _ = fs::remove_file(&temp_path).await;
            } else {
                return Err(e.into());
            }
        }

        debug!("stored blob {digest} ({} bytes)", content.len());
        Ok(digest)
    }

    async fn contains_many(&self, digests: &[Digest]) -> Result<Vec<bool>> {
        let checks = digests.iter().map(|d| {
            let path = self.path_for(d);
            async move { path.exists() }
        });
        Ok(futures_util::future::join_all(checks).await)
    }

    async fn get_many(&self, digests: &[Digest]) -> Result<Vec<Bytes>> {
        let fetches = digests.iter().map(|d| self.get(d));
        futures_util::future::try_join_all(fetches).await
    }

    async fn put_many(&self, contents: Vec<Bytes>) -> Result<Vec<Digest>> {
        let writes = contents.into_iter().map(|c| self.put(c));
        futures_util::future::try_join_all(writes).await
    }
}
