use super::blob_store::BlobStore;
use super::digest::Digest;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::sync::Arc;

/// Stacks several `BlobStore`s into one: reads fall back tier by tier, writes
/// go to every tier, and a hit in a slower tier gets promoted into the
/// faster ones. Matches the "several read endpoints, one write target"
/// behavior §4.1 asks for when a local cache sits in front of a remote CAS.
pub struct LayeredBlobStore {
    /// Fastest first, guaranteed non-empty.
    tiers: Vec<Arc<dyn BlobStore>>,
    auto_promote: bool,
}

impl LayeredBlobStore {
    pub fn new(tiers: Vec<Arc<dyn BlobStore>>) -> Result<Self> {
        if tiers.is_empty() {
            anyhow::bail!("LayeredBlobStore requires at least one tier");
        }
        Ok(Self {
            tiers,
            auto_promote: true,
        })
    }

    pub fn with_options(tiers: Vec<Arc<dyn BlobStore>>, auto_promote: bool) -> Result<Self> {
        if tiers.is_empty() {
            anyhow::bail!("LayeredBlobStore requires at least one tier");
        }
        Ok(Self { tiers, auto_promote })
    }

    async fn promote(&self, digest: &Digest, content: &Bytes, found_tier: usize) {
        if !self.auto_promote || found_tier == 0 {
            return;
        }
        let tasks = self.tiers[..found_tier].iter().map(|tier| {
            let tier = Arc::clone(tier);
            let content = content.clone();
            async move {
                if let Err(e) = tier.put(content).await {
                    warn!("failed to promote blob to faster tier: {e}");
                }
            }
        });
        futures_util::future::join_all(tasks).await;
        debug!("promoted blob {digest} from tier {found_tier} to faster tiers");
    }
}

#[async_trait]
impl BlobStore for LayeredBlobStore {
    async fn contains(&self, digest: &Digest) -> Result<bool> {
        for tier in &self.tiers {
            if tier.contains(digest).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        for (tier_idx, tier) in self.tiers.iter().enumerate() {
            match tier.get(digest).await {
                Ok(content) => {
                    debug!("blob {digest} found in tier {tier_idx} ({} bytes)", content.len());
                    self.promote(digest, &content, tier_idx).await;
                    return Ok(content);
                }
                Err(e) => {
                    debug!("blob {digest} not in tier {tier_idx}: {e}");
                    continue;
                }
            }
        }
        anyhow::bail!("blob {digest} not found in any of {} tiers", self.tiers.len())
    }

    async fn put(&self, content: Bytes) -> Result<Digest> {
        let digest = Digest::from_content(&content);
        let writes = self.tiers.iter().map(|tier| {
            let tier = Arc::clone(tier);
            let content = content.clone();
            async move { tier.put(content).await }
        });
        let results = futures_util::future::join_all(writes).await;

        let any_success = results.iter().enumerate().fold(false, |acc, (idx, r)| {
            if let Err(e) = r {
                warn!("failed to write to tier {idx}: {e}");
            }
            acc || r.is_ok()
        });
        if !any_success {
            anyhow::bail!("all tier writes failed for blob {digest}");
        }
        Ok(digest)
    }

    async fn contains_many(&self, digests: &[Digest]) -> Result<Vec<bool>> {
        let mut results = vec![false; digests.len()];
        for tier in &self.tiers {
            let tier_results = tier.contains_many(digests).await?;
            for (i, found) in tier_results.iter().enumerate() {
                if *found {
                    results[i] = true;
                }
            }
            if results.iter().all(|&r| r) {
                break;
            }
        }
        Ok(results)
    }

    async fn get_many(&self, digests: &[Digest]) -> Result<Vec<Bytes>> {
        let mut results: Vec<Option<Bytes>> = vec![None; digests.len()];
        let mut remaining: Vec<usize> = (0..digests.len()).collect();

        for (tier_idx, tier) in self.tiers.iter().enumerate() {
            if remaining.is_empty() {
                break;
            }
            let current: Vec<Digest> = remaining.iter().map(|&i| digests[i].clone()).collect();

            match tier.get_many(&current).await {
                Ok(contents) if contents.len() == current.len() => {
                    for (pos, content) in remaining.iter().zip(contents.into_iter()) {
                        self.promote(&digests[*pos], &content, tier_idx).await;
                        results[*pos] = Some(content);
                    }
                    remaining.clear();
                }
                Ok(_) | Err(_) => continue,
            }
        }

        if remaining.is_empty() {
            Ok(results.into_iter().map(|c| c.unwrap()).collect())
        } else {
            anyhow::bail!("some blobs not found in any tier")
        }
    }

    async fn put_many(&self, contents: Vec<Bytes>) -> Result<Vec<Digest>> {
        let writes = self.tiers.iter().map(|tier| {
            let tier = Arc::clone(tier);
            let contents = contents.clone();
            async move { tier.put_many(contents).await }
        });
        let results = futures_util::future::join_all(writes).await;

        let mut first_success = None;
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Ok(digests) if first_success.is_none() => first_success = Some(digests),
                Ok(_) => {}
                Err(e) => warn!("failed to write batch to tier {idx}: {e}"),
            }
        }
        first_success.ok_or_else(|| anyhow::anyhow!("all tier writes failed for batch"))
    }
}
