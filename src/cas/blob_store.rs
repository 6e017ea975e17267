use super::digest::Digest;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A content-addressed blob backend. Implementations back the CAS client
/// described in §4.1: `put`/`get`/`exists` plus batched variants any
/// transport can override for fewer round-trips.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether a blob is already present.
    async fn contains(&self, digest: &Digest) -> Result<bool>;

    /// Fetch a blob's content. Errors if absent.
    async fn get(&self, digest: &Digest) -> Result<Bytes>;

    /// Store content, returning its digest. Implementations must treat a
    /// write of already-present content as a no-op (dedup on put).
    async fn put(&self, content: Bytes) -> Result<Digest>;

    /// Batch existence check. Default sequential; override for a real
    /// batch round-trip where the backend supports one.
    async fn contains_many(&self, digests: &[Digest]) -> Result<Vec<bool>> {
        let mut results = Vec::with_capacity(digests.len());
        for digest in digests {
            results.push(self.contains(digest).await?);
        }
        Ok(results)
    }

    /// Batch fetch. Default sequential.
    async fn get_many(&self, digests: &[Digest]) -> Result<Vec<Bytes>> {
        let mut results = Vec::with_capacity(digests.len());
        for digest in digests {
            results.push(self.get(digest).await?);
        }
        Ok(results)
    }

    /// Batch upload. Default sequential.
    async fn put_many(&self, contents: Vec<Bytes>) -> Result<Vec<Digest>> {
        let mut results = Vec::with_capacity(contents.len());
        for content in contents {
            results.push(self.put(content).await?);
        }
        Ok(results)
    }
}

/// Deduplicated-upload algorithm from §4.1: hash everything, ask the store
/// which digests are missing, and only upload those. Returns the digests in
/// the same order as `contents`.
pub async fn put_deduplicated(
    store: &dyn BlobStore,
    contents: Vec<Bytes>,
) -> Result<Vec<Digest>> {
    let digests: Vec<Digest> = contents.iter().map(|c| Digest::from_content(c)).collect();
    let present = store.contains_many(&digests).await?;

    for (content, (digest, already_present)) in contents
        .into_iter()
        .zip(digests.iter().zip(present.iter()))
    {
        if !*already_present {
            let uploaded = store.put(content).await?;
            debug_assert_eq!(&uploaded, digest);
        }
    }

    Ok(digests)
}


#[cfg(test)]
mod tests {
    use super::test_double::MemoryBlobStore;
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryBlobStore::new();
        let content = Bytes::from("hello world");
        let digest = store.put(content.clone()).await.unwrap();
        assert_eq!(store.get(&digest).await.unwrap(), content);
    }

    #[tokio::test]
    async fn deduplicated_upload_skips_present_blobs() {
        let store = MemoryBlobStore::new();
        let a = Bytes::from("a");
        let b = Bytes::from("b");
        let c = Bytes::from("c");

        store.put(b.clone()).await.unwrap();
        assert_eq!(*store.put_count.lock().unwrap(), 1);

        let digests = put_deduplicated(&store, vec![a, b, c]).await.unwrap();
        assert_eq!(digests.len(), 3);
        // b was already present, so only a and c triggered new uploads.
        assert_eq!(*store.put_count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn contains_many_reports_per_digest_presence() {
        let store = MemoryBlobStore::new();
        let d1 = store.put(Bytes::from("blob1")).await.unwrap();
        let d2 = Digest::from_content(b"never uploaded");

        let results = store.contains_many(&[d1, d2]).await.unwrap();
        assert_eq!(results, vec![true, false]);
    }
}
