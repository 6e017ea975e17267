pub mod blob_store;
pub mod digest;
pub mod gcs;
pub mod http;
pub mod layered;
pub mod local;
pub mod retry;
pub mod s3;

pub use blob_store::{put_deduplicated, BlobStore};
pub use digest::{Digest, HashAlgorithm};
pub use gcs::GcsBlobStore;
pub use http::HttpBlobStore;
pub use layered::LayeredBlobStore;
pub use local::LocalBlobStore;
pub use retry::{with_backoff, Attempt};
pub use s3::S3BlobStore;
