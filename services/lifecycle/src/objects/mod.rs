//! Blob storage holding uploaded photos.

mod memory;
mod s3;

pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

use crate::error::Result;
use async_trait::async_trait;

/// Result of deleting an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Nothing was stored under the key; deleting is a no-op
    AlreadyAbsent,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket or namespace name
    fn bucket(&self) -> &str;

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<DeleteOutcome>;

    async fn object_exists(&self, key: &str) -> Result<bool>;
}

/// Content type for an object key, derived from its extension
pub fn content_type_for_key(key: &str) -> &'static str {
    let extension = crate::messages::file_extension(key);
    match extension.as_str() {
        ".jpeg" | ".jpg" => "image/jpeg",
        ".png" => "image/png",
        ".webp" => "image/webp",
        ".gif" => "image/gif",
        _ => "application/octet-stream",
    }
}
