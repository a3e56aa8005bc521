//! Staging bucket access
//!
//! UNLOAD writes each table's shards under `<output_dir>/<table>/`; the
//! downloader only ever lists a prefix and streams objects back.

use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::error::Result;

pub mod s3;

pub use s3::S3Storage;

/// Streamed object body
pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: i64,
    pub e_tag: Option<String>,
}

impl ObjectEntry {
    /// Last path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Console-created "folders" are zero-byte keys ending in `/`
    pub fn is_directory_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object under `prefix`, in listing order
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    async fn get_object(&self, key: &str) -> Result<ObjectBody>;
}
