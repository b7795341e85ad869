pub mod memory;

use std::collections::BTreeMap;
use std::io::Read;

use shroud_types::Result;

/// Inclusive encrypted byte range for a partial GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false // inclusive ranges always cover at least one byte
    }
}

/// Object attributes returned by `head`.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub content_length: u64,
    pub metadata: BTreeMap<String, String>,
}

/// An object body plus its metadata, as returned by `get`.
pub struct StoredObject {
    pub body: Box<dyn Read + Send>,
    pub content_length: u64,
    pub metadata: BTreeMap<String, String>,
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject")
            .field("body", &"<stream>")
            .field("content_length", &self.content_length)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Backend object-store client consumed by the engine.
///
/// Provider selection, addressing style, signing, and endpoint rules all
/// live behind this trait; the decrypt path only requires that `get` with
/// a range returns exactly the requested bytes when the object covers
/// them.
pub trait ObjectStore: Send + Sync {
    /// Store an object, draining `body`. Overwrites any existing object.
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Fetch an object, optionally restricted to an encrypted byte range.
    /// A range reaching past the end of the object is truncated to the
    /// available bytes.
    fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<StoredObject>;

    /// Fetch attributes without the body.
    fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo>;

    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// List keys under a prefix, lexicographically ordered.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}
