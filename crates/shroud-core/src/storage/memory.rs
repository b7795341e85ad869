use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};
use std::sync::Mutex;

use shroud_types::{Result, ShroudError};

use super::{ByteRange, ObjectInfo, ObjectStore, StoredObject};

/// In-memory object store. Backs the integration tests and any embedding
/// that wants a hermetic backend; thread-safe via a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), StoredEntry>>,
}

struct StoredEntry {
    data: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

fn not_found(bucket: &str, key: &str) -> ShroudError {
    ShroudError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such object: {bucket}/{key}"),
    ))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)?;
        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredEntry {
                data,
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<StoredObject> {
        let objects = self.objects.lock().unwrap();
        let entry = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| not_found(bucket, key))?;

        let data = match range {
            Some(range) => {
                let start = (range.start as usize).min(entry.data.len());
                let end = ((range.end + 1) as usize).min(entry.data.len());
                entry.data[start..end].to_vec()
            }
            None => entry.data.clone(),
        };
        Ok(StoredObject {
            content_length: data.len() as u64,
            body: Box::new(io::Cursor::new(data)),
            metadata: entry.metadata.clone(),
        })
    }

    fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        let objects = self.objects.lock().unwrap();
        let entry = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| not_found(bucket, key))?;
        Ok(ObjectInfo {
            content_length: entry.data.len() as u64,
            metadata: entry.metadata.clone(),
        })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
