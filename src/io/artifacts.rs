//! Per-block artifact sink.
//!
//! Each successful block writes one JSON object named by its key
//! (`<prefix>/<z>_<y>_<x>`). Re-running a block overwrites its artifact.

use crate::error::Result;
use crate::tiling::BlockKey;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    /// Location of the artifact for `key`.
    pub fn location(&self, key: &BlockKey) -> Path {
        self.prefix.child(key.to_string())
    }

    /// Serialize and write `output` for `key`. Returns the written size in bytes.
    pub async fn persist<R: Serialize>(&self, key: &BlockKey, output: &R) -> Result<(Path, usize)> {
        let location = self.location(key);
        let json = serde_json::to_vec(output)?;
        let size = json.len();
        self.store.put(&location, PutPayload::from(json)).await?;
        tracing::debug!("Persisted block {} to {} ({} bytes)", key, location, size);
        Ok((location, size))
    }

    /// Read back one artifact.
    pub async fn load<R: DeserializeOwned>(&self, key: &BlockKey) -> Result<R> {
        let bytes = self.store.get(&self.location(key)).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Keys of every artifact directly under the prefix.
    /// Objects whose name is not a key, and anything in nested directories, are ignored.
    pub async fn keys(&self) -> Result<Vec<BlockKey>> {
        let listing = self.store.list_with_delimiter(Some(&self.prefix)).await?;
        let mut keys: Vec<BlockKey> = listing
            .objects
            .iter()
            .filter_map(|meta| {
                let key: BlockKey = meta.location.filename()?.parse().ok()?;
                (self.location(&key) == meta.location).then_some(key)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Load every artifact under the prefix.
    pub async fn load_all<R: DeserializeOwned>(&self) -> Result<BTreeMap<BlockKey, R>> {
        let mut out = BTreeMap::new();
        for key in self.keys().await? {
            out.insert(key, self.load(&key).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_persist_and_load() {
        let artifacts = ArtifactStore::new(Arc::new(InMemory::new()), Path::from("runs/1"));
        let key = BlockKey::new(10, 0, 1000);

        let (location, size) = artifacts.persist(&key, &vec![1u32, 2, 3]).await.unwrap();
        assert_eq!(location.as_ref(), "runs/1/10_0_1000");
        assert_eq!(size, 7);

        let back: Vec<u32> = artifacts.load(&key).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_persist_overwrites() {
        let artifacts = ArtifactStore::new(Arc::new(InMemory::new()), Path::default());
        let key = BlockKey::new(0, 0, 0);
        artifacts.persist(&key, &1).await.unwrap();
        artifacts.persist(&key, &2).await.unwrap();

        assert_eq!(artifacts.keys().await.unwrap(), vec![key]);
        assert_eq!(artifacts.load::<i32>(&key).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_load_all_ignores_foreign_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        store
            .put(&Path::from("out/README"), PutPayload::from_static(b"hi"))
            .await
            .unwrap();

        let artifacts = ArtifactStore::new(store, Path::from("out"));
        artifacts.persist(&BlockKey::new(20, 0, 0), &"c").await.unwrap();
        artifacts.persist(&BlockKey::new(0, 0, 0), &"a").await.unwrap();

        let all: BTreeMap<BlockKey, String> = artifacts.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&BlockKey::new(0, 0, 0)], "a");
        assert_eq!(all[&BlockKey::new(20, 0, 0)], "c");
    }

    #[tokio::test]
    async fn test_keys_skip_nested_and_non_canonical_names() {
        let store = Arc::new(InMemory::new());
        for stray in ["out/old_run/5_0_0", "out/+7_0_0", "out/007_0_0"] {
            store
                .put(&Path::from(stray), PutPayload::from_static(b"\"stale\""))
                .await
                .unwrap();
        }

        let artifacts = ArtifactStore::new(store, Path::from("out"));
        artifacts.persist(&BlockKey::new(0, 0, 0), &"fresh").await.unwrap();

        assert_eq!(artifacts.keys().await.unwrap(), vec![BlockKey::new(0, 0, 0)]);
        let all: BTreeMap<BlockKey, String> = artifacts.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&BlockKey::new(0, 0, 0)], "fresh");
    }
}
