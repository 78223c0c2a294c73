//! Volume reader over an object store.
//!
//! An experiment lives under `<root>/<collection>/<experiment>/`:
//!
//! ```text
//! experiment.json   {"extent": [z, y, x], "voxel_size": [..], "channels": {"em": {"datatype": "uint16"}}}
//! em.raw            little-endian, row-major (z, y, x), stored in the channel's encoding
//! ```
//!
//! A channel's `encoding` defaults to its `datatype`. Cutouts are returned in
//! the encoding type and read with coalesced byte-range requests.

use crate::error::{Error, Result};
use crate::io::source::{ChannelInfo, Connector, DataSource, DatasetExtent};
use crate::tiling::Extent;
use crate::voxel::{ChannelArray, VoxelType};
use bytes::{Bytes, BytesMut};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::OnceCell;

const MANIFEST_NAME: &str = "experiment.json";

/// Contents of `experiment.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentManifest {
    /// Exclusive max per axis (z, y, x)
    pub extent: [usize; 3],

    #[serde(default)]
    pub voxel_size: Option<[f64; 3]>,

    pub channels: BTreeMap<String, ChannelManifest>,
}

/// Per-channel entry of the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelManifest {
    /// Native element type
    pub datatype: VoxelType,

    /// Element type of the stored bytes (defaults to `datatype`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<VoxelType>,
}

impl ChannelManifest {
    pub fn encoding(&self) -> VoxelType {
        self.encoding.unwrap_or(self.datatype)
    }
}

/// Path of an experiment directory below a store prefix.
pub fn experiment_path(prefix: &Path, collection: &str, experiment: &str) -> Path {
    prefix.child(collection).child(experiment)
}

/// A `DataSource` reading one experiment from an object store.
#[derive(Debug)]
pub struct StoreSource {
    store: Arc<dyn ObjectStore>,
    root: Path,
    manifest: OnceCell<ExperimentManifest>,
}

impl StoreSource {
    pub fn new(store: Arc<dyn ObjectStore>, root: Path) -> Self {
        Self {
            store,
            root,
            manifest: OnceCell::new(),
        }
    }

    /// Load (once) and return the experiment manifest.
    pub async fn manifest(&self) -> Result<&ExperimentManifest> {
        self.manifest
            .get_or_try_init(|| async {
                let path = self.root.child(MANIFEST_NAME);
                let bytes = self.store.get(&path).await?.bytes().await?;
                let manifest: ExperimentManifest = serde_json::from_slice(&bytes)?;
                tracing::debug!(
                    "Loaded manifest {} ({} channels, extent {:?})",
                    path,
                    manifest.channels.len(),
                    manifest.extent
                );
                Ok::<_, Error>(manifest)
            })
            .await
    }
}

impl DataSource for StoreSource {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let manifest = self.manifest().await?;
        Ok(manifest
            .channels
            .iter()
            .map(|(name, c)| ChannelInfo {
                name: name.clone(),
                datatype: c.datatype,
            })
            .collect())
    }

    async fn dataset_extent(&self) -> Result<DatasetExtent> {
        let manifest = self.manifest().await?;
        let mut extent = DatasetExtent::new(manifest.extent);
        if let Some(voxel_size) = manifest.voxel_size {
            extent.voxel_size = voxel_size;
        }
        Ok(extent)
    }

    async fn cutout(&self, channel: &ChannelInfo, extent: &Extent) -> Result<ChannelArray> {
        let manifest = self.manifest().await?;
        let entry = manifest
            .channels
            .get(&channel.name)
            .ok_or_else(|| Error::fetch(&channel.name, "channel not in manifest"))?;
        let encoding = entry.encoding();

        let [mz, my, mx] = manifest.extent;
        if extent.z.end > mz || extent.y.end > my || extent.x.end > mx {
            return Err(Error::fetch(
                &channel.name,
                format!("cutout {} outside dataset {:?}", extent, manifest.extent),
            ));
        }
        if extent.num_voxels() == 0 {
            return Ok(ChannelArray::zeros(encoding, extent.shape()));
        }

        let ranges = row_ranges(extent, manifest.extent, encoding.byte_size());
        let path = self.root.child(format!("{}.raw", channel.name));
        let parts = self.store.get_ranges(&path, &ranges).await?;

        let bytes = concat(parts);
        ChannelArray::from_le_bytes(encoding, extent.shape(), &bytes)
    }
}

/// Byte ranges covering `extent`, one per (z, y) row, with touching rows merged.
fn row_ranges(extent: &Extent, dataset: [usize; 3], elem_size: usize) -> Vec<Range<u64>> {
    let [_, dy, dx] = dataset;
    let row_len = (extent.x.len() * elem_size) as u64;
    let mut ranges: Vec<Range<u64>> = Vec::new();

    for z in extent.z.as_range() {
        for y in extent.y.as_range() {
            let start = (((z * dy + y) * dx + extent.x.start) * elem_size) as u64;
            let end = start + row_len;
            match ranges.last_mut() {
                Some(last) if last.end == start => last.end = end,
                _ => ranges.push(start..end),
            }
        }
    }
    ranges
}

fn concat(parts: Vec<Bytes>) -> Bytes {
    if parts.len() == 1 {
        return parts.into_iter().next().unwrap_or_default();
    }
    let mut buf = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
    for part in parts {
        buf.extend_from_slice(&part);
    }
    buf.freeze()
}

/// Write an experiment (manifest plus one raw object per channel).
///
/// Volumes are stored in `encoding` when given, else their own type.
pub async fn publish_experiment(
    store: &dyn ObjectStore,
    root: &Path,
    volumes: &BTreeMap<String, ChannelArray>,
    encoding: Option<VoxelType>,
) -> Result<ExperimentManifest> {
    let extent = volumes.values().next().map(ChannelArray::shape).unwrap_or([0, 0, 0]);
    let mut channels = BTreeMap::new();

    for (name, volume) in volumes {
        if volume.shape() != extent {
            return Err(Error::ShapeMismatch {
                context: format!("publishing channel '{}'", name),
                expected: extent.to_vec(),
                actual: volume.shape().to_vec(),
            });
        }
        let stored = match encoding {
            Some(t) => volume.cast(t),
            None => volume.clone(),
        };
        let path = root.child(format!("{}.raw", name));
        store.put(&path, PutPayload::from(stored.to_le_bytes())).await?;
        channels.insert(
            name.clone(),
            ChannelManifest {
                datatype: volume.voxel_type(),
                encoding: encoding.filter(|t| *t != volume.voxel_type()),
            },
        );
    }

    let manifest = ExperimentManifest {
        extent,
        voxel_size: None,
        channels,
    };
    let json = serde_json::to_vec_pretty(&manifest)?;
    store
        .put(&root.child(MANIFEST_NAME), PutPayload::from(json))
        .await?;
    Ok(manifest)
}

/// Opens a `StoreSource` per worker over a shared client.
#[derive(Debug, Clone)]
pub struct StoreConnector {
    store: Arc<dyn ObjectStore>,
    root: Path,
}

impl StoreConnector {
    pub fn new(store: Arc<dyn ObjectStore>, root: Path) -> Self {
        Self { store, root }
    }
}

impl Connector for StoreConnector {
    type Source = StoreSource;

    fn connect(&self) -> Result<StoreSource> {
        Ok(StoreSource::new(self.store.clone(), self.root.clone()))
    }
}
