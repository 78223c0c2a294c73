//! Data source abstraction: channel catalog, dataset extent and cutouts.

use crate::error::{Error, Result};
use crate::tiling::Extent;
use crate::voxel::{ChannelArray, VoxelType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// A channel as advertised by the data service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub datatype: VoxelType,
}

/// Size of the dataset, used to validate a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetExtent {
    /// Exclusive max per axis (z, y, x)
    pub max: [usize; 3],

    /// Physical voxel size (z, y, x)
    #[serde(default = "default_voxel_size")]
    pub voxel_size: [f64; 3],
}

impl DatasetExtent {
    pub fn new(max: [usize; 3]) -> Self {
        Self {
            max,
            voxel_size: default_voxel_size(),
        }
    }
}

fn default_voxel_size() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

/// Read access to a volumetric dataset.
///
/// A cutout may arrive in a wider transport type than the channel's native
/// type; callers cast it back.
pub trait DataSource: Send + Sync + 'static {
    /// Channels the dataset offers.
    fn list_channels(&self) -> impl Future<Output = Result<Vec<ChannelInfo>>> + Send;

    /// Max extents of the dataset.
    fn dataset_extent(&self) -> impl Future<Output = Result<DatasetExtent>> + Send;

    /// Read `extent` of one channel.
    fn cutout(
        &self,
        channel: &ChannelInfo,
        extent: &Extent,
    ) -> impl Future<Output = Result<ChannelArray>> + Send;
}

/// Opens a fresh `DataSource`. Each worker connects its own.
pub trait Connector: Send + Sync + 'static {
    type Source: DataSource;

    fn connect(&self) -> Result<Self::Source>;
}

/// In-memory dataset, mainly for tests and local experiments.
#[derive(Debug, Clone)]
pub struct MemorySource {
    channels: Arc<BTreeMap<String, ChannelArray>>,
    extent: DatasetExtent,
    transport: Option<VoxelType>,
}

impl MemorySource {
    /// Create a source from named volumes. All volumes must share one shape.
    pub fn new(channels: BTreeMap<String, ChannelArray>) -> Result<Self> {
        let mut shapes = channels.values().map(ChannelArray::shape);
        let shape = shapes.next().unwrap_or([0, 0, 0]);
        if let Some(other) = shapes.find(|s| *s != shape) {
            return Err(Error::ShapeMismatch {
                context: "memory source channels".to_string(),
                expected: shape.to_vec(),
                actual: other.to_vec(),
            });
        }
        Ok(Self {
            channels: Arc::new(channels),
            extent: DatasetExtent::new(shape),
            transport: None,
        })
    }

    /// Serve every cutout in `transport` instead of the native type.
    pub fn with_transport(mut self, transport: VoxelType) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl DataSource for MemorySource {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        Ok(self
            .channels
            .iter()
            .map(|(name, arr)| ChannelInfo {
                name: name.clone(),
                datatype: arr.voxel_type(),
            })
            .collect())
    }

    async fn dataset_extent(&self) -> Result<DatasetExtent> {
        Ok(self.extent)
    }

    async fn cutout(&self, channel: &ChannelInfo, extent: &Extent) -> Result<ChannelArray> {
        let volume = self
            .channels
            .get(&channel.name)
            .ok_or_else(|| Error::fetch(&channel.name, "no such channel"))?;

        let [mz, my, mx] = self.extent.max;
        if extent.z.end > mz || extent.y.end > my || extent.x.end > mx {
            return Err(Error::fetch(
                &channel.name,
                format!("cutout {} outside dataset {:?}", extent, self.extent.max),
            ));
        }

        let data = volume.slice(extent.z.as_range(), extent.y.as_range(), extent.x.as_range());
        Ok(match self.transport {
            Some(t) => data.cast(t),
            None => data,
        })
    }
}

/// Connector that hands out clones of one `MemorySource`.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    source: MemorySource,
}

impl MemoryConnector {
    pub fn new(source: MemorySource) -> Self {
        Self { source }
    }
}

impl Connector for MemoryConnector {
    type Source = MemorySource;

    fn connect(&self) -> Result<MemorySource> {
        Ok(self.source.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn source() -> MemorySource {
        let mut channels = BTreeMap::new();
        channels.insert(
            "em".to_string(),
            ChannelArray::Uint16(Array3::from_shape_fn([4, 6, 8], |(z, y, x)| (z * 100 + y * 10 + x) as u16)),
        );
        channels.insert("mask".to_string(), ChannelArray::Uint8(Array3::ones([4, 6, 8])));
        MemorySource::new(channels).unwrap()
    }

    #[tokio::test]
    async fn test_memory_source_catalog() {
        let src = source();
        let channels = src.list_channels().await.unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].name, "em");
        assert_eq!(channels[0].datatype, VoxelType::Uint16);
        assert_eq!(src.dataset_extent().await.unwrap().max, [4, 6, 8]);
    }

    #[tokio::test]
    async fn test_memory_source_cutout_with_transport() {
        let src = source().with_transport(VoxelType::Float64);
        let info = ChannelInfo {
            name: "em".to_string(),
            datatype: VoxelType::Uint16,
        };
        let extent = Extent::from_ranges((1, 3), (2, 4), (5, 8)).unwrap();
        let arr = src.cutout(&info, &extent).await.unwrap();
        assert_eq!(arr.voxel_type(), VoxelType::Float64);
        assert_eq!(arr.shape(), [2, 2, 3]);
        assert_eq!(arr.to_f64()[[0, 0, 0]], 125.0);
    }

    #[tokio::test]
    async fn test_memory_source_out_of_bounds() {
        let info = ChannelInfo {
            name: "em".to_string(),
            datatype: VoxelType::Uint16,
        };
        let extent = Extent::from_ranges((0, 5), (0, 6), (0, 8)).unwrap();
        let err = source().cutout(&info, &extent).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
    }

    #[test]
    fn test_memory_source_rejects_mixed_shapes() {
        let mut channels = BTreeMap::new();
        channels.insert("a".to_string(), ChannelArray::Uint8(Array3::zeros([1, 1, 1])));
        channels.insert("b".to_string(), ChannelArray::Uint8(Array3::zeros([1, 1, 2])));
        assert!(MemorySource::new(channels).is_err());
    }
}
