//! Typed voxel arrays and per-block channel maps.

use crate::error::{Error, Result};
use ndarray::{s, Array3, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Native element type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoxelType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl VoxelType {
    /// Size of one element in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            VoxelType::Uint8 => 1,
            VoxelType::Uint16 => 2,
            VoxelType::Uint32 | VoxelType::Float32 => 4,
            VoxelType::Uint64 | VoxelType::Float64 => 8,
        }
    }
}

impl fmt::Display for VoxelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoxelType::Uint8 => "uint8",
            VoxelType::Uint16 => "uint16",
            VoxelType::Uint32 => "uint32",
            VoxelType::Uint64 => "uint64",
            VoxelType::Float32 => "float32",
            VoxelType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// A 3-D array (z, y, x) of one channel, in its element type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChannelArray {
    Uint8(Array3<u8>),
    Uint16(Array3<u16>),
    Uint32(Array3<u32>),
    Uint64(Array3<u64>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

/// Apply the same expression to whichever array a `ChannelArray` holds.
macro_rules! each_variant {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            ChannelArray::Uint8($arr) => $body,
            ChannelArray::Uint16($arr) => $body,
            ChannelArray::Uint32($arr) => $body,
            ChannelArray::Uint64($arr) => $body,
            ChannelArray::Float32($arr) => $body,
            ChannelArray::Float64($arr) => $body,
        }
    };
}

/// Same as `each_variant!`, rewrapping the result in the same variant.
macro_rules! map_variant {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            ChannelArray::Uint8($arr) => ChannelArray::Uint8($body),
            ChannelArray::Uint16($arr) => ChannelArray::Uint16($body),
            ChannelArray::Uint32($arr) => ChannelArray::Uint32($body),
            ChannelArray::Uint64($arr) => ChannelArray::Uint64($body),
            ChannelArray::Float32($arr) => ChannelArray::Float32($body),
            ChannelArray::Float64($arr) => ChannelArray::Float64($body),
        }
    };
}

/// Decode little-endian bytes into a vector of `$t`.
macro_rules! decode_le {
    ($bytes:expr, $t:ty) => {
        $bytes
            .chunks_exact(std::mem::size_of::<$t>())
            .map(|c| {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(c);
                <$t>::from_le_bytes(buf)
            })
            .collect::<Vec<$t>>()
    };
}

impl ChannelArray {
    /// Zero-filled array of the given type and shape.
    pub fn zeros(dtype: VoxelType, shape: [usize; 3]) -> Self {
        match dtype {
            VoxelType::Uint8 => ChannelArray::Uint8(Array3::zeros(shape)),
            VoxelType::Uint16 => ChannelArray::Uint16(Array3::zeros(shape)),
            VoxelType::Uint32 => ChannelArray::Uint32(Array3::zeros(shape)),
            VoxelType::Uint64 => ChannelArray::Uint64(Array3::zeros(shape)),
            VoxelType::Float32 => ChannelArray::Float32(Array3::zeros(shape)),
            VoxelType::Float64 => ChannelArray::Float64(Array3::zeros(shape)),
        }
    }

    pub fn voxel_type(&self) -> VoxelType {
        match self {
            ChannelArray::Uint8(_) => VoxelType::Uint8,
            ChannelArray::Uint16(_) => VoxelType::Uint16,
            ChannelArray::Uint32(_) => VoxelType::Uint32,
            ChannelArray::Uint64(_) => VoxelType::Uint64,
            ChannelArray::Float32(_) => VoxelType::Float32,
            ChannelArray::Float64(_) => VoxelType::Float64,
        }
    }

    /// Shape (z, y, x).
    pub fn shape(&self) -> [usize; 3] {
        let (z, y, x) = each_variant!(self, a => a.dim());
        [z, y, x]
    }

    pub fn len(&self) -> usize {
        each_variant!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the array's elements in bytes.
    pub fn nbytes(&self) -> usize {
        self.len() * self.voxel_type().byte_size()
    }

    /// Convert to another element type with Rust `as` semantics
    /// (float to integer saturates, integer narrowing truncates).
    pub fn cast(&self, target: VoxelType) -> ChannelArray {
        if self.voxel_type() == target {
            return self.clone();
        }
        macro_rules! convert {
            ($a:expr) => {
                match target {
                    VoxelType::Uint8 => ChannelArray::Uint8($a.mapv(|v| v as u8)),
                    VoxelType::Uint16 => ChannelArray::Uint16($a.mapv(|v| v as u16)),
                    VoxelType::Uint32 => ChannelArray::Uint32($a.mapv(|v| v as u32)),
                    VoxelType::Uint64 => ChannelArray::Uint64($a.mapv(|v| v as u64)),
                    VoxelType::Float32 => ChannelArray::Float32($a.mapv(|v| v as f32)),
                    VoxelType::Float64 => ChannelArray::Float64($a.mapv(|v| v as f64)),
                }
            };
        }
        each_variant!(self, a => convert!(a))
    }

    /// Widen to `f64`.
    pub fn to_f64(&self) -> Array3<f64> {
        each_variant!(self, a => a.mapv(|v| v as f64))
    }

    /// Copy out a sub-box, with ranges relative to this array.
    pub fn slice(&self, z: Range<usize>, y: Range<usize>, x: Range<usize>) -> ChannelArray {
        map_variant!(self, a => a.slice(s![z.clone(), y.clone(), x.clone()]).to_owned())
    }

    /// Decode little-endian row-major bytes of type `dtype`.
    pub fn from_le_bytes(dtype: VoxelType, shape: [usize; 3], bytes: &[u8]) -> Result<Self> {
        let voxels: usize = shape.iter().product();
        if bytes.len() != voxels * dtype.byte_size() {
            return Err(Error::ShapeMismatch {
                context: format!("decoding {} voxels", dtype),
                expected: vec![voxels * dtype.byte_size()],
                actual: vec![bytes.len()],
            });
        }

        let shape_err = |e: ndarray::ShapeError| Error::ShapeMismatch {
            context: format!("decoding {} voxels: {}", dtype, e),
            expected: shape.to_vec(),
            actual: vec![voxels],
        };

        Ok(match dtype {
            VoxelType::Uint8 => ChannelArray::Uint8(
                Array3::from_shape_vec(shape, bytes.to_vec()).map_err(shape_err)?,
            ),
            VoxelType::Uint16 => ChannelArray::Uint16(
                Array3::from_shape_vec(shape, decode_le!(bytes, u16)).map_err(shape_err)?,
            ),
            VoxelType::Uint32 => ChannelArray::Uint32(
                Array3::from_shape_vec(shape, decode_le!(bytes, u32)).map_err(shape_err)?,
            ),
            VoxelType::Uint64 => ChannelArray::Uint64(
                Array3::from_shape_vec(shape, decode_le!(bytes, u64)).map_err(shape_err)?,
            ),
            VoxelType::Float32 => ChannelArray::Float32(
                Array3::from_shape_vec(shape, decode_le!(bytes, f32)).map_err(shape_err)?,
            ),
            VoxelType::Float64 => ChannelArray::Float64(
                Array3::from_shape_vec(shape, decode_le!(bytes, f64)).map_err(shape_err)?,
            ),
        })
    }

    /// Encode as little-endian row-major bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nbytes());
        each_variant!(self, a => {
            for v in a.iter() {
                out.extend_from_slice(&v.to_le_bytes());
            }
        });
        out
    }
}

/// Channel name to array, for one block. All arrays share the block's shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ChannelMap(BTreeMap<String, ChannelArray>);

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, array: ChannelArray) -> Option<ChannelArray> {
        self.0.insert(name.into(), array)
    }

    pub fn get(&self, name: &str) -> Option<&ChannelArray> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Channel names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelArray)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Shared block shape, or `None` if empty.
    pub fn shape(&self) -> Option<[usize; 3]> {
        self.0.values().next().map(ChannelArray::shape)
    }

    /// Total payload size in bytes.
    pub fn nbytes(&self) -> usize {
        self.0.values().map(ChannelArray::nbytes).sum()
    }

    /// Stack all channels, in name order, into one `f64` cube (channel, z, y, x).
    pub fn to_cube(&self) -> Result<Array4<f64>> {
        if self.0.is_empty() {
            return Err(Error::config("cannot stack an empty channel map"));
        }
        let arrays: Vec<Array3<f64>> = self.0.values().map(ChannelArray::to_f64).collect();
        let expected = arrays[0].shape().to_vec();
        if let Some(other) = arrays.iter().find(|a| a.shape() != expected.as_slice()) {
            return Err(Error::ShapeMismatch {
                context: "stacking channels".to_string(),
                expected,
                actual: other.shape().to_vec(),
            });
        }
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        ndarray::stack(Axis(0), &views).map_err(|e| Error::ShapeMismatch {
            context: format!("stacking channels: {}", e),
            expected,
            actual: vec![arrays.len()],
        })
    }
}

impl FromIterator<(String, ChannelArray)> for ChannelMap {
    fn from_iter<I: IntoIterator<Item = (String, ChannelArray)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
