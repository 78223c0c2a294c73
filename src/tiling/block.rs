//! Block value objects: axis ranges, 3-D extents, identity keys and bounding boxes.

use crate::error::{Error, Result};
use crate::io::DatasetExtent;
use crate::voxel::ChannelMap;
use ndarray::SliceInfoElem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Half-open interval `[start, end)` along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AxisRange {
    pub start: usize,
    pub end: usize,
}

impl AxisRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start > end {
            return Err(Error::config(format!(
                "range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of voxels covered.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Grow by `halo` on both sides without leaving `limits`.
    pub fn expand_within(&self, halo: usize, limits: &AxisRange) -> AxisRange {
        AxisRange {
            start: self.start.saturating_sub(halo).max(limits.start),
            end: self.end.saturating_add(halo).min(limits.end),
        }
    }

    /// Check that `other` lies inside this range.
    pub fn contains_range(&self, other: &AxisRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn as_range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for AxisRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A 3-D box `z × y × x` of half-open ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub z: AxisRange,
    pub y: AxisRange,
    pub x: AxisRange,
}

impl Extent {
    pub fn new(z: AxisRange, y: AxisRange, x: AxisRange) -> Self {
        Self { z, y, x }
    }

    /// Build from `[start, end)` pairs in z, y, x order.
    pub fn from_ranges(z: (usize, usize), y: (usize, usize), x: (usize, usize)) -> Result<Self> {
        Ok(Self {
            z: AxisRange::new(z.0, z.1)?,
            y: AxisRange::new(y.0, y.1)?,
            x: AxisRange::new(x.0, x.1)?,
        })
    }

    /// Axes in canonical z, y, x order.
    pub fn axes(&self) -> [AxisRange; 3] {
        [self.z, self.y, self.x]
    }

    /// Start corner (z, y, x).
    pub fn start(&self) -> [usize; 3] {
        [self.z.start, self.y.start, self.x.start]
    }

    /// Shape (z, y, x).
    pub fn shape(&self) -> [usize; 3] {
        [self.z.len(), self.y.len(), self.x.len()]
    }

    pub fn num_voxels(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn contains(&self, other: &Extent) -> bool {
        self.z.contains_range(&other.z)
            && self.y.contains_range(&other.y)
            && self.x.contains_range(&other.x)
    }

    /// Slice selecting this extent in an `ndim`-array laid out `z, y, x, ...`.
    /// Trailing axes are taken whole.
    pub fn slice_elems(&self, ndim: usize) -> Result<Vec<SliceInfoElem>> {
        let index = |v: usize| {
            isize::try_from(v).map_err(|_| Error::ShapeMismatch {
                context: format!("extent {} is not addressable", self),
                expected: vec![isize::MAX as usize],
                actual: vec![v],
            })
        };
        let mut elems = Vec::with_capacity(ndim.max(3));
        for r in self.axes() {
            elems.push(SliceInfoElem::Slice {
                start: index(r.start)?,
                end: Some(index(r.end)?),
                step: 1,
            });
        }
        elems.extend((3..ndim).map(|_| SliceInfoElem::Slice {
            start: 0,
            end: None,
            step: 1,
        }));
        Ok(elems)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z{} y{} x{}", self.z, self.y, self.x)
    }
}

/// Identity of a block: its unpadded origin.
///
/// The text form is `"<z>_<y>_<x>"`, which is also the persisted artifact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl BlockKey {
    pub fn new(z: usize, y: usize, x: usize) -> Self {
        Self { z, y, x }
    }

    /// Origin as (z, y, x).
    pub fn origin(&self) -> [usize; 3] {
        [self.z, self.y, self.x]
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.z, self.y, self.x)
    }
}

impl FromStr for BlockKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 3 {
            return Err(Error::config(format!(
                "invalid block key '{}': expected '<z>_<y>_<x>'",
                s
            )));
        }
        // Only the canonical decimal form, so a key names exactly one artifact.
        let parse = |p: &str| {
            let canonical = !p.is_empty()
                && p.bytes().all(|b| b.is_ascii_digit())
                && (p == "0" || !p.starts_with('0'));
            if !canonical {
                return Err(Error::config(format!(
                    "invalid block key '{}': '{}' is not a canonical index",
                    s, p
                )));
            }
            p.parse::<usize>()
                .map_err(|e| Error::config(format!("invalid block key '{}': {}", s, e)))
        };
        Ok(Self {
            z: parse(parts[0])?,
            y: parse(parts[1])?,
            x: parse(parts[2])?,
        })
    }
}

impl Serialize for BlockKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A region of the volume to process, with its data once fetched.
#[derive(Debug, Clone)]
pub struct Block {
    /// Region to fetch and analyze (includes the halo in padded tilings)
    pub extent: Extent,

    /// Unpadded tile this block was generated from
    pub core: Extent,

    /// Channel data for `extent`, attached by the fetcher
    pub payload: Option<ChannelMap>,
}

impl Block {
    /// Create an unpadded block.
    pub fn new(extent: Extent) -> Self {
        Self {
            extent,
            core: extent,
            payload: None,
        }
    }

    /// Create a block whose fetched extent is wider than its core tile.
    pub fn padded(core: Extent, extent: Extent) -> Self {
        Self {
            extent,
            core,
            payload: None,
        }
    }

    /// Identity key derived from the unpadded origin.
    pub fn key(&self) -> BlockKey {
        let [z, y, x] = self.core.start();
        BlockKey { z, y, x }
    }

    /// Shape of the fetched region (z, y, x).
    pub fn shape(&self) -> [usize; 3] {
        self.extent.shape()
    }

    pub fn is_padded(&self) -> bool {
        self.extent != self.core
    }

    /// Detach the payload, leaving a coordinate-only block.
    pub fn take_payload(&mut self) -> Option<ChannelMap> {
        self.payload.take()
    }
}

/// The requested query region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub z: AxisRange,
    pub y: AxisRange,
    pub x: AxisRange,
}

impl BoundingBox {
    /// Create a bounding box from `[start, end)` pairs in z, y, x order.
    pub fn new(z: (usize, usize), y: (usize, usize), x: (usize, usize)) -> Result<Self> {
        let extent = Extent::from_ranges(z, y, x)?;
        Ok(Self::from(extent))
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.z, self.y, self.x)
    }

    pub fn shape(&self) -> [usize; 3] {
        self.extent().shape()
    }

    /// Reject a box that reaches past the dataset's max extents.
    pub fn check_within(&self, dataset: &DatasetExtent) -> Result<()> {
        let names = ["z", "y", "x"];
        for ((axis, range), max) in names.iter().zip(self.extent().axes()).zip(dataset.max) {
            if range.end > max {
                return Err(Error::config(format!(
                    "{} range {} exceeds dataset extent {}",
                    axis, range, max
                )));
            }
        }
        Ok(())
    }
}

impl From<Extent> for BoundingBox {
    fn from(extent: Extent) -> Self {
        Self {
            z: extent.z,
            y: extent.y,
            x: extent.x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_range_rejects_inverted() {
        assert!(AxisRange::new(5, 4).is_err());
        assert!(AxisRange::new(4, 4).unwrap().is_empty());
    }

    #[test]
    fn test_expand_within_clamps() {
        let limits = AxisRange::new(0, 100).unwrap();
        let r = AxisRange::new(2, 50).unwrap();
        assert_eq!(r.expand_within(5, &limits), AxisRange { start: 0, end: 55 });

        let r = AxisRange::new(90, 100).unwrap();
        assert_eq!(r.expand_within(5, &limits), AxisRange { start: 85, end: 100 });
    }

    #[test]
    fn test_block_key_round_trip() {
        let key = BlockKey::new(20, 1000, 3);
        let text = key.to_string();
        assert_eq!(text, "20_1000_3");
        assert_eq!(text.parse::<BlockKey>().unwrap(), key);
    }

    #[test]
    fn test_block_key_parse_invalid() {
        assert!("1_2".parse::<BlockKey>().is_err());
        assert!("a_b_c".parse::<BlockKey>().is_err());
        assert!("1_2_3_4".parse::<BlockKey>().is_err());
        assert!("-1_2_3".parse::<BlockKey>().is_err());
        assert!("+7_0_0".parse::<BlockKey>().is_err());
        assert!("007_0_0".parse::<BlockKey>().is_err());
        assert!("1__3".parse::<BlockKey>().is_err());
        assert!("99999999999999999999_0_0".parse::<BlockKey>().is_err());
        assert_eq!("0_0_10".parse::<BlockKey>().unwrap(), BlockKey::new(0, 0, 10));
    }

    #[test]
    fn test_block_key_serde_as_string() {
        let key = BlockKey::new(1, 2, 3);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"1_2_3\"");
        let back: BlockKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_padded_block_keeps_core_key() {
        let core = Extent::from_ranges((10, 20), (0, 5), (0, 5)).unwrap();
        let extent = Extent::from_ranges((8, 22), (0, 7), (0, 7)).unwrap();
        let block = Block::padded(core, extent);
        assert!(block.is_padded());
        assert_eq!(block.key(), BlockKey::new(10, 0, 0));
        assert_eq!(block.shape(), [14, 7, 7]);
    }

    #[test]
    fn test_bounding_box_within_extent() {
        let dataset = DatasetExtent::new([25, 1000, 1000]);
        let bbox = BoundingBox::new((0, 25), (0, 1000), (0, 1000)).unwrap();
        assert!(bbox.check_within(&dataset).is_ok());

        let bbox = BoundingBox::new((0, 26), (0, 1000), (0, 1000)).unwrap();
        let err = bbox.check_within(&dataset).unwrap_err();
        assert!(err.to_string().contains("z range"));
    }

    #[test]
    fn test_slice_elems_select_region() {
        let volume = ndarray::ArrayD::from_shape_fn(vec![4, 4, 4, 2], |idx| idx[0] * 100 + idx[3]);
        let extent = Extent::from_ranges((1, 3), (0, 2), (2, 4)).unwrap();
        let view = volume.slice(extent.slice_elems(4).unwrap().as_slice());
        assert_eq!(view.shape(), &[2, 2, 2, 2]);
        assert_eq!(view[[1, 0, 0, 1]], 201);
    }

    #[test]
    fn test_slice_elems_rejects_unaddressable_extent() {
        let extent = Extent::from_ranges((0, usize::MAX), (0, 1), (0, 1)).unwrap();
        let err = extent.slice_elems(3).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
