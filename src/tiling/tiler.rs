//! Decompose a bounding box into blocks.
//!
//! Each axis is cut independently at the axis start, every grid line
//! `origin + k * size` strictly inside the axis, and the axis end. The block
//! set is the Cartesian product of the three interval lists, enumerated
//! z-major.

use crate::config::{BlockShape, Halo};
use crate::error::{Error, Result};
use crate::tiling::{AxisRange, Block, BoundingBox, Extent};

/// Tiler for a fixed block shape and grid origin.
#[derive(Debug, Clone)]
pub struct Tiler {
    /// Target block shape
    shape: BlockShape,

    /// Grid origin (z, y, x). `None` aligns the grid with the bounding box start.
    origin: Option<[usize; 3]>,
}

impl Tiler {
    /// Create a tiler, rejecting non-positive block axes.
    pub fn new(shape: BlockShape) -> Result<Self> {
        if shape.as_array().contains(&0) {
            return Err(Error::config(format!(
                "block shape must be positive on every axis, got {:?}",
                shape.as_array()
            )));
        }
        Ok(Self { shape, origin: None })
    }

    /// Align cut points to a grid anchored at `origin` instead of the box start.
    pub fn with_origin(mut self, origin: [usize; 3]) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    /// Cover `bbox` with pairwise disjoint blocks.
    pub fn tile(&self, bbox: &BoundingBox) -> Result<Vec<Block>> {
        let axes = bbox.extent().axes();
        let sizes = self.shape.as_array();
        let origin = self.origin.unwrap_or_else(|| bbox.extent().start());

        let mut intervals = Vec::with_capacity(3);
        for i in 0..3 {
            intervals.push(axis_intervals(axes[i], origin[i], sizes[i])?);
        }

        let mut blocks =
            Vec::with_capacity(intervals[0].len() * intervals[1].len() * intervals[2].len());
        for z in &intervals[0] {
            for y in &intervals[1] {
                for x in &intervals[2] {
                    blocks.push(Block::new(Extent::new(*z, *y, *x)));
                }
            }
        }

        tracing::debug!(
            "Tiled {} into {} blocks ({}x{}x{})",
            bbox.extent(),
            blocks.len(),
            intervals[0].len(),
            intervals[1].len(),
            intervals[2].len()
        );

        Ok(blocks)
    }

    /// Tile `bbox`, then grow each block by `halo`, clamped to the box.
    ///
    /// Keys still come from the unpadded origin.
    pub fn tile_padded(&self, bbox: &BoundingBox, halo: Halo) -> Result<Vec<Block>> {
        let limits = bbox.extent();
        let blocks = self
            .tile(bbox)?
            .into_iter()
            .map(|block| {
                let core = block.core;
                let extent = Extent::new(
                    core.z.expand_within(halo.z, &limits.z),
                    core.y.expand_within(halo.y, &limits.y),
                    core.x.expand_within(halo.x, &limits.x),
                );
                Block::padded(core, extent)
            })
            .collect();
        Ok(blocks)
    }
}

/// Cut one axis into consecutive intervals.
fn axis_intervals(axis: AxisRange, origin: usize, size: usize) -> Result<Vec<AxisRange>> {
    if axis.start > axis.end {
        return Err(Error::config(format!("axis start after end: {}", axis)));
    }
    if origin > axis.start {
        return Err(Error::config(format!(
            "grid origin {} lies after axis start {}",
            origin, axis.start
        )));
    }
    if axis.is_empty() {
        return Ok(vec![axis]);
    }

    // First grid line strictly after the start
    let mut cut = origin + ((axis.start - origin) / size + 1) * size;
    let mut intervals = Vec::with_capacity(axis.len().div_ceil(size) + 1);
    let mut start = axis.start;
    while cut < axis.end {
        intervals.push(AxisRange { start, end: cut });
        start = cut;
        cut += size;
    }
    intervals.push(AxisRange { start, end: axis.end });
    Ok(intervals)
}

/// Tile a bounding box with the given block shape.
pub fn tile(bbox: &BoundingBox, shape: BlockShape) -> Result<Vec<Block>> {
    Tiler::new(shape)?.tile(bbox)
}

/// Tile a bounding box and pad each block by `halo`.
pub fn tile_padded(bbox: &BoundingBox, shape: BlockShape, halo: Halo) -> Result<Vec<Block>> {
    Tiler::new(shape)?.tile_padded(bbox, halo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::BlockKey;
    use ndarray::{s, Array3};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn bbox(z: (usize, usize), y: (usize, usize), x: (usize, usize)) -> BoundingBox {
        BoundingBox::new(z, y, x).unwrap()
    }

    #[test]
    fn test_tiling_example() {
        let blocks = tile(&bbox((0, 25), (0, 1000), (0, 1000)), BlockShape::new(10, 1000, 1000)).unwrap();

        assert_eq!(blocks.len(), 3);
        let z: Vec<_> = blocks.iter().map(|b| (b.extent.z.start, b.extent.z.end)).collect();
        assert_eq!(z, vec![(0, 10), (10, 20), (20, 25)]);
        for block in &blocks {
            assert_eq!(block.extent.y, AxisRange { start: 0, end: 1000 });
            assert_eq!(block.extent.x, AxisRange { start: 0, end: 1000 });
            assert!(!block.is_padded());
        }
    }

    #[test]
    fn test_axis_smaller_than_block() {
        let blocks = tile(&bbox((3, 7), (0, 5), (0, 5)), BlockShape::new(10, 10, 10)).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].extent.shape(), [4, 5, 5]);
        assert_eq!(blocks[0].key(), BlockKey::new(3, 0, 0));
    }

    #[test]
    fn test_offset_start_steps_from_start() {
        let blocks = tile(&bbox((5, 30), (0, 1), (0, 1)), BlockShape::new(10, 1, 1)).unwrap();
        let z: Vec<_> = blocks.iter().map(|b| (b.extent.z.start, b.extent.z.end)).collect();
        assert_eq!(z, vec![(5, 15), (15, 25), (25, 30)]);
    }

    #[test]
    fn test_explicit_origin_aligns_to_grid() {
        let tiler = Tiler::new(BlockShape::new(10, 1, 1)).unwrap().with_origin([0, 0, 0]);
        let blocks = tiler.tile(&bbox((5, 30), (0, 1), (0, 1))).unwrap();
        let z: Vec<_> = blocks.iter().map(|b| (b.extent.z.start, b.extent.z.end)).collect();
        assert_eq!(z, vec![(5, 10), (10, 20), (20, 30)]);
    }

    #[test]
    fn test_origin_after_start_rejected() {
        let tiler = Tiler::new(BlockShape::new(10, 1, 1)).unwrap().with_origin([6, 0, 0]);
        assert!(tiler.tile(&bbox((5, 30), (0, 1), (0, 1))).is_err());
    }

    #[test]
    fn test_empty_axis_yields_one_empty_interval() {
        let blocks = tile(&bbox((4, 4), (0, 20), (0, 10)), BlockShape::new(2, 10, 10)).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.extent.z.is_empty()));
    }

    #[test]
    fn test_zero_block_axis_rejected() {
        let err = tile(&bbox((0, 5), (0, 5), (0, 5)), BlockShape::new(1, 0, 1)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_padded_tiling_clamps_and_keeps_keys() {
        let b = bbox((0, 25), (0, 20), (0, 20));
        let blocks = tile_padded(&b, BlockShape::new(10, 10, 10), Halo::new(2, 3, 0)).unwrap();
        assert_eq!(blocks.len(), 12);

        let first = &blocks[0];
        assert_eq!(first.key(), BlockKey::new(0, 0, 0));
        assert_eq!(first.extent.z, AxisRange { start: 0, end: 12 });
        assert_eq!(first.extent.y, AxisRange { start: 0, end: 13 });
        assert_eq!(first.extent.x, AxisRange { start: 0, end: 10 });

        let last = blocks.last().unwrap();
        assert_eq!(last.key(), BlockKey::new(20, 10, 10));
        assert_eq!(last.extent.z, AxisRange { start: 18, end: 25 });
        assert_eq!(last.extent.y, AxisRange { start: 7, end: 20 });
    }

    proptest! {
        #[test]
        fn prop_blocks_partition_bbox(
            z0 in 0usize..20, zl in 1usize..40,
            y0 in 0usize..20, yl in 1usize..40,
            x0 in 0usize..20, xl in 1usize..40,
            bz in 1usize..15, by in 1usize..15, bx in 1usize..15,
        ) {
            let b = bbox((z0, z0 + zl), (y0, y0 + yl), (x0, x0 + xl));
            let blocks = tile(&b, BlockShape::new(bz, by, bx)).unwrap();

            // Every voxel of the box is covered by exactly one block
            let mut hits = Array3::<u32>::zeros(b.shape());
            for block in &blocks {
                prop_assert!(b.extent().contains(&block.extent));
                let e = block.extent;
                hits.slice_mut(s![
                    e.z.start - z0..e.z.end - z0,
                    e.y.start - y0..e.y.end - y0,
                    e.x.start - x0..e.x.end - x0
                ])
                .mapv_inplace(|h| h + 1);
            }
            prop_assert!(hits.iter().all(|&h| h == 1));

            let keys: HashSet<_> = blocks.iter().map(|b| b.key()).collect();
            prop_assert_eq!(keys.len(), blocks.len());
        }

        #[test]
        fn prop_only_last_block_is_short(start in 0usize..50, len in 1usize..200, size in 1usize..40) {
            let b = bbox((start, start + len), (0, 1), (0, 1));
            let blocks = tile(&b, BlockShape::new(size, 1, 1)).unwrap();
            let lens: Vec<_> = blocks.iter().map(|b| b.extent.z.len()).collect();

            prop_assert!(lens.iter().all(|&l| l > 0));
            let short = lens.iter().filter(|&&l| l < size).count();
            if len % size == 0 {
                prop_assert_eq!(short, 0);
            } else {
                prop_assert_eq!(short, 1);
                prop_assert!(*lens.last().unwrap() < size);
            }
        }

        #[test]
        fn prop_padded_blocks_stay_inside(
            zl in 1usize..40, yl in 1usize..40, xl in 1usize..40,
            size in 2usize..20, hz in 0usize..8, hy in 0usize..8, hx in 0usize..8,
        ) {
            let b = bbox((3, 3 + zl), (1, 1 + yl), (0, xl));
            let blocks = tile_padded(&b, BlockShape::new(size, size, size), Halo::new(hz, hy, hx)).unwrap();
            for block in &blocks {
                prop_assert!(b.extent().contains(&block.extent));
                prop_assert!(block.extent.contains(&block.core));
            }
        }

        #[test]
        fn prop_key_round_trip(z in 0usize..100_000, y in 0usize..100_000, x in 0usize..100_000) {
            let key = BlockKey::new(z, y, x);
            prop_assert_eq!(key.to_string().parse::<BlockKey>().unwrap(), key);
        }
    }
}
