//! Split an in-memory volume into keyed blocks.
//!
//! The local counterpart of fetching: the volume is tiled like a query box
//! starting at the origin and each block's region is copied out in parallel.

use crate::config::{BlockShape, Halo};
use crate::error::{Error, Result};
use crate::tiling::{tile, tile_padded, Block, BlockKey, BoundingBox};
use ndarray::{ArrayD, ArrayViewD};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Tile `volume` (laid out `z, y, x, ...`) into non-overlapping blocks.
pub fn split_volume<T>(volume: ArrayViewD<'_, T>, shape: BlockShape) -> Result<BTreeMap<BlockKey, ArrayD<T>>>
where
    T: Clone + Send + Sync,
{
    let bbox = volume_bbox(&volume)?;
    let blocks = tile(&bbox, shape)?;
    copy_blocks(&volume, &blocks)
}

/// Tile `volume` and pad each block by `halo`, clamped to the volume.
/// Entries are keyed by the unpadded origin.
pub fn split_volume_padded<T>(
    volume: ArrayViewD<'_, T>,
    shape: BlockShape,
    halo: Halo,
) -> Result<BTreeMap<BlockKey, ArrayD<T>>>
where
    T: Clone + Send + Sync,
{
    let bbox = volume_bbox(&volume)?;
    let blocks = tile_padded(&bbox, shape, halo)?;
    copy_blocks(&volume, &blocks)
}

fn volume_bbox<T>(volume: &ArrayViewD<'_, T>) -> Result<BoundingBox> {
    let shape = volume.shape();
    if shape.len() < 3 {
        return Err(Error::ShapeMismatch {
            context: "volume must have z, y, x axes".to_string(),
            expected: vec![0, 0, 0],
            actual: shape.to_vec(),
        });
    }
    BoundingBox::new((0, shape[0]), (0, shape[1]), (0, shape[2]))
}

fn copy_blocks<T>(volume: &ArrayViewD<'_, T>, blocks: &[Block]) -> Result<BTreeMap<BlockKey, ArrayD<T>>>
where
    T: Clone + Send + Sync,
{
    let ndim = volume.ndim();
    blocks
        .par_iter()
        .map(|block| -> Result<(BlockKey, ArrayD<T>)> {
            let elems = block.extent.slice_elems(ndim)?;
            Ok((block.key(), volume.slice(elems.as_slice()).to_owned()))
        })
        .collect()
}
