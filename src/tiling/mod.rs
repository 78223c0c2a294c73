//! Block decomposition of 3-D regions.

pub mod block;
pub mod split;
pub mod tiler;

pub use block::{AxisRange, Block, BlockKey, BoundingBox, Extent};
pub use split::{split_volume, split_volume_padded};
pub use tiler::{tile, tile_padded, Tiler};
