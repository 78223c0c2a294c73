//! Reassemble block outputs into one full-size array.
//!
//! Arrays are laid out `z, y, x` followed by any trailing axes (for example
//! channels). Outputs are written in insertion order and later writes win.

use crate::error::{Error, Result};
use crate::tiling::{AxisRange, BlockKey, Extent};
use ndarray::ArrayD;

/// Accumulates block outputs into a zero-filled full array.
#[derive(Debug, Clone)]
pub struct Merger<T> {
    output: ArrayD<T>,
}

impl<T: Clone + Default> Merger<T> {
    /// Allocate the target array. `full_shape` needs at least the three spatial axes.
    pub fn new(full_shape: &[usize]) -> Result<Self> {
        if full_shape.len() < 3 {
            return Err(Error::ShapeMismatch {
                context: "merge target must have z, y, x axes".to_string(),
                expected: vec![0, 0, 0],
                actual: full_shape.to_vec(),
            });
        }
        Ok(Self {
            output: ArrayD::from_elem(full_shape.to_vec(), T::default()),
        })
    }

    pub fn shape(&self) -> &[usize] {
        self.output.shape()
    }

    /// Place `data` with its origin at `key`; the span is the data's own spatial shape.
    pub fn insert(&mut self, key: &BlockKey, data: &ArrayD<T>) -> Result<()> {
        self.check_trailing(data, key)?;
        let shape = data.shape();
        let mut axes = [AxisRange { start: 0, end: 0 }; 3];
        for (axis, (start, len)) in axes.iter_mut().zip(key.origin().into_iter().zip(shape)) {
            let end = start.checked_add(*len).ok_or_else(|| Error::ShapeMismatch {
                context: format!("output at {} runs past the index space", key),
                expected: self.output.shape().to_vec(),
                actual: shape.to_vec(),
            })?;
            *axis = AxisRange { start, end };
        }
        let [z, y, x] = axes;
        self.write(&Extent::new(z, y, x), data)
    }

    /// Place `data` at `extent`; the data's spatial shape must equal the extent's.
    pub fn insert_extent(&mut self, extent: &Extent, data: &ArrayD<T>) -> Result<()> {
        self.check_trailing(data, extent)?;
        if data.shape()[..3] != extent.shape() {
            return Err(Error::ShapeMismatch {
                context: format!("output for {}", extent),
                expected: extent.shape().to_vec(),
                actual: data.shape()[..3].to_vec(),
            });
        }
        self.write(extent, data)
    }

    pub fn finish(self) -> ArrayD<T> {
        self.output
    }

    fn check_trailing(&self, data: &ArrayD<T>, at: &dyn std::fmt::Display) -> Result<()> {
        let full = self.output.shape();
        if data.ndim() != full.len() || data.shape()[3..] != full[3..] {
            return Err(Error::ShapeMismatch {
                context: format!("output at {} has different trailing axes", at),
                expected: full.to_vec(),
                actual: data.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn write(&mut self, extent: &Extent, data: &ArrayD<T>) -> Result<()> {
        let full = self.output.shape();
        let end = [extent.z.end, extent.y.end, extent.x.end];
        if end.iter().zip(full).any(|(e, f)| e > f) {
            return Err(Error::ShapeMismatch {
                context: format!("span {} exceeds merge target", extent),
                expected: full.to_vec(),
                actual: end.to_vec(),
            });
        }

        let elems = extent.slice_elems(full.len())?;
        self.output.slice_mut(elems.as_slice()).assign(data);
        Ok(())
    }
}

/// Merge outputs placed by key.
pub fn merge<T, I>(outputs: I, full_shape: &[usize]) -> Result<ArrayD<T>>
where
    T: Clone + Default,
    I: IntoIterator<Item = (BlockKey, ArrayD<T>)>,
{
    let mut merger = Merger::new(full_shape)?;
    for (key, data) in outputs {
        merger.insert(&key, &data)?;
    }
    Ok(merger.finish())
}
