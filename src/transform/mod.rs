//! Array transforms over block outputs.
//!
//! Currently only reassembly: block outputs placed by key or extent into one
//! full-size array.

pub mod merge;

pub use merge::{merge, Merger};
