//! Radix keys and bucketizing
//!
//! Join key columns are turned into fixed-width `u64` radix components (see
//! [`KeyExtractor`]). A composite key is the big-endian concatenation of its components, so
//! the most significant radix digits of the composite select a [`RadixBucket`].

pub mod bucketizer;
pub mod extractor;

pub use bucketizer::*;
pub use extractor::*;

/// Index of a row within one input table
pub type RowRef = u32;
