#![forbid(unsafe_code)]
//! flatfat public API.
//!
//! Re-exports the volume engine from `flatfat-core`. Downstream users such
//! as the CLI depend on this crate, not on the internal layers.

pub use flatfat_core::*;
