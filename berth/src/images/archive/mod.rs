//! Layer tarballs: deterministic packing of build steps and streaming
//! application of layers onto a root filesystem.

mod apply;
mod pack;

pub use apply::{apply_layer, apply_layer_tarball};
pub use pack::{PackedLayer, pack_layer};
