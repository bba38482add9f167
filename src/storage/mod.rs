//! On-disk layout: path expansion and rootfs extraction

pub mod paths;
mod unpack;

pub use unpack::{unpack, UnpackError};
