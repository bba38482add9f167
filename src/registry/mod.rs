//! Registry access: reference parsing, credentials, pull and export

pub mod auth;
mod client;
mod export;
mod reference;

pub use client::{Descriptor, ImageManifest, RegistryClient, RegistryError, ResolvedImage};
pub use export::export_flattened;
pub use reference::{ImageRef, ReferenceError};
