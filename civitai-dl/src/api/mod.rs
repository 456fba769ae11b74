//! Remote API: tolerant data model and the rate-governed client.

mod client;
pub mod models;

pub use client::ApiClient;
pub use models::{
    Creator, FileEntry, FileFormat, ImageEntry, ListResponse, Model, ModelKind, ModelMode,
    PageMeta, Version, VersionStats,
};
