//! Collaborator boundaries: scene catalogs in, export structures out

pub mod catalog;
pub mod export;

pub use catalog::{InMemoryCatalog, SceneCatalog};
pub use export::{metadata_table, ProductBand, RasterProduct, SceneMetadataRow};
