//! fusao: multi-sensor Landsat harmonization, unmixing and compositing
//!
//! Harmonizes TM, ETM+ and OLI surface reflectance onto one measurement scale,
//! masks clouds and shadows from the quality bitset, unmixes pixels into
//! endmember fractions and derives vegetation and degradation indices that are
//! reduced over time into median and mosaic composites.
//!
//! Scenes come in as [`types::RawScene`]s through a [`io::SceneCatalog`];
//! composites go out as [`io::RasterProduct`]s.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    Band, BandName, BoundingBox, CollectionVersion, CoordinateSystem, FusionError, FusionResult,
    GeoTransform, Instrument, PixelFault, Platform, Raster, RawBand, RawScene, Scene,
    SceneMetadata, SensorId, REFLECTANCE_SCALE,
};

pub use crate::core::{
    AreaOfInterest, Composite, CompositeParams, CompositeStatistic, EndmemberSet, Expr,
    HarmonizationTable, Harmonizer, IndexConfig, IndexEngine, IndexRaster, PipelineConfig,
    SceneCollection, SceneFilter, ScenePreparer, SpectralIndex, SpectralUnmixer,
    TemporalCompositor, UnmixMode, UnmixingResult,
};

pub use io::{InMemoryCatalog, RasterProduct, SceneCatalog};
