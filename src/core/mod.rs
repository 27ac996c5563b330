//! Core scene processing modules

pub mod normalize;
pub mod qa_mask;
pub mod harmonize;
pub mod linalg;
pub mod unmix;
pub mod band_math;
pub mod indices;
pub mod collection;
pub mod composite;
pub mod pipeline;

// Re-export main types
pub use normalize::{BandAlias, BandNormalizer, BandSchemaTable, SchemaEntry};
pub use qa_mask::{QaBitLayout, QaMaskConfig, QualityMaskExtractor};
pub use harmonize::{BandCoefficient, HarmonizationTable, Harmonizer};
pub use unmix::{
    Endmember, EndmemberSet, FractionUnits, SpectralUnmixer, UnmixMode, UnmixParams, UnmixingResult,
};
pub use band_math::{evaluate, BandSource, Expr};
pub use indices::{IndexConfig, IndexEngine, IndexRaster, SpectralIndex};
pub use collection::{SceneCollection, SceneFilter};
pub use composite::{AreaOfInterest, Composite, CompositeParams, CompositeStatistic, TemporalCompositor};
pub use pipeline::{
    merge_sensors, PipelineConfig, ResampleStep, Resampler, ResamplingKernel, ScenePreparer,
};
