use crate::core::collection::SceneCollection;
use crate::core::composite::{CompositeParams, TemporalCompositor};
use crate::core::harmonize::{HarmonizationTable, Harmonizer};
use crate::core::indices::{IndexConfig, IndexEngine};
use crate::core::normalize::{BandNormalizer, BandSchemaTable};
use crate::core::qa_mask::{QaMaskConfig, QualityMaskExtractor};
use crate::types::{FusionError, FusionResult, RawScene, Scene};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Every constant table of a processing run, loadable from any serde format
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub schema: BandSchemaTable,
    pub qa: QaMaskConfig,
    pub harmonization: HarmonizationTable,
    /// Endmember models; absent until the DETEX unmixing mode is chosen
    pub index: Option<IndexConfig>,
    pub composite: CompositeParams,
}

impl PipelineConfig {
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = Some(index);
        self
    }

    pub fn index_engine(&self) -> FusionResult<IndexEngine> {
        let index = self.index.clone().ok_or_else(|| {
            FusionError::InvalidConfig("index configuration (DETEX unmixing mode) not set".to_string())
        })?;
        IndexEngine::new(index)
    }

    pub fn compositor(&self) -> FusionResult<TemporalCompositor> {
        TemporalCompositor::new(self.composite.clone())
    }
}

/// Interpolation kernel handed to the external resampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResamplingKernel {
    Nearest,
    Bilinear,
    Bicubic,
}

/// Resampling collaborator; the crate ships no kernels of its own
pub trait Resampler: Send + Sync {
    fn resample(&self, scene: &Scene, kernel: ResamplingKernel) -> FusionResult<Scene>;
}

/// A resampler bound to the kernel used for every scene of a run
#[derive(Clone)]
pub struct ResampleStep {
    pub resampler: Arc<dyn Resampler>,
    pub kernel: ResamplingKernel,
}

impl ResampleStep {
    pub fn new(resampler: Arc<dyn Resampler>, kernel: ResamplingKernel) -> Self {
        Self { resampler, kernel }
    }
}

impl std::fmt::Debug for ResampleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResampleStep")
            .field("kernel", &self.kernel)
            .finish()
    }
}

/// Turns raw catalog scenes into masked, harmonized scenes
#[derive(Debug, Clone)]
pub struct ScenePreparer {
    normalizer: BandNormalizer,
    extractor: QualityMaskExtractor,
    harmonizer: Harmonizer,
}

impl ScenePreparer {
    pub fn new(config: &PipelineConfig) -> FusionResult<Self> {
        Ok(Self {
            normalizer: BandNormalizer::new(config.schema.clone()),
            extractor: QualityMaskExtractor::new(&config.qa)?,
            harmonizer: Harmonizer::new(config.harmonization.clone()),
        })
    }

    /// normalize, attach the quality mask, harmonize, apply the mask
    pub fn prepare(&self, raw: &RawScene) -> FusionResult<Scene> {
        let scene = self.normalizer.normalize(raw)?;
        let scene = self.extractor.attach(&scene)?;
        let scene = self.harmonizer.harmonize(&scene)?;
        scene.apply_quality_mask()
    }

    /// Prepare every scene, resample them all with one kernel, and collect
    pub fn prepare_collection(
        &self,
        raws: &[RawScene],
        resample: Option<&ResampleStep>,
    ) -> FusionResult<SceneCollection> {
        log::info!(
            "Preparing {} scenes{}",
            raws.len(),
            resample
                .map(|step| format!(" (resampling: {:?})", step.kernel))
                .unwrap_or_default()
        );

        let prepare_one = |raw: &RawScene| -> FusionResult<Scene> {
            let scene = self.prepare(raw)?;
            match resample {
                Some(step) => step.resampler.resample(&scene, step.kernel),
                None => Ok(scene),
            }
        };

        #[cfg(feature = "parallel")]
        let scenes = {
            use rayon::prelude::*;
            raws.par_iter().map(prepare_one).collect::<FusionResult<Vec<_>>>()?
        };
        #[cfg(not(feature = "parallel"))]
        let scenes = raws.iter().map(prepare_one).collect::<FusionResult<Vec<_>>>()?;

        SceneCollection::new(scenes)
    }
}

/// Concatenate per-sensor collections in the given order
pub fn merge_sensors(collections: &[SceneCollection]) -> FusionResult<SceneCollection> {
    collections
        .iter()
        .try_fold(SceneCollection::default(), |merged, next| merged.merge(next))
}
