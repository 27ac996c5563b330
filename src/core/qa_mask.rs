use crate::types::{
    CollectionVersion, FusionError, FusionResult, QaWord, QualityMask, Scene,
};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Number of bits in one quality word
const QA_WORD_BITS: u8 = 16;

/// Which quality bits mark a pixel as unusable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaBitLayout {
    /// Cloud (and cloud-like) condition bits
    pub cloud_bits: Vec<u8>,
    /// Cloud shadow condition bits
    pub shadow_bits: Vec<u8>,
}

impl QaBitLayout {
    /// Collection 1 `pixel_qa`: bit 3 cloud shadow, bit 5 cloud
    pub fn collection1() -> Self {
        Self {
            cloud_bits: vec![5],
            shadow_bits: vec![3],
        }
    }

    /// Collection 2 `QA_PIXEL`: bit 1 dilated cloud, bit 3 cloud, bit 4 cloud shadow
    pub fn collection2() -> Self {
        Self {
            cloud_bits: vec![1, 3],
            shadow_bits: vec![4],
        }
    }

    /// Combined bit mask; fails on positions outside the quality word
    pub fn rejection_bits(&self) -> FusionResult<QaWord> {
        self.cloud_bits
            .iter()
            .chain(self.shadow_bits.iter())
            .try_fold(0, |acc: QaWord, &bit| {
                if bit >= QA_WORD_BITS {
                    Err(FusionError::InvalidConfig(format!(
                        "Quality bit position {} outside a {}-bit word",
                        bit, QA_WORD_BITS
                    )))
                } else {
                    Ok(acc | (1 << bit))
                }
            })
    }
}

/// Bit layouts keyed by product collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaMaskConfig {
    pub layouts: Vec<(CollectionVersion, QaBitLayout)>,
}

impl QaMaskConfig {
    pub fn layout(&self, collection: CollectionVersion) -> Option<&QaBitLayout> {
        self.layouts
            .iter()
            .find(|(version, _)| *version == collection)
            .map(|(_, layout)| layout)
    }
}

impl Default for QaMaskConfig {
    fn default() -> Self {
        Self {
            layouts: vec![
                (CollectionVersion::Collection1, QaBitLayout::collection1()),
                (CollectionVersion::Collection2, QaBitLayout::collection2()),
            ],
        }
    }
}

/// Decodes quality bitsets into validity masks
#[derive(Debug, Clone)]
pub struct QualityMaskExtractor {
    // Pre-validated rejection bits per collection
    rejection: Vec<(CollectionVersion, QaWord)>,
}

impl QualityMaskExtractor {
    pub fn new(config: &QaMaskConfig) -> FusionResult<Self> {
        let rejection = config
            .layouts
            .iter()
            .map(|(version, layout)| Ok((*version, layout.rejection_bits()?)))
            .collect::<FusionResult<Vec<_>>>()?;
        Ok(Self { rejection })
    }

    /// True where none of the layout's bits is set
    pub fn extract(quality: ArrayView2<'_, QaWord>, layout: &QaBitLayout) -> FusionResult<QualityMask> {
        let bits = layout.rejection_bits()?;
        Ok(Self::extract_bits(quality, bits))
    }

    fn extract_bits(quality: ArrayView2<'_, QaWord>, bits: QaWord) -> QualityMask {
        #[cfg(feature = "parallel")]
        {
            ndarray::Zip::from(quality).par_map_collect(|&word| (word & bits) == 0)
        }
        #[cfg(not(feature = "parallel"))]
        {
            quality.mapv(|word| (word & bits) == 0)
        }
    }

    /// Attach the scene's quality mask without applying it
    pub fn attach(&self, scene: &Scene) -> FusionResult<Scene> {
        let collection = scene.sensor().collection;
        let bits = self
            .rejection
            .iter()
            .find(|(version, _)| *version == collection)
            .map(|(_, bits)| *bits)
            .ok_or_else(|| FusionError::UnsupportedSensor {
                sensor: scene.sensor().to_string(),
            })?;

        let mask = Self::extract_bits(scene.quality(), bits);
        log::debug!(
            "Scene {}: quality bits {:#06x} reject {} pixels",
            scene.metadata().id,
            bits,
            mask.iter().filter(|&&ok| !ok).count()
        );
        scene.with_pending_mask(mask)
    }
}
