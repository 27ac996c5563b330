use crate::core::band_math::{evaluate, BandSource, Expr};
use crate::core::unmix::{EndmemberSet, SpectralUnmixer, UnmixMode};
use crate::types::{BandName, FusionError, FusionResult, Raster, Scene, REFLECTANCE_SCALE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived spectral indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectralIndex {
    /// Normalized Difference Vegetation Index
    Ndvi,
    /// Enhanced Vegetation Index
    Evi,
    /// Normalized Difference Water Index (McFeeters)
    Ndwi,
    /// Soil Adjusted Vegetation Index, L = 0.5
    Savi,
    /// Normalized Difference Fraction Index (Souza Jr. et al., 2005)
    Ndfi,
    /// Soil-to-vegetation fraction ratio used for degradation mapping
    Detex,
}

impl SpectralIndex {
    pub const ALL: [SpectralIndex; 6] = [
        SpectralIndex::Ndvi,
        SpectralIndex::Evi,
        SpectralIndex::Ndwi,
        SpectralIndex::Savi,
        SpectralIndex::Ndfi,
        SpectralIndex::Detex,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SpectralIndex::Ndvi => "NDVI",
            SpectralIndex::Evi => "EVI",
            SpectralIndex::Ndwi => "NDWI",
            SpectralIndex::Savi => "SAVI",
            SpectralIndex::Ndfi => "NDFI",
            SpectralIndex::Detex => "DETEX",
        }
    }

    /// Whether the index is computed on unmixed fractions
    pub fn needs_unmixing(&self) -> bool {
        matches!(self, SpectralIndex::Ndfi | SpectralIndex::Detex)
    }

    /// Operator tree of the index.
    ///
    /// Reflectance indices read canonical bands; NDFI and DETEX read the
    /// fractions of their endmember models.
    pub fn expression(&self) -> Expr {
        let unit = |band: BandName| Expr::band(band) / f64::from(REFLECTANCE_SCALE);
        match self {
            SpectralIndex::Ndvi => {
                Expr::normalized_difference(Expr::band(BandName::Nir), Expr::band(BandName::Red))
            }
            SpectralIndex::Evi => {
                let (nir, red, blue) = (unit(BandName::Nir), unit(BandName::Red), unit(BandName::Blue));
                2.5 * (nir.clone() - red.clone()) / (1.0 + nir + 6.0 * red - 7.5 * blue)
            }
            SpectralIndex::Ndwi => {
                Expr::normalized_difference(Expr::band(BandName::Green), Expr::band(BandName::Nir))
            }
            SpectralIndex::Savi => {
                let (nir, red) = (unit(BandName::Nir), unit(BandName::Red));
                1.5 * (nir.clone() - red.clone()) / (nir + red + 0.5)
            }
            SpectralIndex::Ndfi => {
                let shade_normalized_gv = Expr::fraction("GV") / (1.0 - Expr::fraction("Shade"));
                let non_green = Expr::fraction("NPV") + Expr::fraction("Soil");
                (shade_normalized_gv.clone() - non_green.clone()) / (shade_normalized_gv + non_green)
            }
            SpectralIndex::Detex => 120.0 * (Expr::fraction("soil") / Expr::fraction("GV")),
        }
    }
}

impl std::fmt::Display for SpectralIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for SpectralIndex {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpectralIndex::ALL
            .iter()
            .find(|index| index.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| FusionError::InvalidConfig(format!("Unknown spectral index: {}", s)))
    }
}

/// Endmember models behind the fraction indices.
///
/// There is no `Default`: the DETEX unmixing mode must be chosen explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub ndfi: EndmemberSet,
    pub detex: EndmemberSet,
    pub detex_mode: UnmixMode,
}

impl IndexConfig {
    /// Published endmember models with the given DETEX mode
    pub fn new(detex_mode: UnmixMode) -> Self {
        Self {
            ndfi: EndmemberSet::ndfi(),
            detex: EndmemberSet::detex(),
            detex_mode,
        }
    }
}

/// A derived single-band raster stamped with its source acquisition time
#[derive(Debug, Clone)]
pub struct IndexRaster {
    pub name: String,
    pub raster: Raster<f32>,
    pub acquired: DateTime<Utc>,
}

/// Computes spectral indices from prepared scenes
#[derive(Debug, Clone)]
pub struct IndexEngine {
    config: IndexConfig,
    ndfi_unmixer: SpectralUnmixer,
    detex_unmixer: SpectralUnmixer,
}

impl IndexEngine {
    pub fn new(config: IndexConfig) -> FusionResult<Self> {
        for (set, names) in [
            (&config.ndfi, &["GV", "Shade", "NPV", "Soil"][..]),
            (&config.detex, &["soil", "GV"][..]),
        ] {
            let present = set.names();
            if let Some(missing) = names.iter().find(|n| !present.iter().any(|p| p == *n)) {
                return Err(FusionError::EndmemberMismatch(format!(
                    "endmember '{}' is required by the index formula",
                    missing
                )));
            }
        }

        // NDFI is always fully constrained
        let ndfi_unmixer = SpectralUnmixer::new(config.ndfi.clone(), UnmixMode::Constrained)?;
        let detex_unmixer = SpectralUnmixer::new(config.detex.clone(), config.detex_mode)?;

        log::debug!(
            "Index engine ready (NDFI: {} endmembers, DETEX: {} endmembers, {:?})",
            config.ndfi.endmembers.len(),
            config.detex.endmembers.len(),
            config.detex_mode
        );

        Ok(Self {
            config,
            ndfi_unmixer,
            detex_unmixer,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Compute one index on a masked, harmonized scene
    pub fn compute(&self, index: SpectralIndex, scene: &Scene) -> FusionResult<IndexRaster> {
        log::debug!("Computing {} for scene {}", index, scene.metadata().id);

        let expr = index.expression();
        let raster = match index {
            SpectralIndex::Ndfi => {
                let fractions = self.ndfi_unmixer.unmix(scene)?;
                evaluate(&expr, &fractions, index.name())?
            }
            SpectralIndex::Detex => {
                let fractions = self.detex_unmixer.unmix(scene)?.percent_bytes()?;
                evaluate(&expr, &fractions, index.name())?
            }
            _ => evaluate(&expr, scene, index.name())?,
        };

        Ok(IndexRaster {
            name: index.name().to_string(),
            raster,
            acquired: scene.acquired(),
        })
    }

    /// Evaluate a caller-built expression; the result carries `acquired`
    pub fn evaluate(
        &self,
        expr: &Expr,
        source: &dyn BandSource,
        name: &str,
        acquired: DateTime<Utc>,
    ) -> FusionResult<IndexRaster> {
        Ok(IndexRaster {
            name: name.to_string(),
            raster: evaluate(expr, source, name)?,
            acquired,
        })
    }
}
