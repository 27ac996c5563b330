use chrono::{DateTime, Utc};
use ndarray::{ArcArray2, Array2, ArrayView2, Zip};
use num_traits::AsPrimitive;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::OnceLock;

/// Fixed-point scale of surface reflectance (reflectance x 10 000)
pub const REFLECTANCE_SCALE: f32 = 10_000.0;

/// Scaled-integer surface reflectance
pub type Reflectance = i16;

/// One word of a per-pixel quality bitset
pub type QaWord = u16;

/// Boolean validity raster, true = usable pixel
pub type QualityMask = Array2<bool>;

/// A 2-D raster with an aligned validity array.
///
/// No-data is carried by the validity flag, never by a sentinel value, so a
/// valid zero and a masked pixel stay distinguishable. Storage is reference
/// counted: derived rasters share whatever they did not change.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster<T> {
    values: ArcArray2<T>,
    valid: ArcArray2<bool>,
}

impl<T: Copy> Raster<T> {
    /// Wrap an array with every pixel valid
    pub fn new(values: Array2<T>) -> Self {
        let valid = Array2::from_elem(values.dim(), true).into_shared();
        Self {
            values: values.into_shared(),
            valid,
        }
    }

    /// Wrap an array with an explicit validity array
    pub fn with_validity(values: Array2<T>, valid: Array2<bool>) -> FusionResult<Self> {
        if values.dim() != valid.dim() {
            return Err(FusionError::ShapeMismatch {
                operation: "raster validity".to_string(),
                expected: values.dim(),
                found: valid.dim(),
            });
        }
        Ok(Self {
            values: values.into_shared(),
            valid: valid.into_shared(),
        })
    }

    /// A raster where every pixel is no-data
    pub fn no_data(dim: (usize, usize), fill: T) -> Self {
        Self {
            values: Array2::from_elem(dim, fill).into_shared(),
            valid: Array2::from_elem(dim, false).into_shared(),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn values(&self) -> ArrayView2<'_, T> {
        self.values.view()
    }

    pub fn validity(&self) -> ArrayView2<'_, bool> {
        self.valid.view()
    }

    /// Value at a pixel, `None` when the pixel is no-data or out of bounds
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        match self.valid.get((row, col)) {
            Some(true) => self.values.get((row, col)).copied(),
            _ => None,
        }
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// New raster sharing these values, valid only where `mask` is also true
    pub fn restrict(&self, mask: ArrayView2<'_, bool>) -> FusionResult<Self> {
        if mask.dim() != self.dim() {
            return Err(FusionError::ShapeMismatch {
                operation: "mask composition".to_string(),
                expected: self.dim(),
                found: mask.dim(),
            });
        }
        let valid = Zip::from(&self.valid)
            .and(mask)
            .map_collect(|&v, &m| v && m);
        Ok(Self {
            values: self.values.clone(),
            valid: valid.into_shared(),
        })
    }

    /// New raster with replaced values and this raster's validity
    pub fn with_values<U: Copy>(&self, values: Array2<U>) -> FusionResult<Raster<U>> {
        if values.dim() != self.dim() {
            return Err(FusionError::ShapeMismatch {
                operation: "raster values".to_string(),
                expected: self.dim(),
                found: values.dim(),
            });
        }
        Ok(Raster {
            values: values.into_shared(),
            valid: self.valid.clone(),
        })
    }

    /// Values with every no-data pixel replaced by `fill`
    pub fn filled(&self, fill: T) -> Array2<T> {
        Zip::from(&self.values)
            .and(&self.valid)
            .map_collect(|&v, &ok| if ok { v } else { fill })
    }

    pub fn to_f32(&self) -> Raster<f32>
    where
        T: AsPrimitive<f32>,
    {
        Raster {
            values: self.values.mapv(|v| v.as_()).into_shared(),
            valid: self.valid.clone(),
        }
    }
}

/// A reflectance band
pub type Band = Raster<Reflectance>;

/// Canonical band names shared by every supported sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BandName {
    Blue,
    Green,
    Red,
    Nir,
    Swir1,
    Swir2,
    QualityBits,
}

impl BandName {
    /// The six reflectance bands, in spectral order
    pub const REFLECTANCE: [BandName; 6] = [
        BandName::Blue,
        BandName::Green,
        BandName::Red,
        BandName::Nir,
        BandName::Swir1,
        BandName::Swir2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BandName::Blue => "Blue",
            BandName::Green => "Green",
            BandName::Red => "Red",
            BandName::Nir => "NIR",
            BandName::Swir1 => "SWIR1",
            BandName::Swir2 => "SWIR2",
            BandName::QualityBits => "QualityBits",
        }
    }
}

impl std::fmt::Display for BandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BandName {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BLUE" => Ok(BandName::Blue),
            "GREEN" => Ok(BandName::Green),
            "RED" => Ok(BandName::Red),
            "NIR" => Ok(BandName::Nir),
            "SWIR1" => Ok(BandName::Swir1),
            "SWIR2" => Ok(BandName::Swir2),
            "QUALITYBITS" => Ok(BandName::QualityBits),
            _ => Err(FusionError::InvalidFormat(format!("Unknown band name: {}", s))),
        }
    }
}

/// Landsat platforms with surface reflectance products
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Landsat5,
    Landsat7,
    Landsat8,
    Landsat9,
}

impl Platform {
    pub fn instrument(self) -> Instrument {
        match self {
            Platform::Landsat5 => Instrument::Tm,
            Platform::Landsat7 => Instrument::EtmPlus,
            Platform::Landsat8 | Platform::Landsat9 => Instrument::Oli,
        }
    }

    /// Catalog code, e.g. `LC08`
    pub fn code(self) -> &'static str {
        match self {
            Platform::Landsat5 => "LT05",
            Platform::Landsat7 => "LE07",
            Platform::Landsat8 => "LC08",
            Platform::Landsat9 => "LC09",
        }
    }
}

/// Instrument family; decides whether cross-sensor calibration applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instrument {
    Tm,      // Thematic Mapper
    EtmPlus, // Enhanced Thematic Mapper Plus
    Oli,     // Operational Land Imager
}

/// Product collection generation; QA bit layouts differ between them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionVersion {
    Collection1,
    Collection2,
}

/// Typed sensor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorId {
    pub platform: Platform,
    pub collection: CollectionVersion,
}

impl SensorId {
    pub fn new(platform: Platform, collection: CollectionVersion) -> Self {
        Self {
            platform,
            collection,
        }
    }

    pub fn instrument(&self) -> Instrument {
        self.platform.instrument()
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let collection = match self.collection {
            CollectionVersion::Collection1 => "C01",
            CollectionVersion::Collection2 => "C02",
        };
        write!(f, "{}/{}", self.platform.code(), collection)
    }
}

/// Catalog identifier pattern, compiled on first use
fn sensor_pattern() -> &'static Result<Regex, regex::Error> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(?:LANDSAT/)?(LT05|LE07|LC08|LC09)[/_](C0[12])(?:[/_].*)?$")
    })
}

impl FromStr for SensorId {
    type Err = FusionError;

    /// Accepts catalog identifiers such as `LANDSAT/LC08/C01/T1_SR`,
    /// `LE07/C02` or `LT05_C01`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pattern = sensor_pattern()
            .as_ref()
            .map_err(|e| FusionError::InvalidConfig(format!("Sensor pattern error: {}", e)))?;

        let unsupported = || FusionError::UnsupportedSensor {
            sensor: s.to_string(),
        };
        let captures = pattern.captures(s.trim()).ok_or_else(unsupported)?;

        let platform = match captures[1].to_ascii_uppercase().as_str() {
            "LT05" => Platform::Landsat5,
            "LE07" => Platform::Landsat7,
            "LC08" => Platform::Landsat8,
            "LC09" => Platform::Landsat9,
            _ => return Err(unsupported()),
        };
        let collection = match captures[2].to_ascii_uppercase().as_str() {
            "C01" => CollectionVersion::Collection1,
            "C02" => CollectionVersion::Collection2,
            _ => return Err(unsupported()),
        };

        Ok(SensorId::new(platform, collection))
    }
}

/// Geospatial bounding box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }
}

/// Affine pixel-to-map transformation (GDAL ordering)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

/// Coordinate reference of an exported raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordinateSystem {
    /// Geographic coordinates (latitude, longitude)
    Geographic,
    /// Projected coordinates (e.g., UTM)
    Projected { epsg: u32 },
}

/// Catalog metadata carried unchanged through every transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub id: String,
    pub acquired: DateTime<Utc>,
    pub cloud_cover: f32,    // percent
    pub geometric_rmse: f32, // meters
    pub image_quality: u8,
    pub footprint: Option<BoundingBox>,
}

/// A band as delivered by the catalog, before schema normalization
#[derive(Debug, Clone)]
pub enum RawBand {
    Reflectance(Array2<Reflectance>),
    Bitset(Array2<QaWord>),
}

impl RawBand {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            RawBand::Reflectance(data) => data.dim(),
            RawBand::Bitset(data) => data.dim(),
        }
    }
}

/// A scene with sensor-specific band names
#[derive(Debug, Clone)]
pub struct RawScene {
    pub sensor: String,
    pub metadata: SceneMetadata,
    pub bands: HashMap<String, RawBand>,
}

/// An immutable scene with canonical band names.
///
/// The quality mask produced by the extractor is held as a pending mask until
/// [`Scene::apply_quality_mask`] folds it into every band's validity.
#[derive(Debug, Clone)]
pub struct Scene {
    sensor: SensorId,
    metadata: SceneMetadata,
    bands: BTreeMap<BandName, Band>,
    quality: ArcArray2<QaWord>,
    pending_mask: Option<ArcArray2<bool>>,
}

impl Scene {
    pub fn new(
        sensor: SensorId,
        metadata: SceneMetadata,
        bands: BTreeMap<BandName, Band>,
        quality: Array2<QaWord>,
    ) -> FusionResult<Self> {
        if bands.contains_key(&BandName::QualityBits) {
            return Err(FusionError::InvalidFormat(
                "QualityBits must be supplied as the quality bitset, not as a reflectance band".to_string(),
            ));
        }
        let expected = quality.dim();
        for (name, band) in &bands {
            if band.dim() != expected {
                return Err(FusionError::ShapeMismatch {
                    operation: format!("scene {} band {}", metadata.id, name),
                    expected,
                    found: band.dim(),
                });
            }
        }

        Ok(Self {
            sensor,
            metadata,
            bands,
            quality: quality.into_shared(),
            pending_mask: None,
        })
    }

    pub fn sensor(&self) -> SensorId {
        self.sensor
    }

    pub fn metadata(&self) -> &SceneMetadata {
        &self.metadata
    }

    pub fn acquired(&self) -> DateTime<Utc> {
        self.metadata.acquired
    }

    pub fn dim(&self) -> (usize, usize) {
        self.quality.dim()
    }

    pub fn band(&self, name: BandName) -> Option<&Band> {
        self.bands.get(&name)
    }

    /// Band lookup that reports the operation needing it when absent
    pub fn require_band(&self, name: BandName, operation: &str) -> FusionResult<&Band> {
        self.bands.get(&name).ok_or_else(|| FusionError::MissingBand {
            band: name.to_string(),
            sensor: self.sensor.to_string(),
            operation: operation.to_string(),
        })
    }

    pub fn bands(&self) -> impl Iterator<Item = (BandName, &Band)> {
        self.bands.iter().map(|(name, band)| (*name, band))
    }

    pub fn band_names(&self) -> Vec<BandName> {
        self.bands.keys().copied().collect()
    }

    pub fn quality(&self) -> ArrayView2<'_, QaWord> {
        self.quality.view()
    }

    pub fn pending_mask(&self) -> Option<ArrayView2<'_, bool>> {
        self.pending_mask.as_ref().map(|mask| mask.view())
    }

    /// Copy of this scene with a quality mask attached but not applied
    pub fn with_pending_mask(&self, mask: QualityMask) -> FusionResult<Scene> {
        if mask.dim() != self.dim() {
            return Err(FusionError::ShapeMismatch {
                operation: format!("quality mask for scene {}", self.metadata.id),
                expected: self.dim(),
                found: mask.dim(),
            });
        }
        Ok(Scene {
            pending_mask: Some(mask.into_shared()),
            ..self.clone()
        })
    }

    /// Copy of this scene with replaced reflectance bands; everything else is kept
    pub fn with_bands(&self, bands: BTreeMap<BandName, Band>) -> FusionResult<Scene> {
        let expected = self.dim();
        for (name, band) in &bands {
            if *name == BandName::QualityBits {
                return Err(FusionError::InvalidFormat(
                    "QualityBits cannot be replaced as a reflectance band".to_string(),
                ));
            }
            if band.dim() != expected {
                return Err(FusionError::ShapeMismatch {
                    operation: format!("scene {} band {}", self.metadata.id, name),
                    expected,
                    found: band.dim(),
                });
            }
        }

        Ok(Scene {
            sensor: self.sensor,
            metadata: self.metadata.clone(),
            bands,
            quality: self.quality.clone(),
            pending_mask: self.pending_mask.clone(),
        })
    }

    /// Fold the pending quality mask into every band's validity.
    ///
    /// Band values are shared with this scene, only validity is recomputed.
    /// Without a pending mask the scene is returned as is.
    pub fn apply_quality_mask(&self) -> FusionResult<Scene> {
        let mask = match &self.pending_mask {
            Some(mask) => mask,
            None => return Ok(self.clone()),
        };

        let mut bands = BTreeMap::new();
        for (name, band) in &self.bands {
            bands.insert(*name, band.restrict(mask.view())?);
        }

        let usable = mask.iter().filter(|&&v| v).count();
        if usable == 0 {
            log::warn!("Scene {} is fully masked by its quality band", self.metadata.id);
        } else {
            log::debug!(
                "Scene {}: {} of {} pixels usable after quality masking",
                self.metadata.id,
                usable,
                mask.len()
            );
        }

        Ok(Scene {
            sensor: self.sensor,
            metadata: self.metadata.clone(),
            bands,
            quality: self.quality.clone(),
            pending_mask: None,
        })
    }
}

/// Per-pixel numerical degeneracies; always recovered locally as no-data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFault {
    /// An input band was already no-data
    MaskedInput,
    /// The per-pixel least-squares system could not be solved
    SingularSystem,
    /// Every abundance was zero or negative after clamping
    NonPositiveAbundances,
    /// A ratio denominator was (nearly) zero
    DegenerateDenominator,
    /// No valid observation contributed to a composite pixel
    EmptySample,
}

/// Count per-pixel faults and log them once per operation
pub fn log_pixel_faults<I>(operation: &str, faults: I)
where
    I: IntoIterator<Item = PixelFault>,
{
    let mut counts: HashMap<PixelFault, usize> = HashMap::new();
    for fault in faults {
        *counts.entry(fault).or_insert(0) += 1;
    }
    for (fault, count) in counts {
        log::debug!("{}: {} pixel(s) recovered as no-data ({:?})", operation, count, fault);
    }
}

/// Error types for scene processing.
///
/// Only structural problems are errors; per-pixel degeneracies are
/// [`PixelFault`]s and become no-data.
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("Unsupported sensor: {sensor}")]
    UnsupportedSensor { sensor: String },

    #[error("Missing band '{band}' (sensor {sensor}) during {operation}")]
    MissingBand {
        band: String,
        sensor: String,
        operation: String,
    },

    #[error("Shape mismatch in {operation}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        operation: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Endmember configuration error: {0}")]
    EndmemberMismatch(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Empty collection: {0}")]
    EmptyCollection(String),
}

/// Result type for scene operations
pub type FusionResult<T> = Result<T, FusionError>;
