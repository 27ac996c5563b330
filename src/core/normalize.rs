use crate::types::{
    BandName, CollectionVersion, FusionError, FusionResult, Platform, RawBand, RawScene, Scene,
    SensorId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One raw band name bound to its canonical name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandAlias {
    pub raw: String,
    pub canonical: BandName,
}

impl BandAlias {
    pub fn new(raw: &str, canonical: BandName) -> Self {
        Self {
            raw: raw.to_string(),
            canonical,
        }
    }
}

/// Band aliases of one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub sensor: SensorId,
    pub aliases: Vec<BandAlias>,
}

/// Fixed mapping from sensor identifier to canonical band names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandSchemaTable {
    pub entries: Vec<SchemaEntry>,
}

impl BandSchemaTable {
    /// Aliases for a sensor, if the table knows it
    pub fn aliases(&self, sensor: SensorId) -> Option<&[BandAlias]> {
        self.entries
            .iter()
            .find(|entry| entry.sensor == sensor)
            .map(|entry| entry.aliases.as_slice())
    }
}

impl Default for BandSchemaTable {
    /// Collection 1 SR and Collection 2 L2 layouts of TM, ETM+ and OLI
    fn default() -> Self {
        // TM and ETM+ skip the thermal band 6; OLI starts at coastal/aerosol band 1
        let tm_numbers = ["1", "2", "3", "4", "5", "7"];
        let oli_numbers = ["2", "3", "4", "5", "6", "7"];

        let layout = |numbers: &[&str; 6], prefix: &str, qa: &str| -> Vec<BandAlias> {
            let mut aliases: Vec<BandAlias> = numbers
                .iter()
                .zip(BandName::REFLECTANCE.iter())
                .map(|(number, band)| BandAlias::new(&format!("{}{}", prefix, number), *band))
                .collect();
            aliases.push(BandAlias::new(qa, BandName::QualityBits));
            aliases
        };

        let mut entries = Vec::new();
        for platform in [
            Platform::Landsat5,
            Platform::Landsat7,
            Platform::Landsat8,
            Platform::Landsat9,
        ] {
            let numbers = match platform {
                Platform::Landsat5 | Platform::Landsat7 => &tm_numbers,
                Platform::Landsat8 | Platform::Landsat9 => &oli_numbers,
            };
            // Landsat 9 was only ever processed into Collection 2
            if platform != Platform::Landsat9 {
                entries.push(SchemaEntry {
                    sensor: SensorId::new(platform, CollectionVersion::Collection1),
                    aliases: layout(numbers, "B", "pixel_qa"),
                });
            }
            entries.push(SchemaEntry {
                sensor: SensorId::new(platform, CollectionVersion::Collection2),
                aliases: layout(numbers, "SR_B", "QA_PIXEL"),
            });
        }

        Self { entries }
    }
}

/// Projects raw scenes onto the canonical band set
#[derive(Debug, Clone)]
pub struct BandNormalizer {
    table: BandSchemaTable,
}

impl BandNormalizer {
    pub fn new(table: BandSchemaTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &BandSchemaTable {
        &self.table
    }

    /// Rename the bands of a raw scene to canonical names.
    ///
    /// Bands not named by the table are dropped; metadata is copied unchanged.
    pub fn normalize(&self, raw: &RawScene) -> FusionResult<Scene> {
        let sensor: SensorId = raw.sensor.parse()?;
        let aliases = self
            .table
            .aliases(sensor)
            .ok_or_else(|| FusionError::UnsupportedSensor {
                sensor: raw.sensor.clone(),
            })?;

        log::debug!("Normalizing scene {} ({})", raw.metadata.id, sensor);

        let mut bands = BTreeMap::new();
        let mut quality = None;

        for alias in aliases {
            let source = raw.bands.get(&alias.raw).ok_or_else(|| FusionError::MissingBand {
                band: alias.raw.clone(),
                sensor: raw.sensor.clone(),
                operation: "normalize".to_string(),
            })?;

            match (alias.canonical, source) {
                (BandName::QualityBits, RawBand::Bitset(bits)) => {
                    quality = Some(bits.clone());
                }
                (BandName::QualityBits, RawBand::Reflectance(_)) => {
                    return Err(FusionError::InvalidFormat(format!(
                        "Band {} of scene {} must be a quality bitset",
                        alias.raw, raw.metadata.id
                    )));
                }
                (canonical, RawBand::Reflectance(values)) => {
                    bands.insert(canonical, crate::types::Raster::new(values.clone()));
                }
                (_, RawBand::Bitset(_)) => {
                    return Err(FusionError::InvalidFormat(format!(
                        "Band {} of scene {} must be reflectance, found a bitset",
                        alias.raw, raw.metadata.id
                    )));
                }
            }
        }

        let quality = quality.ok_or_else(|| FusionError::MissingBand {
            band: BandName::QualityBits.to_string(),
            sensor: raw.sensor.clone(),
            operation: "normalize".to_string(),
        })?;

        Scene::new(sensor, raw.metadata.clone(), bands, quality)
    }
}

impl Default for BandNormalizer {
    fn default() -> Self {
        Self::new(BandSchemaTable::default())
    }
}
