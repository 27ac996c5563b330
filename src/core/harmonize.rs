use crate::types::{BandName, FusionResult, Instrument, Reflectance, Scene};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Affine correction of one band: `out = round(v * slope + intercept)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandCoefficient {
    pub band: BandName,
    pub slope: f64,
    /// Intercept in scaled reflectance units (already x 10 000)
    pub intercept: f64,
}

/// Cross-sensor calibration table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarmonizationTable {
    /// Instrument whose measurement scale the others are mapped onto
    pub reference: Instrument,
    /// Instruments that need the correction
    pub calibrated: Vec<Instrument>,
    pub coefficients: Vec<BandCoefficient>,
}

impl HarmonizationTable {
    /// Roy et al. (2016) ETM+ to OLI surface reflectance coefficients,
    /// applied to both TM and ETM+
    pub fn roy_2016() -> Self {
        let slopes = [0.8474, 0.8483, 0.9047, 0.8462, 0.8937, 0.9071];
        let intercepts = [0.0003, 0.0088, 0.0061, 0.0412, 0.0254, 0.0172];

        let coefficients = BandName::REFLECTANCE
            .iter()
            .zip(slopes.iter().zip(intercepts.iter()))
            .map(|(band, (&slope, &intercept))| BandCoefficient {
                band: *band,
                slope,
                intercept: (intercept * f64::from(crate::types::REFLECTANCE_SCALE)).round(),
            })
            .collect();

        Self {
            reference: Instrument::Oli,
            calibrated: vec![Instrument::Tm, Instrument::EtmPlus],
            coefficients,
        }
    }

    pub fn needs_calibration(&self, instrument: Instrument) -> bool {
        instrument != self.reference && self.calibrated.contains(&instrument)
    }
}

impl Default for HarmonizationTable {
    fn default() -> Self {
        Self::roy_2016()
    }
}

/// Maps calibrated-family scenes onto the reference sensor's reflectance scale
#[derive(Debug, Clone)]
pub struct Harmonizer {
    table: HarmonizationTable,
}

impl Harmonizer {
    pub fn new(table: HarmonizationTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &HarmonizationTable {
        &self.table
    }

    /// Apply the per-band affine correction.
    ///
    /// Reference-sensor scenes come back unchanged. Validity, the quality
    /// bitset and any pending mask are carried over untouched; bands the
    /// table does not name are shared as is.
    pub fn harmonize(&self, scene: &Scene) -> FusionResult<Scene> {
        let instrument = scene.sensor().instrument();
        if !self.table.needs_calibration(instrument) {
            log::debug!(
                "Scene {} ({:?}) already on the reference scale",
                scene.metadata().id,
                instrument
            );
            return Ok(scene.clone());
        }

        log::info!(
            "Harmonizing scene {} ({:?} -> {:?})",
            scene.metadata().id,
            instrument,
            self.table.reference
        );

        let mut bands: BTreeMap<BandName, _> =
            scene.bands().map(|(name, band)| (name, band.clone())).collect();

        for coefficient in &self.table.coefficients {
            let band = scene.require_band(coefficient.band, "harmonize")?;
            let corrected = Self::apply_affine(band.values(), coefficient.slope, coefficient.intercept);
            bands.insert(coefficient.band, band.with_values(corrected)?);
        }

        scene.with_bands(bands)
    }

    fn apply_affine(
        values: ndarray::ArrayView2<'_, Reflectance>,
        slope: f64,
        intercept: f64,
    ) -> Array2<Reflectance> {
        // `as` saturates at the i16 bounds
        let correct = move |v: Reflectance| (f64::from(v) * slope + intercept).round() as Reflectance;

        #[cfg(feature = "parallel")]
        {
            ndarray::Zip::from(values).par_map_collect(move |&v| correct(v))
        }
        #[cfg(not(feature = "parallel"))]
        {
            values.mapv(correct)
        }
    }
}

impl Default for Harmonizer {
    fn default() -> Self {
        Self::new(HarmonizationTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionVersion, FusionError, Platform, Raster, SceneMetadata, SensorId};
    use chrono::TimeZone;
    use ndarray::{array, Array2};

    fn constant_scene(platform: Platform, value: i16, bands: &[BandName]) -> Scene {
        let mut map = BTreeMap::new();
        for band in bands {
            map.insert(*band, Raster::new(Array2::from_elem((3, 3), value)));
        }
        Scene::new(
            SensorId::new(platform, CollectionVersion::Collection1),
            SceneMetadata {
                id: "synthetic".to_string(),
                acquired: chrono::Utc.with_ymd_and_hms(2005, 8, 1, 13, 0, 0).unwrap(),
                cloud_cover: 1.0,
                geometric_rmse: 5.0,
                image_quality: 9,
                footprint: None,
            },
            map,
            Array2::from_elem((3, 3), 66u16),
        )
        .unwrap()
    }

    #[test]
    fn test_roy_intercepts_are_scaled() {
        let table = HarmonizationTable::roy_2016();
        let intercepts: Vec<f64> = table.coefficients.iter().map(|c| c.intercept).collect();
        assert_eq!(intercepts, vec![3.0, 88.0, 61.0, 412.0, 254.0, 172.0]);
    }

    #[test]
    fn test_constant_band_exact() {
        let scene = constant_scene(Platform::Landsat5, 1000, &BandName::REFLECTANCE);
        let out = Harmonizer::default().harmonize(&scene).unwrap();

        // 1000 * 0.8474 + 3 = 850.4 ; 1000 * 0.9047 + 61 = 965.7
        assert_eq!(out.band(BandName::Blue).unwrap().get(1, 1), Some(850));
        assert_eq!(out.band(BandName::Red).unwrap().get(0, 2), Some(966));
        for coefficient in &HarmonizationTable::roy_2016().coefficients {
            let expected = (1000.0 * coefficient.slope + coefficient.intercept).round() as i16;
            let band = out.band(coefficient.band).unwrap();
            assert!(band.values().iter().all(|&v| v == expected));
        }
        assert_eq!(out.quality(), scene.quality());
        assert_eq!(out.metadata(), scene.metadata());
    }

    #[test]
    fn test_reference_sensor_is_untouched() {
        let scene = constant_scene(Platform::Landsat8, 1234, &BandName::REFLECTANCE);
        let out = Harmonizer::default().harmonize(&scene).unwrap();
        for band in BandName::REFLECTANCE {
            assert_eq!(out.band(band), scene.band(band));
        }
    }

    #[test]
    fn test_validity_survives_harmonization() {
        let scene = constant_scene(Platform::Landsat7, 500, &BandName::REFLECTANCE)
            .with_pending_mask(array![
                [true, false, true],
                [true, true, true],
                [false, true, true]
            ])
            .unwrap()
            .apply_quality_mask()
            .unwrap();
        let out = Harmonizer::default().harmonize(&scene).unwrap();
        let nir = out.band(BandName::Nir).unwrap();
        assert_eq!(nir.get(0, 1), None);
        assert_eq!(nir.get(2, 0), None);
        assert_eq!(nir.get(1, 1), Some((500.0f64 * 0.8462 + 412.0).round() as i16));
    }

    #[test]
    fn test_saturates_to_i16() {
        let scene = constant_scene(Platform::Landsat5, i16::MAX, &BandName::REFLECTANCE);
        let table = HarmonizationTable {
            reference: Instrument::Oli,
            calibrated: vec![Instrument::Tm],
            coefficients: vec![BandCoefficient {
                band: BandName::Nir,
                slope: 2.0,
                intercept: 0.0,
            }],
        };
        let out = Harmonizer::new(table).harmonize(&scene).unwrap();
        assert_eq!(out.band(BandName::Nir).unwrap().get(0, 0), Some(i16::MAX));
    }

    #[test]
    fn test_missing_band() {
        let scene = constant_scene(Platform::Landsat7, 100, &[BandName::Blue, BandName::Green]);
        match Harmonizer::default().harmonize(&scene) {
            Err(FusionError::MissingBand { band, operation, .. }) => {
                assert_eq!(band, "Red");
                assert_eq!(operation, "harmonize");
            }
            other => panic!("expected MissingBand, got {:?}", other),
        }
    }
}
