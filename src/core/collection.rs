use crate::core::indices::{IndexEngine, IndexRaster, SpectralIndex};
use crate::types::{BandName, BoundingBox, FusionError, FusionResult, Scene, SceneMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata predicates applied before any pixel work.
///
/// Every bound is strict (`<`), the date range is half-open `[start, end)`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SceneFilter {
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub max_cloud_cover: Option<f32>,
    pub max_geometric_rmse: Option<f32>,
    /// Required image quality score
    pub image_quality: Option<u8>,
    /// Scenes must have a footprint intersecting these bounds
    pub bounds: Option<BoundingBox>,
}

impl SceneFilter {
    /// Concession monitoring defaults: cloud cover < 16 %, geometric
    /// RMSE < 10 m and image quality 9
    pub fn concession(start: DateTime<Utc>, end: DateTime<Utc>, bounds: BoundingBox) -> Self {
        Self {
            date_range: Some((start, end)),
            max_cloud_cover: Some(16.0),
            max_geometric_rmse: Some(10.0),
            image_quality: Some(9),
            bounds: Some(bounds),
        }
    }

    pub fn with_date_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.date_range = Some((start, end));
        self
    }

    pub fn matches(&self, metadata: &SceneMetadata) -> bool {
        if let Some((start, end)) = &self.date_range {
            if metadata.acquired < *start || metadata.acquired >= *end {
                return false;
            }
        }
        if let Some(max) = self.max_cloud_cover {
            if !(metadata.cloud_cover < max) {
                return false;
            }
        }
        if let Some(max) = self.max_geometric_rmse {
            if !(metadata.geometric_rmse < max) {
                return false;
            }
        }
        if let Some(quality) = self.image_quality {
            if metadata.image_quality != quality {
                return false;
            }
        }
        if let Some(bounds) = &self.bounds {
            match &metadata.footprint {
                Some(footprint) if footprint.intersects(bounds) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Ordered scenes sharing one band set and raster shape
#[derive(Debug, Clone, Default)]
pub struct SceneCollection {
    scenes: Vec<Scene>,
}

impl SceneCollection {
    pub fn new(scenes: Vec<Scene>) -> FusionResult<Self> {
        if let Some(first) = scenes.first() {
            let names = first.band_names();
            for scene in &scenes[1..] {
                Self::check_schema(first.dim(), &names, scene)?;
            }
        }
        Ok(Self { scenes })
    }

    fn check_schema(dim: (usize, usize), names: &[BandName], scene: &Scene) -> FusionResult<()> {
        if scene.dim() != dim {
            return Err(FusionError::ShapeMismatch {
                operation: format!("collection schema (scene {})", scene.metadata().id),
                expected: dim,
                found: scene.dim(),
            });
        }
        if scene.band_names() != names {
            return Err(FusionError::InvalidFormat(format!(
                "Scene {} has bands {:?}, collection has {:?}",
                scene.metadata().id,
                scene.band_names(),
                names
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Scene> {
        self.scenes.iter()
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    /// Raster shape shared by every scene, `None` when empty
    pub fn dim(&self) -> Option<(usize, usize)> {
        self.scenes.first().map(|scene| scene.dim())
    }

    /// Scenes whose metadata passes the filter, order kept
    pub fn filter(&self, filter: &SceneFilter) -> SceneCollection {
        let scenes: Vec<Scene> = self
            .scenes
            .iter()
            .filter(|scene| {
                let keep = filter.matches(scene.metadata());
                if !keep {
                    log::debug!("Scene {} dropped by metadata filter", scene.metadata().id);
                }
                keep
            })
            .cloned()
            .collect();

        log::info!("Filter kept {} of {} scenes", scenes.len(), self.scenes.len());
        SceneCollection { scenes }
    }

    /// This collection followed by `other`
    pub fn merge(&self, other: &SceneCollection) -> FusionResult<SceneCollection> {
        let mut scenes = self.scenes.clone();
        scenes.extend(other.scenes.iter().cloned());
        SceneCollection::new(scenes)
    }

    /// Newest first; scenes acquired at the same instant keep their order
    pub fn sorted_by_acquisition(&self) -> SceneCollection {
        let mut scenes = self.scenes.clone();
        scenes.sort_by(|a, b| b.acquired().cmp(&a.acquired()));
        SceneCollection { scenes }
    }

    /// One index raster per scene, in collection order
    pub fn map_index(&self, engine: &IndexEngine, index: SpectralIndex) -> FusionResult<Vec<IndexRaster>> {
        log::info!("Computing {} over {} scenes", index, self.scenes.len());

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.scenes
                .par_iter()
                .map(|scene| engine.compute(index, scene))
                .collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            self.scenes
                .iter()
                .map(|scene| engine.compute(index, scene))
                .collect()
        }
    }
}

impl<'a> IntoIterator for &'a SceneCollection {
    type Item = &'a Scene;
    type IntoIter = std::slice::Iter<'a, Scene>;

    fn into_iter(self) -> Self::IntoIter {
        self.scenes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionVersion, Platform, Raster, SensorId};
    use chrono::TimeZone;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    fn metadata(id: &str, day: u32, cloud: f32) -> SceneMetadata {
        SceneMetadata {
            id: id.to_string(),
            acquired: Utc.with_ymd_and_hms(2020, 7, day, 13, 40, 0).unwrap(),
            cloud_cover: cloud,
            geometric_rmse: 7.5,
            image_quality: 9,
            footprint: Some(BoundingBox {
                min_lon: -56.5,
                max_lon: -55.5,
                min_lat: -2.0,
                max_lat: -1.0,
            }),
        }
    }

    fn scene(meta: SceneMetadata, dim: (usize, usize)) -> Scene {
        let mut bands = BTreeMap::new();
        bands.insert(BandName::Red, Raster::new(Array2::from_elem(dim, 500i16)));
        bands.insert(BandName::Nir, Raster::new(Array2::from_elem(dim, 3000i16)));
        Scene::new(
            SensorId::new(Platform::Landsat8, CollectionVersion::Collection1),
            meta,
            bands,
            Array2::zeros(dim),
        )
        .unwrap()
    }

    fn concession_bounds() -> BoundingBox {
        BoundingBox {
            min_lon: -56.2,
            max_lon: -56.0,
            min_lat: -1.6,
            max_lat: -1.4,
        }
    }

    #[test]
    fn test_concession_filter_is_strict() {
        let filter = SceneFilter::concession(
            Utc.with_ymd_and_hms(2020, 7, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 8, 1, 0, 0, 0).unwrap(),
            concession_bounds(),
        );

        assert!(filter.matches(&metadata("a", 5, 15.9)));
        assert!(!filter.matches(&metadata("b", 5, 16.0)));

        let mut rmse = metadata("c", 5, 1.0);
        rmse.geometric_rmse = 10.0;
        assert!(!filter.matches(&rmse));

        let mut quality = metadata("d", 5, 1.0);
        quality.image_quality = 7;
        assert!(!filter.matches(&quality));

        let mut elsewhere = metadata("e", 5, 1.0);
        elsewhere.footprint = Some(BoundingBox {
            min_lon: 10.0,
            max_lon: 11.0,
            min_lat: 45.0,
            max_lat: 46.0,
        });
        assert!(!filter.matches(&elsewhere));
    }

    #[test]
    fn test_date_range_is_half_open() {
        let start = Utc.with_ymd_and_hms(2020, 7, 5, 13, 40, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 7, 9, 13, 40, 0).unwrap();
        let filter = SceneFilter::default().with_date_range(start, end);
        assert!(filter.matches(&metadata("start", 5, 0.0)));
        assert!(!filter.matches(&metadata("end", 9, 0.0)));
    }

    #[test]
    fn test_filter_and_sort_keep_order() {
        let collection = SceneCollection::new(vec![
            scene(metadata("a", 3, 5.0), (2, 2)),
            scene(metadata("b", 9, 50.0), (2, 2)),
            scene(metadata("c", 9, 1.0), (2, 2)),
            scene(metadata("d", 6, 2.0), (2, 2)),
        ])
        .unwrap();

        let filter = SceneFilter {
            max_cloud_cover: Some(16.0),
            ..SceneFilter::default()
        };
        let ids: Vec<_> = collection
            .filter(&filter)
            .iter()
            .map(|s| s.metadata().id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "c", "d"]);

        let sorted: Vec<_> = collection
            .sorted_by_acquisition()
            .iter()
            .map(|s| s.metadata().id.clone())
            .collect();
        assert_eq!(sorted, vec!["b", "c", "d", "a"]);
    }

    #[test]
    fn test_schema_mismatch_is_rejected() {
        let result = SceneCollection::new(vec![
            scene(metadata("a", 3, 5.0), (2, 2)),
            scene(metadata("b", 4, 5.0), (3, 2)),
        ]);
        assert!(matches!(result, Err(FusionError::ShapeMismatch { .. })));

        let small = SceneCollection::new(vec![scene(metadata("a", 3, 5.0), (2, 2))]).unwrap();
        let other = SceneCollection::new(vec![scene(metadata("b", 4, 5.0), (4, 4))]).unwrap();
        assert!(small.merge(&other).is_err());
    }

    #[test]
    fn test_map_index_preserves_order() {
        use crate::core::indices::IndexConfig;
        use crate::core::unmix::UnmixMode;

        let collection = SceneCollection::new(vec![
            scene(metadata("a", 3, 5.0), (2, 2)),
            scene(metadata("b", 9, 5.0), (2, 2)),
        ])
        .unwrap();
        let engine = IndexEngine::new(IndexConfig::new(UnmixMode::Constrained)).unwrap();
        let layers = collection.map_index(&engine, SpectralIndex::Ndvi).unwrap();

        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].acquired, collection.scenes()[0].acquired());
        assert_eq!(layers[1].acquired, collection.scenes()[1].acquired());
    }
}
