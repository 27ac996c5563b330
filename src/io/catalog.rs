use crate::core::collection::SceneFilter;
use crate::types::{FusionResult, RawScene, SensorId};

/// Source of raw scenes; remote catalogs live outside this crate
pub trait SceneCatalog {
    /// Scenes whose metadata passes `filter`, in catalog order
    fn query(&self, filter: &SceneFilter) -> FusionResult<Vec<RawScene>>;
}

/// A catalog over scenes already held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    scenes: Vec<RawScene>,
}

impl InMemoryCatalog {
    pub fn new(scenes: Vec<RawScene>) -> Self {
        Self { scenes }
    }

    pub fn insert(&mut self, scene: RawScene) {
        self.scenes.push(scene);
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    /// Filtered scenes of a single sensor; unparsable identifiers never match
    pub fn query_sensor(&self, sensor: SensorId, filter: &SceneFilter) -> FusionResult<Vec<RawScene>> {
        Ok(self
            .query(filter)?
            .into_iter()
            .filter(|raw| raw.sensor.parse::<SensorId>().map_or(false, |id| id == sensor))
            .collect())
    }
}

impl SceneCatalog for InMemoryCatalog {
    fn query(&self, filter: &SceneFilter) -> FusionResult<Vec<RawScene>> {
        let matched: Vec<RawScene> = self
            .scenes
            .iter()
            .filter(|raw| filter.matches(&raw.metadata))
            .cloned()
            .collect();

        log::debug!(
            "Catalog query matched {} of {} scenes",
            matched.len(),
            self.scenes.len()
        );
        Ok(matched)
    }
}
