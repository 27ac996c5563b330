use crate::core::collection::SceneCollection;
use crate::core::composite::Composite;
use crate::types::{CoordinateSystem, FusionError, FusionResult, GeoTransform};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// One exported band with no-data already filled in
#[derive(Debug, Clone, PartialEq)]
pub struct ProductBand {
    pub name: String,
    pub data: Array2<f32>,
}

/// Georeferenced multi-band raster ready for a writer
#[derive(Debug, Clone, PartialEq)]
pub struct RasterProduct {
    pub bands: Vec<ProductBand>,
    pub geo_transform: GeoTransform,
    pub crs: CoordinateSystem,
    pub nodata_value: f32,
}

impl RasterProduct {
    pub fn from_composites(
        composites: &[Composite],
        geo_transform: GeoTransform,
        crs: CoordinateSystem,
        nodata_value: f32,
    ) -> FusionResult<Self> {
        let first = composites.first().ok_or_else(|| {
            FusionError::EmptyCollection("raster product needs at least one composite".to_string())
        })?;
        let dim = first.raster.dim();

        let bands = composites
            .iter()
            .map(|composite| {
                if composite.raster.dim() != dim {
                    return Err(FusionError::ShapeMismatch {
                        operation: format!("raster product band {}", composite.name),
                        expected: dim,
                        found: composite.raster.dim(),
                    });
                }
                Ok(ProductBand {
                    name: composite.name.clone(),
                    data: composite.raster.filled(nodata_value),
                })
            })
            .collect::<FusionResult<Vec<_>>>()?;

        log::info!(
            "Raster product: {} band(s), {}x{}, nodata {}",
            bands.len(),
            dim.0,
            dim.1,
            nodata_value
        );

        Ok(Self {
            bands,
            geo_transform,
            crs,
            nodata_value,
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.bands.first().map(|b| b.data.dim()).unwrap_or((0, 0))
    }

    pub fn band(&self, name: &str) -> Option<&ProductBand> {
        self.bands.iter().find(|b| b.name == name)
    }
}

/// One row of the exported scene metadata table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadataRow {
    pub id: String,
    pub sensor: String,
    pub acquired: DateTime<Utc>,
    pub cloud_cover: f32,
    pub geometric_rmse: f32,
    pub image_quality: u8,
}

/// Metadata of every scene that entered a composite, in collection order
pub fn metadata_table(collection: &SceneCollection) -> Vec<SceneMetadataRow> {
    collection
        .iter()
        .map(|scene| {
            let metadata = scene.metadata();
            SceneMetadataRow {
                id: metadata.id.clone(),
                sensor: scene.sensor().to_string(),
                acquired: metadata.acquired,
                cloud_cover: metadata.cloud_cover,
                geometric_rmse: metadata.geometric_rmse,
                image_quality: metadata.image_quality,
            }
        })
        .collect()
}
