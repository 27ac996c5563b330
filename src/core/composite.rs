use crate::core::collection::SceneCollection;
use crate::core::indices::IndexRaster;
use crate::types::{BandName, FusionError, FusionResult, PixelFault, Raster};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Rasterized area of interest; pixels outside it are no-data in composites
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    pub name: String,
    pub mask: Array2<bool>,
}

impl AreaOfInterest {
    pub fn new(name: &str, mask: Array2<bool>) -> Self {
        Self {
            name: name.to_string(),
            mask,
        }
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.mask.get((row, col)).copied().unwrap_or(false)
    }
}

/// Compositing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeParams {
    /// Valid samples a pixel needs before its median is trusted
    pub min_observations: usize,
}

impl Default for CompositeParams {
    fn default() -> Self {
        Self { min_observations: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeStatistic {
    Median,
    Mosaic,
    MedianWithMosaicFallback,
}

/// A per-pixel temporal reduction
#[derive(Debug, Clone)]
pub struct Composite {
    pub name: String,
    pub statistic: CompositeStatistic,
    pub raster: Raster<f32>,
    /// Valid samples seen at each pixel
    pub observations: Array2<u32>,
}

/// Reduces a stack of same-shaped layers over time
#[derive(Debug, Clone)]
pub struct TemporalCompositor {
    params: CompositeParams,
}

impl TemporalCompositor {
    pub fn new(params: CompositeParams) -> FusionResult<Self> {
        if params.min_observations == 0 {
            return Err(FusionError::InvalidConfig(
                "min_observations must be at least 1".to_string(),
            ));
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &CompositeParams {
        &self.params
    }

    /// Per-pixel median of the valid samples.
    ///
    /// An even sample count averages the two middle values.
    pub fn median(&self, layers: &[IndexRaster], aoi: Option<&AreaOfInterest>) -> FusionResult<Composite> {
        let dim = Self::validate(layers, aoi, "median")?;
        log::info!(
            "Median composite of {} layers ({}x{})",
            layers.len(),
            dim.0,
            dim.1
        );

        let min_observations = self.params.min_observations;
        let reduce = |samples: &mut Vec<f64>| {
            if samples.len() < min_observations {
                None
            } else {
                median_of(samples)
            }
        };
        let (raster, observations) = Self::reduce_stack(layers, aoi, dim, &reduce)?;

        Ok(Composite {
            name: layers[0].name.clone(),
            statistic: CompositeStatistic::Median,
            raster,
            observations,
        })
    }

    /// Most recent valid sample per pixel.
    ///
    /// Layers are ordered by acquisition time, newest first; layers acquired
    /// at the same instant keep their input order.
    pub fn mosaic(&self, layers: &[IndexRaster], aoi: Option<&AreaOfInterest>) -> FusionResult<Composite> {
        let dim = Self::validate(layers, aoi, "mosaic")?;
        log::info!(
            "Mosaic of {} layers ({}x{})",
            layers.len(),
            dim.0,
            dim.1
        );

        let mut order: Vec<usize> = (0..layers.len()).collect();
        order.sort_by(|&a, &b| layers[b].acquired.cmp(&layers[a].acquired));
        let ordered: Vec<IndexRaster> = order.iter().map(|&i| layers[i].clone()).collect();

        // Samples arrive in stack order, so the first one is the newest
        let reduce = |samples: &mut Vec<f64>| samples.first().copied();
        let (raster, observations) = Self::reduce_stack(&ordered, aoi, dim, &reduce)?;

        Ok(Composite {
            name: layers[0].name.clone(),
            statistic: CompositeStatistic::Mosaic,
            raster,
            observations,
        })
    }

    /// Median of `primary`, with its gaps filled by the mosaic of `fallback`
    pub fn median_with_fallback(
        &self,
        primary: &[IndexRaster],
        fallback: &[IndexRaster],
        aoi: Option<&AreaOfInterest>,
    ) -> FusionResult<Composite> {
        let median = self.median(primary, aoi)?;
        let mosaic = self.mosaic(fallback, aoi)?;

        if median.raster.dim() != mosaic.raster.dim() {
            return Err(FusionError::ShapeMismatch {
                operation: "median_with_fallback".to_string(),
                expected: median.raster.dim(),
                found: mosaic.raster.dim(),
            });
        }

        let filled = Array2::from_shape_fn(median.raster.dim(), |(row, col)| {
            match (median.raster.get(row, col), mosaic.raster.get(row, col)) {
                (Some(m), _) => (m, true, median.observations[[row, col]]),
                (None, Some(f)) => (f, true, mosaic.observations[[row, col]]),
                (None, None) => (0.0, false, median.observations[[row, col]]),
            }
        });

        log::debug!(
            "median_with_fallback: {} pixel(s) filled from the mosaic",
            filled.iter().filter(|(_, ok, _)| *ok).count() - median.raster.valid_count()
        );

        let values = filled.mapv(|(v, _, _)| v);
        let valid = filled.mapv(|(_, ok, _)| ok);
        let observations = filled.mapv(|(_, _, n)| n);

        Ok(Composite {
            name: median.name,
            statistic: CompositeStatistic::MedianWithMosaicFallback,
            raster: Raster::with_validity(values, valid)?,
            observations,
        })
    }

    /// Per-band median reflectance composites named `<Band>_median`
    pub fn median_bands(
        &self,
        collection: &SceneCollection,
        bands: &[BandName],
        aoi: Option<&AreaOfInterest>,
    ) -> FusionResult<Vec<Composite>> {
        if collection.is_empty() {
            return Err(FusionError::EmptyCollection(
                "median_bands needs at least one scene".to_string(),
            ));
        }

        bands
            .iter()
            .map(|band| {
                let layers = collection
                    .iter()
                    .map(|scene| {
                        Ok(IndexRaster {
                            name: band.as_str().to_string(),
                            raster: scene.require_band(*band, "median_bands")?.to_f32(),
                            acquired: scene.acquired(),
                        })
                    })
                    .collect::<FusionResult<Vec<_>>>()?;

                let mut composite = self.median(&layers, aoi)?;
                composite.name = format!("{}_median", band);
                Ok(composite)
            })
            .collect()
    }

    /// Common shape of the stack; checks the AOI against it
    fn validate(
        layers: &[IndexRaster],
        aoi: Option<&AreaOfInterest>,
        operation: &str,
    ) -> FusionResult<(usize, usize)> {
        let first = layers.first().ok_or_else(|| {
            FusionError::EmptyCollection(format!("{} needs at least one layer", operation))
        })?;
        let dim = first.raster.dim();

        for layer in &layers[1..] {
            if layer.raster.dim() != dim {
                return Err(FusionError::ShapeMismatch {
                    operation: format!("{} ({})", operation, layer.name),
                    expected: dim,
                    found: layer.raster.dim(),
                });
            }
        }
        if let Some(aoi) = aoi {
            if aoi.mask.dim() != dim {
                return Err(FusionError::ShapeMismatch {
                    operation: format!("{} area of interest {}", operation, aoi.name),
                    expected: dim,
                    found: aoi.mask.dim(),
                });
            }
        }
        Ok(dim)
    }

    /// Gather each pixel's valid samples in stack order and reduce them
    fn reduce_stack<F>(
        layers: &[IndexRaster],
        aoi: Option<&AreaOfInterest>,
        dim: (usize, usize),
        reduce: &F,
    ) -> FusionResult<(Raster<f32>, Array2<u32>)>
    where
        F: Fn(&mut Vec<f64>) -> Option<f64> + Sync,
    {
        let pixel = |(row, col): (usize, usize)| -> (f32, bool, u32) {
            if aoi.map_or(false, |aoi| !aoi.contains(row, col)) {
                return (0.0, false, 0);
            }
            let mut samples: Vec<f64> = layers
                .iter()
                .filter_map(|layer| layer.raster.get(row, col))
                .map(f64::from)
                .collect();
            let count = samples.len() as u32;
            match reduce(&mut samples) {
                Some(v) => (v as f32, true, count),
                None => (0.0, false, count),
            }
        };

        #[cfg(feature = "parallel")]
        let reduced = Zip::indexed(&Array2::<()>::from_elem(dim, ())).par_map_collect(|idx, _| pixel(idx));
        #[cfg(not(feature = "parallel"))]
        let reduced = Zip::indexed(&Array2::<()>::from_elem(dim, ())).map_collect(|idx, _| pixel(idx));

        let values = reduced.mapv(|(v, _, _)| v);
        let valid = reduced.mapv(|(_, ok, _)| ok);
        let observations = reduced.mapv(|(_, _, n)| n);

        let empty = empty_sample_count(&observations, aoi);
        crate::types::log_pixel_faults(
            "composite",
            std::iter::repeat(PixelFault::EmptySample).take(empty),
        );
        Ok((Raster::with_validity(values, valid)?, observations))
    }
}

impl Default for TemporalCompositor {
    fn default() -> Self {
        Self {
            params: CompositeParams::default(),
        }
    }
}

/// Pixels inside the area of interest that saw no valid sample at all
fn empty_sample_count(observations: &Array2<u32>, aoi: Option<&AreaOfInterest>) -> usize {
    observations
        .indexed_iter()
        .filter(|&((row, col), &n)| n == 0 && aoi.map_or(true, |aoi| aoi.contains(row, col)))
        .count()
}

/// Median of a sample set; mean of the two middle values for an even count
fn median_of(samples: &mut [f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        Some((samples[mid - 1] + samples[mid]) / 2.0)
    } else {
        Some(samples[mid])
    }
}
