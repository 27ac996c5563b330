use crate::core::linalg::{self, SINGULAR_TOLERANCE};
use crate::types::{
    log_pixel_faults, BandName, FusionError, FusionResult, PixelFault, Raster, Scene,
    REFLECTANCE_SCALE,
};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Upper bound on endmembers; the constrained solver caches one Gram inverse
/// per endmember subset.
pub const MAX_ENDMEMBERS: usize = 8;

/// Relative tolerance used when dropping dependent endmember columns
const RANK_TOLERANCE: f64 = 1e-10;

/// Abundances at or below this are treated as zero
const ZERO_ABUNDANCE: f64 = 1e-14;

/// Relative threshold on the reduced gradient for an endmember to enter
const KKT_TOLERANCE: f64 = 1e-10;

/// Whether abundances are forced non-negative and summing to one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmixMode {
    /// Fully constrained: a_i >= 0 and sum(a) = 1
    Constrained,
    /// Ordinary least squares, no sign or sum restriction
    Unconstrained,
}

/// Units of the values stored in an unmixing result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FractionUnits {
    /// Abundance fractions as solved
    Fraction,
    /// Fractions x 100, floored at 0 and truncated to the byte range
    PercentByte,
}

/// A named reference spectrum in scaled reflectance units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endmember {
    pub name: String,
    pub spectrum: Vec<f64>,
}

impl Endmember {
    pub fn new(name: &str, spectrum: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            spectrum: spectrum.to_vec(),
        }
    }
}

/// Endmember spectra over an ordered band selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndmemberSet {
    pub bands: Vec<BandName>,
    pub endmembers: Vec<Endmember>,
}

impl EndmemberSet {
    pub fn new(bands: Vec<BandName>, endmembers: Vec<Endmember>) -> FusionResult<Self> {
        let set = Self { bands, endmembers };
        set.validate()?;
        Ok(set)
    }

    /// Souza Jr. et al. (2005) model behind NDFI
    pub fn ndfi() -> Self {
        Self {
            bands: BandName::REFLECTANCE.to_vec(),
            endmembers: vec![
                Endmember::new("GV", &[500.0, 900.0, 400.0, 6100.0, 3000.0, 1000.0]),
                Endmember::new("Shade", &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
                Endmember::new("NPV", &[1400.0, 1700.0, 2200.0, 3000.0, 5500.0, 3000.0]),
                Endmember::new("Soil", &[2000.0, 3000.0, 3400.0, 5800.0, 6000.0, 5800.0]),
                Endmember::new("Cloud", &[9000.0, 9600.0, 8000.0, 7800.0, 7200.0, 6500.0]),
            ],
        }
    }

    /// Three-endmember model behind the DETEX degradation index
    pub fn detex() -> Self {
        Self {
            bands: vec![BandName::Red, BandName::Nir, BandName::Swir1],
            endmembers: vec![
                Endmember::new("soil", &[1875.0, 2263.0, 2763.0]),
                Endmember::new("GV", &[221.0, 3480.5, 1559.5]),
                Endmember::new("shade", &[0.0, 0.0, 0.0]),
            ],
        }
    }

    pub fn validate(&self) -> FusionResult<()> {
        if self.bands.is_empty() {
            return Err(FusionError::EndmemberMismatch("no bands selected".to_string()));
        }
        if self.bands.contains(&BandName::QualityBits) {
            return Err(FusionError::EndmemberMismatch(
                "QualityBits cannot be unmixed".to_string(),
            ));
        }
        if self.endmembers.is_empty() || self.endmembers.len() > MAX_ENDMEMBERS {
            return Err(FusionError::EndmemberMismatch(format!(
                "{} endmembers given, expected 1..={}",
                self.endmembers.len(),
                MAX_ENDMEMBERS
            )));
        }
        for endmember in &self.endmembers {
            if endmember.spectrum.len() != self.bands.len() {
                return Err(FusionError::EndmemberMismatch(format!(
                    "endmember '{}' has {} values for {} bands",
                    endmember.name,
                    endmember.spectrum.len(),
                    self.bands.len()
                )));
            }
            if endmember.spectrum.iter().any(|v| !v.is_finite()) {
                return Err(FusionError::EndmemberMismatch(format!(
                    "endmember '{}' has non-finite values",
                    endmember.name
                )));
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.endmembers.iter().map(|e| e.name.clone()).collect()
    }

    /// Spectra as an (endmembers x bands) matrix in unit reflectance
    fn unit_matrix(&self) -> Array2<f64> {
        let scale = f64::from(REFLECTANCE_SCALE);
        Array2::from_shape_fn((self.endmembers.len(), self.bands.len()), |(i, j)| {
            self.endmembers[i].spectrum[j] / scale
        })
    }
}

/// Unmixing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmixParams {
    /// Weight of the appended sum-to-one row used by the rank-revealing
    /// fallback when a passive-set system is singular
    pub sum_to_one_weight: f64,
    /// Cap on active-set iterations per pixel
    pub max_iterations: usize,
}

impl Default for UnmixParams {
    fn default() -> Self {
        Self {
            sum_to_one_weight: 1e3,
            max_iterations: 64,
        }
    }
}

/// One raster per endmember
#[derive(Debug, Clone)]
pub struct UnmixingResult {
    pub mode: UnmixMode,
    pub units: FractionUnits,
    pub names: Vec<String>,
    pub fractions: Vec<Raster<f32>>,
    pub acquired: DateTime<Utc>,
}

impl UnmixingResult {
    pub fn fraction(&self, name: &str) -> Option<&Raster<f32>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.fractions[i])
    }

    pub fn dim(&self) -> (usize, usize) {
        self.fractions.first().map(|f| f.dim()).unwrap_or((0, 0))
    }

    /// Fractions scaled x 100, floored at 0 and cut to whole bytes
    pub fn percent_bytes(&self) -> FusionResult<UnmixingResult> {
        let fractions = self
            .fractions
            .iter()
            .map(|fraction| {
                // float-to-int `as` truncates and saturates at 255
                let bytes = fraction
                    .values()
                    .mapv(|v| f32::from((v * 100.0).max(0.0) as u8));
                fraction.with_values(bytes)
            })
            .collect::<FusionResult<Vec<_>>>()?;

        Ok(UnmixingResult {
            mode: self.mode,
            units: FractionUnits::PercentByte,
            names: self.names.clone(),
            fractions,
            acquired: self.acquired,
        })
    }
}

/// How one pixel's solve ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelOutcome {
    Solved,
    Recovered(PixelFault),
    NoData(PixelFault),
}

/// Precomputed per-mode solver state
#[derive(Debug, Clone)]
enum Solver {
    Unconstrained {
        /// Maps E*r onto abundances; dependent endmembers get zero
        projection: Array2<f64>,
    },
    Constrained {
        /// Spectral Gram matrix E*E^T
        gram: Array2<f64>,
        /// Inverse of the bordered system `[[G_P, 1], [1^T, 0]]` for every
        /// passive-set bitmask; `None` when singular
        subsets: Vec<Option<Array2<f64>>>,
        /// Rank-revealing inverse of the weighted augmented Gram matrix
        fallback: Array2<f64>,
        weight_sq: f64,
    },
}

/// Per-pixel linear spectral unmixing over a fixed endmember set
#[derive(Debug, Clone)]
pub struct SpectralUnmixer {
    endmembers: EndmemberSet,
    mode: UnmixMode,
    params: UnmixParams,
    spectra: Array2<f64>,
    solver: Solver,
}

impl SpectralUnmixer {
    pub fn new(endmembers: EndmemberSet, mode: UnmixMode) -> FusionResult<Self> {
        Self::with_params(endmembers, mode, UnmixParams::default())
    }

    pub fn with_params(
        endmembers: EndmemberSet,
        mode: UnmixMode,
        params: UnmixParams,
    ) -> FusionResult<Self> {
        endmembers.validate()?;
        if !(params.sum_to_one_weight > 0.0 && params.sum_to_one_weight.is_finite()) {
            return Err(FusionError::InvalidConfig(format!(
                "sum-to-one weight must be positive, got {}",
                params.sum_to_one_weight
            )));
        }

        let spectra = endmembers.unit_matrix();
        let spectral_gram = spectra.dot(&spectra.t());
        let e = spectra.nrows();

        let solver = match mode {
            UnmixMode::Unconstrained => {
                let columns = linalg::independent_columns(spectral_gram.view(), RANK_TOLERANCE);
                if columns.len() < e {
                    log::debug!(
                        "Unconstrained unmixing: {} of {} endmembers are linearly dependent and will be zero",
                        e - columns.len(),
                        e
                    );
                }
                let projection = linalg::restricted_inverse(spectral_gram.view(), &columns, SINGULAR_TOLERANCE)
                    .unwrap_or_else(|| Array2::zeros((e, e)));
                Solver::Unconstrained { projection }
            }
            UnmixMode::Constrained => {
                let subsets = (0..(1usize << e))
                    .map(|mask| bordered_inverse(&spectral_gram, &subset_columns(mask, e)))
                    .collect::<Vec<_>>();

                let singular = subsets.iter().skip(1).filter(|s| s.is_none()).count();
                if singular > 0 {
                    log::debug!(
                        "Constrained unmixing: {} of {} endmember subsets are singular",
                        singular,
                        subsets.len() - 1
                    );
                }

                let weight_sq = params.sum_to_one_weight * params.sum_to_one_weight;
                let augmented = spectral_gram.mapv(|g| g + weight_sq);
                let columns = linalg::independent_columns(augmented.view(), RANK_TOLERANCE);
                let fallback = linalg::restricted_inverse(augmented.view(), &columns, SINGULAR_TOLERANCE)
                    .unwrap_or_else(|| Array2::zeros((e, e)));

                Solver::Constrained {
                    gram: spectral_gram,
                    subsets,
                    fallback,
                    weight_sq,
                }
            }
        };

        Ok(Self {
            endmembers,
            mode,
            params,
            spectra,
            solver,
        })
    }

    pub fn mode(&self) -> UnmixMode {
        self.mode
    }

    pub fn endmembers(&self) -> &EndmemberSet {
        &self.endmembers
    }

    /// Unmix every pixel of a scene.
    ///
    /// Pixels with any no-data input band, or whose system cannot be solved,
    /// are no-data in every fraction.
    pub fn unmix(&self, scene: &Scene) -> FusionResult<UnmixingResult> {
        let (rows, cols) = scene.dim();
        let n = rows * cols;
        let b = self.endmembers.bands.len();
        let e = self.endmembers.endmembers.len();

        log::info!(
            "Unmixing scene {} ({:?}, {} endmembers over {} bands, {}x{})",
            scene.metadata().id,
            self.mode,
            e,
            b,
            rows,
            cols
        );

        // Pixel matrix (pixels x bands) in unit reflectance
        let scale = f64::from(REFLECTANCE_SCALE);
        let mut reflectance = Array2::<f64>::zeros((n, b));
        let mut valid = Array1::from_elem(n, true);
        for (j, band_name) in self.endmembers.bands.iter().enumerate() {
            let band = scene.require_band(*band_name, "unmix")?;
            // Logical row-major order matches the reshape below
            for (i, (&v, &ok)) in band.values().iter().zip(band.validity().iter()).enumerate() {
                reflectance[[i, j]] = f64::from(v) / scale;
                valid[i] = valid[i] && ok;
            }
        }

        let (abundances, outcomes) = self.solve_all(&reflectance, &valid);

        let recovered = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, PixelOutcome::Recovered(_)))
            .count();
        if recovered > 0 {
            log::debug!(
                "unmix: {} pixel(s) solved by the rank-revealing fallback",
                recovered
            );
        }
        log_pixel_faults(
            "unmix",
            outcomes.iter().filter_map(|outcome| match outcome {
                PixelOutcome::NoData(fault) => Some(*fault),
                _ => None,
            }),
        );

        let pixel_ok = outcomes.mapv(|outcome| !matches!(outcome, PixelOutcome::NoData(_)));
        let validity = pixel_ok
            .into_shape((rows, cols))
            .map_err(|err| FusionError::InvalidFormat(format!("validity reshape: {}", err)))?;

        let mut fractions = Vec::with_capacity(e);
        for k in 0..e {
            let values = Array2::from_shape_vec(
                (rows, cols),
                abundances.column(k).iter().map(|&v| v as f32).collect(),
            )
            .map_err(|err| FusionError::InvalidFormat(format!("fraction reshape: {}", err)))?;
            fractions.push(Raster::with_validity(values, validity.clone())?);
        }

        Ok(UnmixingResult {
            mode: self.mode,
            units: FractionUnits::Fraction,
            names: self.endmembers.names(),
            fractions,
            acquired: scene.acquired(),
        })
    }

    /// Unmix a single spectrum given in scaled reflectance over the set's bands.
    ///
    /// `Ok(None)` means the pixel would be no-data.
    pub fn unmix_spectrum(&self, spectrum: &[f64]) -> FusionResult<Option<Vec<f64>>> {
        let b = self.endmembers.bands.len();
        if spectrum.len() != b {
            return Err(FusionError::EndmemberMismatch(format!(
                "spectrum has {} values for {} bands",
                spectrum.len(),
                b
            )));
        }
        let scale = f64::from(REFLECTANCE_SCALE);
        let reflectance = Array2::from_shape_fn((1, b), |(_, j)| spectrum[j] / scale);
        let (abundances, outcomes) = self.solve_all(&reflectance, &Array1::from_elem(1, true));

        Ok(match outcomes[0] {
            PixelOutcome::NoData(_) => None,
            _ => Some(abundances.row(0).to_vec()),
        })
    }

    /// Solve every row of the pixel matrix
    fn solve_all(
        &self,
        reflectance: &Array2<f64>,
        valid: &Array1<bool>,
    ) -> (Array2<f64>, Array1<PixelOutcome>) {
        let n = reflectance.nrows();
        let e = self.spectra.nrows();

        // E * r for every pixel at once
        let correlation = reflectance.dot(&self.spectra.t());
        let mut outcomes = Array1::from_elem(n, PixelOutcome::Solved);

        let abundances = match &self.solver {
            Solver::Unconstrained { projection } => {
                let abundances = correlation.dot(&projection.t());
                Zip::from(&mut outcomes).and(valid).for_each(|outcome, &ok| {
                    if !ok {
                        *outcome = PixelOutcome::NoData(PixelFault::MaskedInput);
                    }
                });
                abundances
            }
            Solver::Constrained { .. } => {
                let mut abundances = Array2::<f64>::zeros((n, e));

                #[cfg(feature = "parallel")]
                Zip::from(abundances.rows_mut())
                    .and(correlation.rows())
                    .and(valid)
                    .and(&mut outcomes)
                    .par_for_each(|out, pixel, &ok, outcome| {
                        *outcome = self.solve_row(out, pixel, ok);
                    });
                #[cfg(not(feature = "parallel"))]
                Zip::from(abundances.rows_mut())
                    .and(correlation.rows())
                    .and(valid)
                    .and(&mut outcomes)
                    .for_each(|out, pixel, &ok, outcome| {
                        *outcome = self.solve_row(out, pixel, ok);
                    });

                abundances
            }
        };

        // No-data pixels carry zeros, never stale solver output
        let mut abundances = abundances;
        for (mut row, outcome) in abundances.axis_iter_mut(Axis(0)).zip(outcomes.iter()) {
            if matches!(outcome, PixelOutcome::NoData(_)) {
                row.fill(0.0);
            }
        }

        (abundances, outcomes)
    }

    fn solve_row(&self, out: ArrayViewMut1<'_, f64>, correlation: ArrayView1<'_, f64>, valid: bool) -> PixelOutcome {
        if valid {
            self.solve_constrained_pixel(correlation, out)
        } else {
            PixelOutcome::NoData(PixelFault::MaskedInput)
        }
    }

    /// Fully constrained solve of one pixel from its correlation `E*r`
    fn solve_constrained_pixel(
        &self,
        correlation: ArrayView1<'_, f64>,
        mut out: ArrayViewMut1<'_, f64>,
    ) -> PixelOutcome {
        let (gram, subsets, fallback, weight_sq) = match &self.solver {
            Solver::Constrained {
                gram,
                subsets,
                fallback,
                weight_sq,
            } => (gram, subsets, fallback, *weight_sq),
            Solver::Unconstrained { .. } => return PixelOutcome::NoData(PixelFault::SingularSystem),
        };

        let (abundances, outcome) =
            match active_set_fcls(gram, subsets, correlation, self.params.max_iterations) {
                Some(x) => (x, PixelOutcome::Solved),
                None => {
                    let rhs = correlation.mapv(|c| c + weight_sq);
                    (fallback.dot(&rhs), PixelOutcome::Recovered(PixelFault::SingularSystem))
                }
            };

        match clamp_and_renormalize(abundances) {
            Some(x) => {
                out.assign(&x);
                outcome
            }
            None => PixelOutcome::NoData(PixelFault::NonPositiveAbundances),
        }
    }
}

/// Endmember indices set in a passive-set bitmask
fn subset_columns(mask: usize, e: usize) -> Vec<usize> {
    (0..e).filter(|i| mask & (1 << i) != 0).collect()
}

/// Inverse of the Gram sub-matrix bordered by the sum-to-one row and column
fn bordered_inverse(gram: &Array2<f64>, columns: &[usize]) -> Option<Array2<f64>> {
    if columns.is_empty() {
        return None;
    }
    let k = columns.len();
    let bordered = Array2::from_shape_fn((k + 1, k + 1), |(i, j)| match (i < k, j < k) {
        (true, true) => gram[[columns[i], columns[j]]],
        (false, false) => 0.0,
        _ => 1.0,
    });
    linalg::invert(bordered.view(), SINGULAR_TOLERANCE)
}

/// Lawson-Hanson active set for `min |E^T a - r|^2` with `a >= 0` and
/// `sum(a) = 1`.
///
/// The sum constraint is held exactly through a Lagrange multiplier in every
/// passive-set solve, and endmembers enter on their reduced gradient
/// `c_j - (G x)_j - lambda`. Starts from the vertex nearest the pixel, which
/// is feasible. `None` when a passive-set system is singular.
fn active_set_fcls(
    gram: &Array2<f64>,
    subsets: &[Option<Array2<f64>>],
    correlation: ArrayView1<'_, f64>,
    max_iterations: usize,
) -> Option<Array1<f64>> {
    let e = correlation.len();
    let tolerance = KKT_TOLERANCE * correlation.iter().fold(1.0f64, |m, v| m.max(v.abs()));

    // |e_j - r|^2 differs from G_jj - 2 c_j by a constant
    let vertex_distance = |j: usize| gram[[j, j]] - 2.0 * correlation[j];
    let start = (0..e).min_by(|&i, &j| vertex_distance(i).total_cmp(&vertex_distance(j)))?;

    let mut x = Array1::<f64>::zeros(e);
    x[start] = 1.0;
    let mut passive = 1usize << start;
    let mut multiplier = correlation[start] - gram[[start, start]];

    for _ in 0..max_iterations {
        let gradient = &correlation - &gram.dot(&x);
        let entering = (0..e)
            .filter(|&j| passive & (1 << j) == 0 && gradient[j] - multiplier > tolerance)
            .max_by(|&i, &j| gradient[i].total_cmp(&gradient[j]));
        let entering = match entering {
            Some(j) => j,
            None => break,
        };
        passive |= 1 << entering;

        // Each pass either accepts the solution or drops at least one index
        for pass in 0..=e {
            let (z, lambda) = solve_subset(subsets, passive, correlation)?;
            if pass == 0 && z[entering] <= ZERO_ABUNDANCE {
                // No descent along the entering endmember beyond rounding
                return Some(x);
            }

            let columns = subset_columns(passive, e);
            if columns.iter().all(|&j| z[j] > ZERO_ABUNDANCE) {
                x = z;
                multiplier = lambda;
                break;
            }

            let alpha = columns
                .iter()
                .filter(|&&j| z[j] <= ZERO_ABUNDANCE && x[j] - z[j] > 0.0)
                .map(|&j| x[j] / (x[j] - z[j]))
                .fold(f64::INFINITY, f64::min);
            let alpha = if alpha.is_finite() { alpha } else { 0.0 };

            x = &x + &((&z - &x) * alpha);
            for &j in &columns {
                if x[j] <= ZERO_ABUNDANCE {
                    x[j] = 0.0;
                    passive &= !(1 << j);
                }
            }
            if passive == 0 {
                return None;
            }
        }
    }

    Some(x)
}

/// Equality-constrained least squares on the passive set: abundances (zero
/// elsewhere) and the sum-to-one multiplier
fn solve_subset(
    subsets: &[Option<Array2<f64>>],
    passive: usize,
    correlation: ArrayView1<'_, f64>,
) -> Option<(Array1<f64>, f64)> {
    let inverse = subsets.get(passive)?.as_ref()?;
    let columns = subset_columns(passive, correlation.len());
    let rhs = Array1::from_iter(
        columns
            .iter()
            .map(|&j| correlation[j])
            .chain(std::iter::once(1.0)),
    );
    let solution = inverse.dot(&rhs);

    let mut z = Array1::zeros(correlation.len());
    for (i, &j) in columns.iter().enumerate() {
        z[j] = solution[i];
    }
    Some((z, solution[columns.len()]))
}

/// Clamp negatives to zero and rescale to unit sum; `None` if nothing is left
fn clamp_and_renormalize(mut abundances: Array1<f64>) -> Option<Array1<f64>> {
    abundances.mapv_inplace(|a| if a.is_finite() && a > 0.0 { a } else { 0.0 });
    let sum = abundances.sum();
    if sum <= ZERO_ABUNDANCE {
        return None;
    }
    abundances.mapv_inplace(|a| a / sum);
    Some(abundances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionVersion, Platform, SceneMetadata, SensorId};
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn scene_from_pixels(bands: &[BandName], pixels: &[Vec<i16>]) -> Scene {
        let mut map = BTreeMap::new();
        for (j, band) in bands.iter().enumerate() {
            let values = Array2::from_shape_vec(
                (1, pixels.len()),
                pixels.iter().map(|p| p[j]).collect(),
            )
            .unwrap();
            map.insert(*band, Raster::new(values));
        }
        Scene::new(
            SensorId::new(Platform::Landsat8, CollectionVersion::Collection1),
            SceneMetadata {
                id: "unmix-test".to_string(),
                acquired: chrono::Utc.with_ymd_and_hms(2019, 9, 3, 13, 30, 0).unwrap(),
                cloud_cover: 2.0,
                geometric_rmse: 4.0,
                image_quality: 9,
                footprint: None,
            },
            map,
            Array2::zeros((1, pixels.len())),
        )
        .unwrap()
    }

    #[test]
    fn test_builtin_sets_are_valid() {
        assert!(EndmemberSet::ndfi().validate().is_ok());
        assert!(EndmemberSet::detex().validate().is_ok());
        assert_eq!(EndmemberSet::detex().names(), vec!["soil", "GV", "shade"]);
    }

    #[test]
    fn test_endmember_length_mismatch() {
        let result = EndmemberSet::new(
            vec![BandName::Red, BandName::Nir],
            vec![Endmember::new("soil", &[1.0, 2.0, 3.0])],
        );
        assert!(matches!(result, Err(FusionError::EndmemberMismatch(_))));
    }

    #[test]
    fn test_pure_endmember_recovers_itself() {
        let unmixer = SpectralUnmixer::new(EndmemberSet::ndfi(), UnmixMode::Constrained).unwrap();
        let soil = unmixer
            .unmix_spectrum(&[2000.0, 3000.0, 3400.0, 5800.0, 6000.0, 5800.0])
            .unwrap()
            .unwrap();
        assert_abs_diff_eq!(soil[3], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(soil.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_constrained_fractions_sum_to_one() {
        let unmixer = SpectralUnmixer::new(EndmemberSet::ndfi(), UnmixMode::Constrained).unwrap();
        let scene = scene_from_pixels(
            &BandName::REFLECTANCE,
            &[
                vec![300, 600, 350, 3500, 1800, 700],
                vec![1200, 1500, 1800, 2800, 4200, 2600],
                vec![8000, 8500, 7200, 7000, 6500, 6000],
                vec![0, 0, 0, 0, 0, 0],
            ],
        );
        let result = unmixer.unmix(&scene).unwrap();
        assert_eq!(result.names.len(), 5);
        for col in 0..4 {
            let sum: f32 = result.fractions.iter().map(|f| f.get(0, col).unwrap()).sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
            for fraction in &result.fractions {
                assert!(fraction.get(0, col).unwrap() >= 0.0);
            }
        }
        // A black pixel is pure shade
        assert_abs_diff_eq!(result.fraction("Shade").unwrap().get(0, 3).unwrap(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_modes_differ_on_out_of_simplex_pixel() {
        let doubled_soil = [3750.0, 4526.0, 5526.0];
        let unconstrained =
            SpectralUnmixer::new(EndmemberSet::detex(), UnmixMode::Unconstrained).unwrap();
        let constrained = SpectralUnmixer::new(EndmemberSet::detex(), UnmixMode::Constrained).unwrap();

        let free = unconstrained.unmix_spectrum(&doubled_soil).unwrap().unwrap();
        assert_abs_diff_eq!(free[0], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(free[1], 0.0, epsilon = 1e-9);
        // Zero shade spectrum is linearly dependent and gets no weight
        assert_eq!(free[2], 0.0);

        let bounded = constrained.unmix_spectrum(&doubled_soil).unwrap().unwrap();
        assert!(bounded[0] <= 1.0 + 1e-9);
        assert_abs_diff_eq!(bounded.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_masked_pixel_is_no_data_everywhere() {
        let unmixer = SpectralUnmixer::new(EndmemberSet::detex(), UnmixMode::Constrained).unwrap();
        let scene = scene_from_pixels(
            &[BandName::Red, BandName::Nir, BandName::Swir1],
            &[vec![1875, 2263, 2763], vec![221, 3480, 1559]],
        )
        .with_pending_mask(ndarray::array![[true, false]])
        .unwrap()
        .apply_quality_mask()
        .unwrap();

        let result = unmixer.unmix(&scene).unwrap();
        for fraction in &result.fractions {
            assert!(fraction.get(0, 0).is_some());
            assert_eq!(fraction.get(0, 1), None);
        }
        assert_abs_diff_eq!(result.fraction("soil").unwrap().get(0, 0).unwrap(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_missing_band_is_reported() {
        let unmixer = SpectralUnmixer::new(EndmemberSet::detex(), UnmixMode::Constrained).unwrap();
        let scene = scene_from_pixels(&[BandName::Red, BandName::Nir], &[vec![100, 200]]);
        match unmixer.unmix(&scene) {
            Err(FusionError::MissingBand { band, operation, .. }) => {
                assert_eq!(band, "SWIR1");
                assert_eq!(operation, "unmix");
            }
            other => panic!("expected MissingBand, got {:?}", other),
        }
    }

    #[test]
    fn test_percent_bytes_truncate() {
        let fractions = vec![Raster::new(ndarray::array![[0.257f32, -0.1, 3.0]])];
        let result = UnmixingResult {
            mode: UnmixMode::Unconstrained,
            units: FractionUnits::Fraction,
            names: vec!["soil".to_string()],
            fractions,
            acquired: chrono::Utc.with_ymd_and_hms(2019, 9, 3, 0, 0, 0).unwrap(),
        };
        let bytes = result.percent_bytes().unwrap();
        assert_eq!(bytes.units, FractionUnits::PercentByte);
        let soil = bytes.fraction("soil").unwrap();
        assert_eq!(soil.get(0, 0), Some(25.0));
        assert_eq!(soil.get(0, 1), Some(0.0));
        assert_eq!(soil.get(0, 2), Some(255.0));
    }

    /// a, b = 2a and c = a over Red, NIR, SWIR1
    fn collinear_set() -> EndmemberSet {
        EndmemberSet::new(
            vec![BandName::Red, BandName::Nir, BandName::Swir1],
            vec![
                Endmember::new("a", &[1000.0, 2000.0, 3000.0]),
                Endmember::new("b", &[2000.0, 4000.0, 6000.0]),
                Endmember::new("c", &[1000.0, 2000.0, 3000.0]),
            ],
        )
        .unwrap()
    }

    fn solve_one(unmixer: &SpectralUnmixer, spectrum: &[f64]) -> (Vec<f64>, PixelOutcome) {
        let scale = f64::from(REFLECTANCE_SCALE);
        let reflectance = Array2::from_shape_fn((1, spectrum.len()), |(_, j)| spectrum[j] / scale);
        let (abundances, outcomes) = unmixer.solve_all(&reflectance, &Array1::from_elem(1, true));
        (abundances.row(0).to_vec(), outcomes[0])
    }

    #[test]
    fn test_collinear_endmembers_constrained() {
        let unmixer = SpectralUnmixer::new(collinear_set(), UnmixMode::Constrained).unwrap();
        match &unmixer.solver {
            Solver::Constrained { subsets, .. } => {
                // {a, c} and {a, b, c} cannot be solved
                assert!(subsets[0b101].is_none());
                assert!(subsets[0b111].is_none());
                assert!(subsets[0b011].is_some());
            }
            Solver::Unconstrained { .. } => panic!("expected a constrained solver"),
        }

        // 1.5 a lies halfway between a (or c) and b
        let (x, outcome) = solve_one(&unmixer, &[1500.0, 3000.0, 4500.0]);
        assert_eq!(outcome, PixelOutcome::Solved);
        assert!(x.iter().all(|&v| v >= 0.0));
        assert_abs_diff_eq!(x.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(x[0] + x[2], 0.5, epsilon = 1e-9);

        // Outside the segment the nearer vertex wins
        let (x, _) = solve_one(&unmixer, &[3000.0, 6000.0, 9000.0]);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_singular_passive_set_uses_fallback() {
        let mut unmixer = SpectralUnmixer::new(collinear_set(), UnmixMode::Constrained).unwrap();
        if let Solver::Constrained { subsets, .. } = &mut unmixer.solver {
            for (mask, subset) in subsets.iter_mut().enumerate() {
                if mask.count_ones() > 1 {
                    *subset = None;
                }
            }
        }

        let (x, outcome) = solve_one(&unmixer, &[1500.0, 3000.0, 4500.0]);
        assert_eq!(outcome, PixelOutcome::Recovered(PixelFault::SingularSystem));
        assert!(x.iter().all(|&v| v >= 0.0));
        assert_abs_diff_eq!(x.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-6);

        // A pure vertex never needs a second endmember
        let (_, outcome) = solve_one(&unmixer, &[2000.0, 4000.0, 6000.0]);
        assert_eq!(outcome, PixelOutcome::Solved);
    }

    #[test]
    fn test_non_positive_fallback_is_no_data() {
        let mut unmixer = SpectralUnmixer::new(collinear_set(), UnmixMode::Constrained).unwrap();
        if let Solver::Constrained {
            subsets, fallback, ..
        } = &mut unmixer.solver
        {
            for (mask, subset) in subsets.iter_mut().enumerate() {
                if mask.count_ones() > 1 {
                    *subset = None;
                }
            }
            fallback.fill(0.0);
        }

        let (x, outcome) = solve_one(&unmixer, &[1500.0, 3000.0, 4500.0]);
        assert_eq!(outcome, PixelOutcome::NoData(PixelFault::NonPositiveAbundances));
        assert_eq!(x, vec![0.0, 0.0, 0.0]);
        assert_eq!(unmixer.unmix_spectrum(&[1500.0, 3000.0, 4500.0]).unwrap(), None);

        assert_eq!(clamp_and_renormalize(Array1::from(vec![-0.2, 0.0, f64::NAN])), None);
    }
}
