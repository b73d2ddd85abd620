//! Core photon classification library: windowed features, reference-surface
//! estimation, and physics-based reclassification for spaceborne
//! photon-counting altimeter returns.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub mod blunder;
pub mod booster;
pub mod dataframe;

pub use blunder::blunder_detection;
pub use booster::{Booster, TrainParams};
pub use dataframe::{convert_dataframe, write_samples, Dataframe};

/// ASPRS class code for unclassified / noise returns.
pub const NOISE_CLASS: u32 = 0;
/// ASPRS class code for bathymetry (submerged bottom) returns.
pub const BATHY_CLASS: u32 = 40;
/// ASPRS class code for sea surface returns.
pub const SEA_SURFACE_CLASS: u32 = 41;

pub const MAX_PHOTON_ELEVATION: f64 = 20.0; // meters
pub const MIN_PHOTON_ELEVATION: f64 = -80.0; // meters
pub const MAX_SURFACE_ELEVATION: f64 = 20.0; // meters
pub const MIN_SURFACE_ELEVATION: f64 = -20.0; // meters
pub const SURFACE_SIGMA: f64 = 100.0; // meters
pub const BATHY_SIGMA: f64 = 60.0; // meters
pub const MIN_BATHY_DEPTH: f64 = 1.5; // meters
pub const MAX_SURFACE_ESTIMATE_DELTA: f64 = 10.0; // meters
pub const MAX_BATHY_ESTIMATE_DELTA: f64 = 10.0; // meters

/// Sentinel fed to the classifier for feature slots with no data.
pub const MISSING_DATA: f32 = f32::MAX;

/// Sentinel carried by elevation estimates when a class has no photons.
pub const ELEVATION_SENTINEL: f64 = f64::MAX;

#[derive(Error, Debug)]
pub enum Error {
    #[error("input format error: {0}")]
    InputFormat(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("classifier error: {0}")]
    Classifier(String),
    #[error("verification failed in {file}, line {line}: {what}")]
    Internal {
        file: &'static str,
        line: u32,
        what: String,
    },
}

/// Check an invariant that only a logic error can break. Stays active in
/// release builds and produces [`Error::Internal`] with file/line context.
#[macro_export]
macro_rules! verify {
    ($cond:expr) => {
        if !($cond) {
            return Err($crate::Error::Internal {
                file: file!(),
                line: line!(),
                what: stringify!($cond).to_string(),
            });
        }
    };
}

/// One photon return, read from a tabular record and carried through the
/// whole pipeline in input order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub dataset_id: usize,
    pub h5_index: u64,
    /// Along-track distance in meters.
    pub x: f64,
    /// Geoid-corrected elevation in meters.
    pub z: f64,
    /// Known (training) class.
    pub cls: u32,
    /// Predicted class.
    pub prediction: u32,
    pub surface_elevation: f64,
    pub bathy_elevation: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FeatureParams {
    /// Along-track bin width in meters.
    pub window_size: f64,
    /// Quantile means per window.
    pub total_quantiles: usize,
    /// Neighbor windows consulted on each side.
    pub adjacent_windows: usize,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            window_size: 40.0,
            total_quantiles: 32,
            adjacent_windows: 2,
        }
    }
}

impl FeatureParams {
    pub fn features_per_sample(&self) -> usize {
        // elevation + own-window quantiles + quantiles of adjacent windows
        1 + self.total_quantiles + 2 * self.adjacent_windows * self.total_quantiles
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PostprocessParams {
    pub surface_min_elevation: f64,
    pub surface_max_elevation: f64,
    pub bathy_min_elevation: f64,
    pub water_column_width: f64,
    pub surface_range: f64,
    pub bathy_range: f64,
}

impl Default for PostprocessParams {
    fn default() -> Self {
        Self {
            surface_min_elevation: -20.0,
            surface_max_elevation: 20.0,
            bathy_min_elevation: -100.0,
            water_column_width: 100.0,
            surface_range: 3.0,
            bathy_range: 3.0,
        }
    }
}

/// Map a sparse domain class code to the dense index used by the classifier.
pub fn remap_label(label: u32) -> u32 {
    match label {
        40 => 1,
        41 => 2,
        _ => 0,
    }
}

/// Map a dense classifier index back to the domain class code.
pub fn unremap_label(label: u32) -> u32 {
    match label {
        1 => 40,
        2 => 41,
        _ => 0,
    }
}

/// Quantile means of one along-track window.
#[derive(Clone, Debug, Default)]
pub struct Window {
    pub quantiles: Vec<f64>,
}

/// Half-open bin index along x for each photon, starting at 0 from the
/// minimum x in the stream.
pub fn window_indexes(samples: &[Sample], window_size: f64) -> Vec<usize> {
    let min_x = samples.iter().map(|s| s.x).fold(f64::INFINITY, f64::min);

    samples
        .par_iter()
        .map(|s| ((s.x - min_x) / window_size) as usize)
        .collect()
}

/// Quantile means of a set of elevations. Sort, assign sorted position `i`
/// to bucket `floor(i / (n / Q))`, and average each bucket. Fewer than `Q`
/// elevations yield the all-zero "no signal" vector. The bucketing order is
/// load-bearing: a trained model expects exactly this construction.
fn quantile_means(mut elevations: Vec<f64>, total_quantiles: usize) -> Vec<f64> {
    let mut q = vec![0.0; total_quantiles];
    if elevations.len() < total_quantiles {
        return q;
    }

    elevations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let mut totals = vec![0usize; total_quantiles];
    let per_quantile = elevations.len() as f64 / total_quantiles as f64;

    for (i, z) in elevations.iter().enumerate() {
        let index = (i as f64 / per_quantile) as usize;
        q[index] += z;
        totals[index] += 1;
    }

    for (sum, total) in q.iter_mut().zip(&totals) {
        *sum /= *total as f64;
    }

    q
}

fn create_window(elevations: &[f64], fp: &FeatureParams) -> Window {
    // Throw out elevations that are out of range
    let retained: Vec<f64> = elevations
        .iter()
        .copied()
        .filter(|z| *z > MIN_PHOTON_ELEVATION && *z < MAX_PHOTON_ELEVATION)
        .collect();

    Window {
        quantiles: quantile_means(retained, fp.total_quantiles),
    }
}

/// Build the ordered vector of windows covering all photons.
pub fn get_windows(
    samples: &[Sample],
    fp: &FeatureParams,
    indexes: &[usize],
) -> Result<Vec<Window>, Error> {
    verify!(samples.len() == indexes.len());

    let total = indexes.iter().copied().max().map_or(0, |m| m + 1);

    let mut elevations = vec![Vec::new(); total];
    for (s, &w) in samples.iter().zip(indexes) {
        elevations[w].push(s.z);
    }

    Ok(elevations
        .par_iter()
        .map(|e| create_window(e, fp))
        .collect())
}

/// Per-photon feature rows assembled from the photon's elevation, its own
/// window's quantiles, and the quantiles of a symmetric band of neighbors.
pub struct Features<'a> {
    samples: &'a [Sample],
    fp: FeatureParams,
    window_indexes: Vec<usize>,
    windows: Vec<Window>,
}

impl<'a> Features<'a> {
    pub fn new(samples: &'a [Sample], fp: FeatureParams) -> Result<Self, Error> {
        let window_indexes = window_indexes(samples, fp.window_size);
        let windows = get_windows(samples, &fp, &window_indexes)?;
        Ok(Self {
            samples,
            fp,
            window_indexes,
            windows,
        })
    }

    pub fn features_per_sample(&self) -> usize {
        self.fp.features_per_sample()
    }

    /// Feature row for photon `n`. Missing neighbor windows are filled with
    /// [`MISSING_DATA`]; the left neighbor index is compared signed so that
    /// underflow cannot alias a valid window.
    pub fn row(&self, n: usize) -> Result<Vec<f32>, Error> {
        let q = self.fp.total_quantiles;
        let mut f = Vec::with_capacity(self.features_per_sample());

        f.push(self.samples[n].z as f32);

        let i = self.window_indexes[n];
        f.extend(self.windows[i].quantiles.iter().map(|v| *v as f32));

        for j in 0..self.fp.adjacent_windows {
            let right = i + (j + 1);
            if right < self.windows.len() {
                f.extend(self.windows[right].quantiles.iter().map(|v| *v as f32));
            } else {
                f.extend(std::iter::repeat(MISSING_DATA).take(q));
            }

            let left = i as isize - (j as isize + 1);
            if left >= 0 {
                f.extend(self.windows[left as usize].quantiles.iter().map(|v| *v as f32));
            } else {
                f.extend(std::iter::repeat(MISSING_DATA).take(q));
            }
        }

        verify!(f.len() == self.features_per_sample());
        Ok(f)
    }

    /// Dense row-major feature matrix for all photons.
    pub fn matrix(&self) -> Result<Vec<f32>, Error> {
        let rows: Vec<Vec<f32>> = (0..self.samples.len())
            .into_par_iter()
            .map(|i| self.row(i))
            .collect::<Result<_, _>>()?;

        let mut out = Vec::with_capacity(self.samples.len() * self.features_per_sample());
        for row in rows {
            out.extend(row);
        }
        Ok(out)
    }
}

fn count_predictions(samples: &[Sample], cls: u32) -> usize {
    samples.iter().filter(|s| s.prediction == cls).count()
}

/// Average elevation of `cls`-predicted photons in 1 m cells along x.
/// Cells with no such photon hold NaN. Returns the cell vector and the
/// integer-floored minimum x used as its origin.
fn quantized_average(samples: &[Sample], cls: u32) -> (Vec<f64>, f64) {
    let min_x = samples
        .iter()
        .map(|s| s.x)
        .fold(f64::INFINITY, f64::min)
        .floor();
    let max_x = samples
        .iter()
        .map(|s| s.x)
        .fold(f64::NEG_INFINITY, f64::max)
        .ceil();
    let total = (max_x as i64 - min_x as i64 + 1) as usize;

    let mut sums = vec![0.0; total];
    let mut totals = vec![0usize; total];
    for s in samples {
        if s.prediction != cls {
            continue;
        }
        let j = (s.x - min_x).floor() as usize;
        sums[j] += s.z;
        totals[j] += 1;
    }

    let avg = sums
        .iter()
        .zip(&totals)
        .map(|(sum, total)| if *total != 0 { sum / *total as f64 } else { f64::NAN })
        .collect();

    (avg, min_x)
}

/// Fill every maximal NaN run: interior runs are linearly interpolated
/// between the neighboring cells, leading/trailing runs are extended flat.
fn interpolate_gaps(v: &mut [f64]) {
    let n = v.len();
    let mut i = 0;
    while i < n {
        if !v[i].is_nan() {
            i += 1;
            continue;
        }

        let mut j = i;
        while j < n && v[j].is_nan() {
            j += 1;
        }

        let left = if i > 0 { Some(v[i - 1]) } else { None };
        let right = if j < n { Some(v[j]) } else { None };

        match (left, right) {
            (Some(l), Some(r)) => {
                let a = i as f64 - 1.0;
                let len = j as f64 - a;
                for k in i..j {
                    let w = (k as f64 - a) / len;
                    v[k] = (1.0 - w) * l + w * r;
                }
            }
            (None, Some(r)) => v[..j].fill(r),
            (Some(l), None) => v[i..].fill(l),
            // All-NaN input is handled by the caller's degenerate-class check
            (None, None) => {}
        }

        i = j;
    }
}

/// Centered moving average of odd width `filter_width`, computed from one
/// prefix-sum sweep. Boundaries divide by the number of cells actually in
/// range rather than shrinking toward zero.
fn box_filter(p: &[f64], filter_width: usize) -> Result<Vec<f64>, Error> {
    // Odd kernels only; a width of 1 does not make sense
    verify!(filter_width & 1 == 1);
    verify!(filter_width >= 3);

    let n = p.len();
    let mut sums = vec![0.0; n];
    let mut totals = vec![0usize; n];
    let mut cumulative_sum = 0.0;
    let mut cumulative_total = 0usize;

    for i in 0..n {
        cumulative_sum += p[i];
        cumulative_total += 1;
        sums[i] = cumulative_sum;
        totals[i] = cumulative_total;
    }

    let half = (filter_width / 2) as isize;
    let q = (0..n as isize)
        .map(|i| {
            let i1 = i - half - 1;
            let i2 = i + half;

            let (sum1, total1) = if i1 < 0 {
                (0.0, 0)
            } else {
                (sums[i1 as usize], totals[i1 as usize])
            };
            let (sum2, total2) = if i2 >= n as isize {
                (sums[n - 1], totals[n - 1])
            } else {
                (sums[i2 as usize], totals[i2 as usize])
            };

            (sum2 - sum1) / (total2 - total1) as f64
        })
        .collect();

    Ok(q)
}

/// Per-photon elevation estimates for class `cls`: 1 m quantized averages,
/// gap interpolation, then four box-filter passes approximating a Gaussian
/// of width `sigma` (Kovesi's fast Gaussian smoothing construction).
///
/// A class with no predicted photons yields [`ELEVATION_SENTINEL`] for
/// every photon; callers must not consume those values.
pub fn elevation_estimates(samples: &[Sample], sigma: f64, cls: u32) -> Result<Vec<f64>, Error> {
    let mut z = vec![ELEVATION_SENTINEL; samples.len()];

    if count_predictions(samples, cls) == 0 {
        return Ok(z);
    }

    let (mut avg, min_x) = quantized_average(samples, cls);
    interpolate_gaps(&mut avg);

    const ITERATIONS: usize = 4;
    let ideal_filter_width = ((12.0 * sigma * sigma) / ITERATIONS as f64 + 1.0).sqrt();
    let filter_width = 2 * ((ideal_filter_width / 2.0).round() as usize).max(1) + 1;

    for _ in 0..ITERATIONS {
        avg = box_filter(&avg, filter_width)?;
    }

    for (zi, s) in z.iter_mut().zip(samples) {
        let j = (s.x - min_x).floor() as usize;
        *zi = avg[j];
    }

    Ok(z)
}

pub fn assign_surface_estimates(samples: &mut [Sample], sigma: f64) -> Result<(), Error> {
    let e = elevation_estimates(samples, sigma, SEA_SURFACE_CLASS)?;
    verify!(e.len() == samples.len());

    samples
        .par_iter_mut()
        .zip(e.into_par_iter())
        .for_each(|(s, v)| s.surface_elevation = v);

    Ok(())
}

pub fn assign_bathy_estimates(samples: &mut [Sample], sigma: f64) -> Result<(), Error> {
    let e = elevation_estimates(samples, sigma, BATHY_CLASS)?;
    verify!(e.len() == samples.len());

    samples
        .par_iter_mut()
        .zip(e.into_par_iter())
        .for_each(|(s, v)| s.bathy_elevation = v);

    Ok(())
}

/// Demote surface-predicted photons that are out of absolute range or too
/// far from the surface estimate. Returns the number demoted.
///
/// Demotion decisions are computed as an aliasing-free parallel map; the
/// in-place reassignment is a sequential sweep.
pub fn check_surface_estimates(samples: &mut [Sample]) -> usize {
    let demote: Vec<bool> = samples
        .par_iter()
        .map(|s| {
            s.prediction == SEA_SURFACE_CLASS
                && (s.z < MIN_SURFACE_ELEVATION
                    || s.z > MAX_SURFACE_ELEVATION
                    || (s.z - s.surface_elevation).abs() > MAX_SURFACE_ESTIMATE_DELTA)
        })
        .collect();

    let mut changed = 0;
    for (s, d) in samples.iter_mut().zip(&demote) {
        if *d {
            s.prediction = NOISE_CLASS;
            changed += 1;
        }
    }
    changed
}

/// Demote bathymetry-predicted photons that are out of absolute range, not
/// deep enough below the surface estimate, or too far from the bathymetry
/// estimate. Returns the number demoted.
pub fn check_bathy_estimates(samples: &mut [Sample]) -> usize {
    let demote: Vec<bool> = samples
        .par_iter()
        .map(|s| {
            s.prediction == BATHY_CLASS
                && (s.z < MIN_PHOTON_ELEVATION
                    || s.z > MAX_PHOTON_ELEVATION
                    || s.z + MIN_BATHY_DEPTH >= s.surface_elevation
                    || (s.z - s.bathy_elevation).abs() > MAX_BATHY_ESTIMATE_DELTA)
        })
        .collect();

    let mut changed = 0;
    for (s, d) in samples.iter_mut().zip(&demote) {
        if *d {
            s.prediction = NOISE_CLASS;
            changed += 1;
        }
    }
    changed
}

/// Classify a photon stream: predict with the boosted-tree model, estimate
/// and reconcile reference surfaces on a fixed two-pass schedule, then run
/// blunder detection. Sample order is preserved and verified.
pub fn classify_samples(
    mut samples: Vec<Sample>,
    booster: &Booster,
    fp: &FeatureParams,
    pp: &PostprocessParams,
) -> Result<Vec<Sample>, Error> {
    if samples.is_empty() {
        return Ok(samples);
    }

    let h5_indexes: Vec<u64> = samples.par_iter().map(|s| s.h5_index).collect();

    let rows = samples.len();
    let cols = fp.features_per_sample();

    let predictions = {
        debug!(rows, cols, "creating features");
        let features = Features::new(&samples, *fp)?;
        let matrix = features.matrix()?;
        verify!(matrix.len() == rows * cols);

        debug!("getting predictions");
        booster.predict(&matrix, rows, cols)?
    };
    verify!(predictions.len() == rows);

    let correct = samples
        .iter()
        .zip(&predictions)
        .filter(|(s, p)| s.cls == **p)
        .count();
    debug!(
        "{:.1}% of predictions match input labels",
        100.0 * correct as f64 / rows as f64
    );

    for (s, p) in samples.iter_mut().zip(&predictions) {
        s.prediction = *p;
    }

    // Check predictions in multiple passes. The two-pass schedule is fixed:
    // reference outputs are defined by it, so no early exit on zero changes.
    const PASSES: usize = 2;

    assign_surface_estimates(&mut samples, SURFACE_SIGMA)?;
    for pass in 0..PASSES {
        let changed = check_surface_estimates(&mut samples);
        debug!(pass, changed, "surface reconciliation");
        assign_surface_estimates(&mut samples, SURFACE_SIGMA)?;
    }

    assign_bathy_estimates(&mut samples, BATHY_SIGMA)?;
    for pass in 0..PASSES {
        let changed = check_bathy_estimates(&mut samples);
        debug!(pass, changed, "bathy reconciliation");
        assign_bathy_estimates(&mut samples, BATHY_SIGMA)?;
    }

    debug!("re-classifying points");
    samples = blunder_detection(samples, pp);

    // The samples must come back in the order in which they were read
    verify!(samples
        .iter()
        .zip(&h5_indexes)
        .all(|(s, h)| s.h5_index == *h));

    Ok(samples)
}

/// Read labelled training CSVs, assigning a dataset id per file.
pub fn read_training_samples(filenames: &[std::path::PathBuf]) -> Result<Vec<Sample>, Error> {
    let mut samples = Vec::new();

    for (i, filename) in filenames.iter().enumerate() {
        info!("reading {}: {}", i, filename.display());

        let df = Dataframe::read_path(filename)?;
        debug!("{} rows read, {} columns", df.rows(), df.headers.len());

        if !df.has_column(dataframe::CLS_COLUMN) {
            return Err(Error::InputFormat(format!(
                "can't train without labelled data: {}",
                filename.display()
            )));
        }

        let mut tmp = convert_dataframe(&df)?;
        for s in &mut tmp {
            s.dataset_id = i;
        }
        samples.extend(tmp);
    }

    info!("{} samples read", samples.len());
    log_label_distribution(&samples);

    Ok(samples)
}

fn log_label_distribution(samples: &[Sample]) {
    if samples.is_empty() {
        return;
    }
    let mut label_map: HashMap<u32, usize> = HashMap::new();
    for s in samples {
        *label_map.entry(s.cls).or_insert(0) += 1;
    }
    let mut labels: Vec<_> = label_map.into_iter().collect();
    labels.sort_by_key(|(label, _)| *label);
    for (label, total) in labels {
        debug!(
            label,
            total,
            "{:.1}%",
            total as f64 * 100.0 / samples.len() as f64
        );
    }
}

/// Select training sample indexes in seeded-shuffle order, optionally
/// balancing class priors per dataset.
///
/// With ratio `r > 0`, each dataset contributes at most `m` bathymetry
/// photons and at most `m * r` noise and surface photons, where `m` is the
/// smallest per-class count within that dataset. `r == 0` disables
/// balancing and returns all indexes in shuffled order.
pub fn get_sample_indexes(samples: &[Sample], seed: u64, balance_priors_ratio: u32) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut random_indexes: Vec<usize> = (0..samples.len()).collect();
    random_indexes.shuffle(&mut rng);

    if balance_priors_ratio == 0 {
        return random_indexes;
    }

    // Count occurrence of each label in each dataset
    let mut label_counts: HashMap<usize, HashMap<u32, usize>> = HashMap::new();
    for s in samples {
        *label_counts
            .entry(s.dataset_id)
            .or_default()
            .entry(s.cls)
            .or_insert(0) += 1;
    }

    // The per-dataset cap is the smallest class count in that dataset
    let max_samples: HashMap<usize, usize> = label_counts
        .iter()
        .map(|(id, counts)| (*id, counts.values().copied().min().unwrap_or(0)))
        .collect();

    let mut sample_indexes = Vec::new();
    let mut sample_counts: HashMap<usize, HashMap<u32, usize>> = HashMap::new();

    for &j in &random_indexes {
        let s = &samples[j];

        let mut max = max_samples[&s.dataset_id];

        // Noise and surface get the specified multiple of the cap
        if s.cls == NOISE_CLASS || s.cls == SEA_SURFACE_CLASS {
            max *= balance_priors_ratio as usize;
        }

        let count = sample_counts
            .entry(s.dataset_id)
            .or_default()
            .entry(s.cls)
            .or_insert(0);

        if *count == max {
            continue;
        }

        sample_indexes.push(j);
        *count += 1;
    }

    sample_indexes
}

/// Dump an assembled training matrix as `label,dataset_id,f0..fN` CSV.
pub fn dump_features(
    path: &Path,
    features: &[f32],
    rows: usize,
    cols: usize,
    labels: &[u32],
    dataset_ids: &[u32],
) -> Result<(), Error> {
    verify!(features.len() == rows * cols);
    verify!(labels.len() == rows);
    verify!(dataset_ids.len() == rows);

    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| Error::InputFormat(format!("{}: {e}", path.display())))?;

    let mut header = vec!["label".to_string(), "dataset_id".to_string()];
    header.extend((0..cols).map(|i| format!("f{i}")));
    writer
        .write_record(&header)
        .map_err(|e| Error::InputFormat(e.to_string()))?;

    for i in 0..rows {
        let mut record = vec![labels[i].to_string(), dataset_ids[i].to_string()];
        record.extend(features[i * cols..(i + 1) * cols].iter().map(|f| f.to_string()));
        writer
            .write_record(&record)
            .map_err(|e| Error::InputFormat(e.to_string()))?;
    }

    writer.flush().map_err(|e| Error::InputFormat(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(x: f64, z: f64) -> Sample {
        Sample {
            x,
            z,
            ..Sample::default()
        }
    }

    #[test]
    fn test_window_indexes() {
        let samples: Vec<Sample> = (0..11).map(|i| sample_at(i as f64, 0.0)).collect();

        let w = window_indexes(&samples, 10.0);

        assert_eq!(w[0], 0);
        assert_eq!(w[1], 0);
        assert_eq!(w[9], 0);
        assert_eq!(w[10], 1);
    }

    #[test]
    fn test_quantile_means_simple() {
        let elevations = vec![3.0, 1.0, 7.0, 5.0, 2.0, 8.0, 4.0, 6.0];
        let q = quantile_means(elevations, 4);
        assert_eq!(q, vec![1.5, 3.5, 5.5, 7.5]);
    }

    #[test]
    fn test_quantile_means_sparse_window_is_zero() {
        let q = quantile_means(vec![1.0, 2.0, 3.0], 32);
        assert_eq!(q, vec![0.0; 32]);
    }

    #[test]
    fn test_quantile_means_nondecreasing() {
        let elevations: Vec<f64> = (0..101).map(|i| ((i * 37) % 101) as f64 / 7.0).collect();
        let q = quantile_means(elevations, 32);
        assert_eq!(q.len(), 32);
        for pair in q.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_feature_row_width_and_missing_neighbors() {
        // 120 photons spread over three 40 m windows, enough per window to
        // populate the quantiles
        let samples: Vec<Sample> = (0..120)
            .map(|i| sample_at(i as f64, (i % 13) as f64 - 6.0))
            .collect();

        let fp = FeatureParams::default();
        let features = Features::new(&samples, fp).unwrap();
        let cols = fp.features_per_sample();
        assert_eq!(cols, 1 + 32 + 2 * 2 * 32);

        let q = fp.total_quantiles;

        // Photon 0 sits in the leftmost window: both left neighbors missing
        let row = features.row(0).unwrap();
        assert_eq!(row.len(), cols);
        let left1 = &row[1 + 2 * q..1 + 3 * q];
        assert!(left1.iter().all(|v| *v == MISSING_DATA));
        let left2 = &row[1 + 4 * q..1 + 5 * q];
        assert!(left2.iter().all(|v| *v == MISSING_DATA));

        // Its first right neighbor is populated
        let right1 = &row[1 + q..1 + 2 * q];
        assert!(right1.iter().any(|v| *v != MISSING_DATA));

        // Photon in the last window: both right neighbors missing
        let row = features.row(119).unwrap();
        let right1 = &row[1 + q..1 + 2 * q];
        assert!(right1.iter().all(|v| *v == MISSING_DATA));
    }

    #[test]
    fn test_matrix_is_row_major() {
        let samples: Vec<Sample> = (0..50)
            .map(|i| sample_at(i as f64 * 0.5, (i % 7) as f64))
            .collect();
        let fp = FeatureParams::default();
        let features = Features::new(&samples, fp).unwrap();
        let m = features.matrix().unwrap();
        let cols = fp.features_per_sample();
        assert_eq!(m.len(), 50 * cols);
        assert_eq!(&m[cols..2 * cols], features.row(1).unwrap().as_slice());
    }

    #[test]
    fn test_quantized_average_one_meter_cells() {
        let mut samples = vec![
            sample_at(0.0, 1.0),
            sample_at(0.9, 3.0),
            sample_at(1.0, 5.0),
        ];
        for s in &mut samples {
            s.prediction = SEA_SURFACE_CLASS;
        }

        let (avg, min_x) = quantized_average(&samples, SEA_SURFACE_CLASS);
        assert_eq!(min_x, 0.0);
        assert!((avg[0] - 2.0).abs() < 1e-12);
        assert!((avg[1] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_quantized_average_negative_coordinates() {
        let mut samples = vec![sample_at(-2.5, 4.0), sample_at(0.5, 6.0)];
        for s in &mut samples {
            s.prediction = BATHY_CLASS;
        }

        let (avg, min_x) = quantized_average(&samples, BATHY_CLASS);
        assert_eq!(min_x, -3.0);
        assert!((avg[0] - 4.0).abs() < 1e-12);
        assert!((avg[3] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_interpolate_gaps_interior() {
        let mut v = vec![1.0, f64::NAN, f64::NAN, 4.0];
        interpolate_gaps(&mut v);
        assert!((v[1] - 2.0).abs() < 1e-12);
        assert!((v[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_interpolate_gaps_flat_ends() {
        let mut v = vec![f64::NAN, 2.0, f64::NAN, f64::NAN];
        interpolate_gaps(&mut v);
        assert_eq!(v, vec![2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_box_filter_constant_is_preserved() {
        let p = vec![5.0; 64];
        let q = box_filter(&p, 9).unwrap();
        for v in q {
            assert!((v - 5.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_box_filter_even_width_is_an_error() {
        let p = vec![0.0, 1.0, 2.0];
        assert!(matches!(box_filter(&p, 4), Err(Error::Internal { .. })));
    }

    #[test]
    fn test_box_filter_width_three() {
        let p = vec![0.0, 3.0, 6.0, 9.0];
        let q = box_filter(&p, 3).unwrap();
        // Ends average over the two in-range cells
        assert!((q[0] - 1.5).abs() < 1e-12);
        assert!((q[1] - 3.0).abs() < 1e-12);
        assert!((q[2] - 6.0).abs() < 1e-12);
        assert!((q[3] - 7.5).abs() < 1e-12);
    }

    #[test]
    fn test_elevation_estimates_sentinel_when_class_empty() {
        let samples = vec![sample_at(0.0, 0.0), sample_at(1.0, 1.0)];
        let e = elevation_estimates(&samples, SURFACE_SIGMA, SEA_SURFACE_CLASS).unwrap();
        assert!(e.iter().all(|v| *v == ELEVATION_SENTINEL));
    }

    #[test]
    fn test_elevation_estimates_flat_surface() {
        let mut samples: Vec<Sample> = (0..200).map(|i| sample_at(i as f64, 1.25)).collect();
        for s in &mut samples {
            s.prediction = SEA_SURFACE_CLASS;
        }
        let e = elevation_estimates(&samples, SURFACE_SIGMA, SEA_SURFACE_CLASS).unwrap();
        for v in e {
            assert!((v - 1.25).abs() < 1e-9);
        }
    }

    #[test]
    fn test_check_surface_estimates_demotes() {
        let mut samples: Vec<Sample> = (0..4).map(|i| sample_at(i as f64, 0.0)).collect();
        for s in &mut samples {
            s.prediction = SEA_SURFACE_CLASS;
            s.surface_elevation = 0.0;
        }
        samples[1].z = 100.0; // out of absolute range
        samples[2].z = 15.0; // in range but 15 m from the estimate

        let changed = check_surface_estimates(&mut samples);
        assert_eq!(changed, 2);
        assert_eq!(samples[0].prediction, SEA_SURFACE_CLASS);
        assert_eq!(samples[1].prediction, NOISE_CLASS);
        assert_eq!(samples[2].prediction, NOISE_CLASS);
        assert_eq!(samples[3].prediction, SEA_SURFACE_CLASS);
    }

    #[test]
    fn test_check_bathy_estimates_requires_depth_below_surface() {
        let mut samples: Vec<Sample> = (0..3).map(|i| sample_at(i as f64, -5.0)).collect();
        for s in &mut samples {
            s.prediction = BATHY_CLASS;
            s.surface_elevation = 0.0;
            s.bathy_elevation = -5.0;
        }
        // Less than 1.5 m below the surface estimate
        samples[1].z = -1.0;
        samples[1].bathy_elevation = -1.0;

        let changed = check_bathy_estimates(&mut samples);
        assert_eq!(changed, 1);
        assert_eq!(samples[1].prediction, NOISE_CLASS);
        assert_eq!(samples[0].prediction, BATHY_CLASS);
    }

    #[test]
    fn test_surface_outlier_is_demoted_and_estimate_recovers() {
        // 100 surface-predicted photons on a flat sea, one wild outlier
        let mut samples: Vec<Sample> = (0..100)
            .map(|i| {
                let mut s = sample_at(i as f64, 0.0);
                s.prediction = SEA_SURFACE_CLASS;
                s
            })
            .collect();
        samples[50].z = 100.0;

        // The post-prediction schedule: estimate, two reconciliation
        // passes, then blunder detection
        assign_surface_estimates(&mut samples, SURFACE_SIGMA).unwrap();
        for _ in 0..2 {
            check_surface_estimates(&mut samples);
            assign_surface_estimates(&mut samples, SURFACE_SIGMA).unwrap();
        }
        assign_bathy_estimates(&mut samples, BATHY_SIGMA).unwrap();
        for _ in 0..2 {
            check_bathy_estimates(&mut samples);
            assign_bathy_estimates(&mut samples, BATHY_SIGMA).unwrap();
        }
        let samples = blunder_detection(samples, &PostprocessParams::default());

        assert_eq!(samples[50].prediction, NOISE_CLASS);
        for (i, s) in samples.iter().enumerate() {
            if i != 50 {
                assert_eq!(s.prediction, SEA_SURFACE_CLASS);
            }
            assert!(s.surface_elevation.abs() < 1e-9);
        }
    }

    #[test]
    fn test_get_sample_indexes_no_balancing_returns_all() {
        let samples: Vec<Sample> = (0..10)
            .map(|i| {
                let mut s = sample_at(i as f64, 0.0);
                s.cls = if i % 2 == 0 { NOISE_CLASS } else { BATHY_CLASS };
                s
            })
            .collect();

        let mut indexes = get_sample_indexes(&samples, 123, 0);
        assert_eq!(indexes.len(), 10);
        indexes.sort_unstable();
        assert_eq!(indexes, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_get_sample_indexes_balances_priors() {
        // One dataset: 2 bathy, 6 noise, 4 surface
        let mut samples = Vec::new();
        for i in 0..12 {
            let mut s = sample_at(i as f64, 0.0);
            s.cls = match i {
                0 | 1 => BATHY_CLASS,
                2..=7 => NOISE_CLASS,
                _ => SEA_SURFACE_CLASS,
            };
            samples.push(s);
        }

        let indexes = get_sample_indexes(&samples, 123, 2);

        let mut counts: HashMap<u32, usize> = HashMap::new();
        for i in indexes {
            *counts.entry(samples[i].cls).or_insert(0) += 1;
        }

        // m = 2, so up to 2 bathy and up to 4 each of noise and surface
        assert_eq!(counts[&BATHY_CLASS], 2);
        assert_eq!(counts[&NOISE_CLASS], 4);
        assert_eq!(counts[&SEA_SURFACE_CLASS], 4);
    }

    #[test]
    fn test_get_sample_indexes_deterministic() {
        let samples: Vec<Sample> = (0..100).map(|i| sample_at(i as f64, 0.0)).collect();
        let a = get_sample_indexes(&samples, 7, 0);
        let b = get_sample_indexes(&samples, 7, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_remap_round_trip() {
        for cls in [0u32, 40, 41] {
            assert_eq!(unremap_label(remap_label(cls)), cls);
        }
        // Legacy "unclassified" maps onto noise
        assert_eq!(remap_label(1), 0);
    }

    #[test]
    fn test_classify_samples_preserves_order_and_classes() {
        // Train a toy model on well-separated elevations, then classify a
        // random stream and check the pipeline invariants end to end.
        let mut rng_state = 12345u64;
        let mut next = move || {
            // xorshift, just to avoid pulling rand into the test
            rng_state ^= rng_state << 13;
            rng_state ^= rng_state >> 7;
            rng_state ^= rng_state << 17;
            (rng_state >> 11) as f64 / (1u64 << 53) as f64
        };

        let mut samples: Vec<Sample> = (0..600)
            .map(|i| {
                let mut s = sample_at(next() * 100.0, next() * 60.0 - 50.0);
                s.h5_index = i as u64;
                s.cls = if s.z > -5.0 { SEA_SURFACE_CLASS } else { NOISE_CLASS };
                s
            })
            .collect();
        // Make surface photons sit near z = 0
        for s in &mut samples {
            if s.cls == SEA_SURFACE_CLASS {
                s.z = next() * 2.0 - 1.0;
            }
        }

        let fp = FeatureParams {
            window_size: 40.0,
            total_quantiles: 8,
            adjacent_windows: 1,
        };

        let features = Features::new(&samples, fp).unwrap();
        let matrix = features.matrix().unwrap();
        let labels: Vec<u32> = samples.iter().map(|s| remap_label(s.cls)).collect();
        drop(features);

        let params = TrainParams {
            num_boosting_rounds: 10,
            subsample: 1.0,
            colsample_bytree: 1.0,
            ..TrainParams::default()
        };
        let mut booster = Booster::new();
        booster
            .train(&matrix, &labels, samples.len(), fp.features_per_sample(), &params)
            .unwrap();

        let out = classify_samples(samples, &booster, &fp, &PostprocessParams::default()).unwrap();

        assert_eq!(out.len(), 600);
        for (i, s) in out.iter().enumerate() {
            assert_eq!(s.h5_index, i as u64);
            assert!(matches!(s.prediction, 0 | 40 | 41));
        }
        // Surface invariants after blunder detection
        let pp = PostprocessParams::default();
        for s in &out {
            if s.prediction == SEA_SURFACE_CLASS {
                assert!(s.z >= pp.surface_min_elevation && s.z <= pp.surface_max_elevation);
                assert!((s.z - s.surface_elevation).abs() <= pp.surface_range);
            }
        }
    }

    #[test]
    fn test_classify_samples_empty_input() {
        let booster = Booster::new();
        let out = classify_samples(
            Vec::new(),
            &booster,
            &FeatureParams::default(),
            &PostprocessParams::default(),
        )
        .unwrap();
        assert!(out.is_empty());
    }
}
