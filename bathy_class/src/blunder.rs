//! Physical plausibility checks applied after classification. Each check
//! reassigns implausible predictions to noise; the cascade order matters
//! and is fixed.

use crate::{PostprocessParams, Sample, BATHY_CLASS, NOISE_CLASS, SEA_SURFACE_CLASS};

fn count_predictions(p: &[Sample], cls: u32) -> usize {
    p.iter().filter(|s| s.prediction == cls).count()
}

/// For every photon, the index of the nearest-in-x photon predicted as
/// `cls`. One left-to-right pass: a left cursor trails the most recent
/// `cls` photon, a right cursor is advanced lazily, and ties go left.
/// Photons outside the first/last `cls` indexes snap to those. When no
/// photon has class `cls`, every entry is the out-of-range sentinel
/// `p.len()`.
fn nearest_along_track_prediction(p: &[Sample], cls: u32) -> Vec<usize> {
    let n = p.len();
    let mut indexes = vec![n; n];

    if n == 0 {
        return indexes;
    }

    // First and last indexes with the class of interest
    let mut first_index = n;
    let mut last_index = n;
    for (i, s) in p.iter().enumerate() {
        if s.prediction != cls {
            continue;
        }
        if first_index == n {
            first_index = i;
        }
        last_index = i;
    }

    if first_index == n {
        return indexes;
    }

    for i in indexes.iter_mut().take(first_index) {
        *i = first_index;
    }
    for i in indexes.iter_mut().skip(last_index) {
        *i = last_index;
    }

    let mut left_index = n;
    let mut right_index = n;

    for i in first_index..last_index {
        if p[i].prediction == cls {
            // Closest photon with this class is itself
            indexes[i] = i;
            left_index = i;
            right_index = i;
            continue;
        }

        // Advance the right cursor past the current position
        if right_index < i {
            for (j, s) in p.iter().enumerate().take(last_index + 1).skip(i) {
                if s.prediction == cls {
                    right_index = j;
                    break;
                }
            }
        }

        let d_left = p[i].x - p[left_index].x;
        let d_right = p[right_index].x - p[i].x;

        indexes[i] = if d_left <= d_right {
            left_index
        } else {
            right_index
        };
    }

    indexes
}

/// Surface photons must be near sea level.
fn surface_elevation_check(mut p: Vec<Sample>, min_elevation: f64, max_elevation: f64) -> Vec<Sample> {
    for s in &mut p {
        if s.prediction != SEA_SURFACE_CLASS {
            continue;
        }
        if s.z > max_elevation || s.z < min_elevation {
            s.prediction = NOISE_CLASS;
        }
    }
    p
}

/// Bathy photons can't be too deep.
fn bathy_elevation_check(mut p: Vec<Sample>, min_elevation: f64) -> Vec<Sample> {
    for s in &mut p {
        if s.prediction != BATHY_CLASS {
            continue;
        }
        if s.z < min_elevation {
            s.prediction = NOISE_CLASS;
        }
    }
    p
}

/// Bathy photons must sit strictly below the surface estimate of the
/// nearest surface photon, provided one lies within `water_column_width`
/// meters along track.
fn relative_depth_check(mut p: Vec<Sample>, water_column_width: f64) -> Vec<Sample> {
    if count_predictions(&p, SEA_SURFACE_CLASS) == 0 {
        return p;
    }
    if count_predictions(&p, BATHY_CLASS) == 0 {
        return p;
    }

    let nearby_surface_indexes = nearest_along_track_prediction(&p, SEA_SURFACE_CLASS);

    for i in 0..p.len() {
        if p[i].prediction != BATHY_CLASS {
            continue;
        }

        let j = nearby_surface_indexes[i];
        let dx = (p[i].x - p[j].x).abs();

        // Too far away to apply the check
        if dx > water_column_width {
            continue;
        }

        if p[i].z < p[j].surface_elevation {
            continue;
        }

        p[i].prediction = NOISE_CLASS;
    }

    p
}

/// Surface photons must all be near the surface estimate.
fn surface_range_check(mut p: Vec<Sample>, range: f64) -> Vec<Sample> {
    if count_predictions(&p, SEA_SURFACE_CLASS) == 0 {
        return p;
    }

    for s in &mut p {
        if s.prediction != SEA_SURFACE_CLASS {
            continue;
        }
        if (s.z - s.surface_elevation).abs() > range {
            s.prediction = NOISE_CLASS;
        }
    }
    p
}

/// Bathy photons must all be near the bathy estimate.
fn bathy_range_check(mut p: Vec<Sample>, range: f64) -> Vec<Sample> {
    if count_predictions(&p, BATHY_CLASS) == 0 {
        return p;
    }

    for s in &mut p {
        if s.prediction != BATHY_CLASS {
            continue;
        }
        if (s.z - s.bathy_elevation).abs() > range {
            s.prediction = NOISE_CLASS;
        }
    }
    p
}

/// Reclassify implausible photons using heuristics, in a fixed order:
/// absolute surface bounds, bathy floor, relative depth against the nearest
/// surface photon, then proximity to the two estimates.
pub fn blunder_detection(p: Vec<Sample>, params: &PostprocessParams) -> Vec<Sample> {
    if p.is_empty() {
        return p;
    }

    let p = surface_elevation_check(
        p,
        params.surface_min_elevation,
        params.surface_max_elevation,
    );
    let p = bathy_elevation_check(p, params.bathy_min_elevation);
    let p = relative_depth_check(p, params.water_column_width);
    let p = surface_range_check(p, params.surface_range);
    bathy_range_check(p, params.bathy_range)
}
