use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::model::{Mask3D, Volume4D};
use crate::error::{RenaError, Result};

/// Box mask of width `s / 2` along each axis, starting at `s / 4`.
pub fn box_mask(shape: [usize; 3]) -> Mask3D {
    let start = shape.map(|s| s / 4);
    let width = shape.map(|s| s / 2);
    let mut data = Array3::from_elem((shape[0], shape[1], shape[2]), false);
    for ((i, j, k), v) in data.indexed_iter_mut() {
        *v = [i, j, k]
            .iter()
            .zip(start.iter().zip(width.iter()))
            .all(|(&c, (&s, &w))| c >= s && c < s + w);
    }
    Mask3D::new(data)
}

/// Fake fMRI run: integer-valued noise in `0..256` inside a box mask, zero
/// everywhere else.
///
/// Returns the volume together with the mask it was generated from.
pub fn generate_fake_fmri(shape: [usize; 3], length: usize, seed: u64) -> (Volume4D, Mask3D) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mask = box_mask(shape);
    let mut volume = Volume4D::zeros(shape, length);

    for [i, j, k] in mask.voxel_coords() {
        for t in 0..length {
            volume.data_mut()[[i, j, k, t]] = rng.gen_range(0..256) as f64;
        }
    }
    (volume, mask)
}

fn gaussian(d2: f64, sigma: f64) -> f64 {
    (-d2 / (2.0 * sigma.powi(2))).exp()
}

/// Fake fMRI run with spatial structure: a few Gaussian blobs inside the box
/// mask, each with its own random time course, plus white noise.
pub fn generate_smooth_fmri(
    shape: [usize; 3],
    length: usize,
    n_blobs: usize,
    noise_level: f64,
    seed: u64,
) -> Result<(Volume4D, Mask3D)> {
    let noise = Normal::new(0.0, noise_level).map_err(|e| {
        RenaError::InvalidParameter(format!("noise level {noise_level}: {e}"))
    })?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mask = box_mask(shape);
    let coords = mask.voxel_coords();
    let mut volume = Volume4D::zeros(shape, length);
    if coords.is_empty() {
        return Ok((volume, mask));
    }

    // (centre, sigma, time course)
    let blobs: Vec<([f64; 3], f64, Vec<f64>)> = (0..n_blobs)
        .map(|_| {
            let c = coords[rng.gen_range(0..coords.len())];
            let sigma = rng.gen_range(1.0..3.0);
            let course = (0..length).map(|_| rng.gen_range(-100.0..100.0)).collect();
            (c.map(|x| x as f64), sigma, course)
        })
        .collect();

    for [i, j, k] in coords {
        let p = [i as f64, j as f64, k as f64];
        for t in 0..length {
            let signal: f64 = blobs
                .iter()
                .map(|(c, sigma, course)| {
                    let d2: f64 = p.iter().zip(c.iter()).map(|(a, b)| (a - b).powi(2)).sum();
                    course[t] * gaussian(d2, *sigma)
                })
                .sum();
            // Offset keeps masked voxels distinct from the zero background.
            volume.data_mut()[[i, j, k, t]] = 500.0 + signal + noise.sample(&mut rng);
        }
    }
    Ok((volume, mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_mask_matches_expected_size() {
        let mask = box_mask([10, 11, 12]);
        assert_eq!(mask.count(), 5 * 5 * 6);
        assert!(mask.data()[[2, 2, 3]]);
        assert!(!mask.data()[[1, 2, 3]]);
        assert!(!mask.data()[[7, 2, 3]]);
    }

    #[test]
    fn fake_fmri_is_zero_outside_mask() {
        let (vol, mask) = generate_fake_fmri([10, 11, 12], 5, 0);
        assert_eq!(vol.data().shape(), &[10, 11, 12, 5]);
        for ((i, j, k, _), &v) in vol.data().indexed_iter() {
            if !mask.data()[[i, j, k]] {
                assert_eq!(v, 0.0);
            } else {
                assert!((0.0..256.0).contains(&v));
            }
        }
    }

    #[test]
    fn same_seed_same_volume() {
        let (a, _) = generate_fake_fmri([6, 6, 6], 3, 7);
        let (b, _) = generate_fake_fmri([6, 6, 6], 3, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn smooth_fmri_has_no_zero_voxels_in_mask() {
        let (vol, mask) = generate_smooth_fmri([8, 8, 8], 4, 3, 1.0, 42).unwrap();
        for [i, j, k] in mask.voxel_coords() {
            assert!(vol.data()[[i, j, k, 0]] != 0.0);
        }
    }

    #[test]
    fn negative_noise_level_is_rejected() {
        let err = generate_smooth_fmri([8, 8, 8], 4, 3, -1.0, 42).unwrap_err();
        assert!(matches!(err, RenaError::InvalidParameter(_)));
    }
}
