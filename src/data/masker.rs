use std::collections::BTreeMap;

use ndarray::{Array2, Array3};

use super::model::{Mask3D, SampleMatrix, Volume4D};
use crate::error::{RenaError, Result};

/// Thickness of the border slab sampled to find the background value.
const BORDER_SIZE: usize = 2;

// ---------------------------------------------------------------------------
// VolumeMasker – 4-D volume ⇄ (samples × voxels) matrix
// ---------------------------------------------------------------------------

/// Extracts the masked voxels of a [`Volume4D`] as a [`SampleMatrix`] and
/// puts them back.
///
/// Built either from an explicit mask or with none, in which case `fit`
/// computes a background mask from the data.
#[derive(Debug, Clone, Default)]
pub struct VolumeMasker {
    mask_img: Option<Mask3D>,
    fitted: Option<FittedMask>,
}

#[derive(Debug, Clone)]
struct FittedMask {
    mask: Mask3D,
    coords: Vec<[usize; 3]>,
}

impl VolumeMasker {
    pub fn new(mask_img: Option<Mask3D>) -> Self {
        VolumeMasker {
            mask_img,
            fitted: None,
        }
    }

    pub fn with_mask(mask: Mask3D) -> Self {
        Self::new(Some(mask))
    }

    /// A masker that is already fitted to `mask`, e.g. one restored from disk.
    pub fn from_fitted_mask(mask: Mask3D) -> Result<Self> {
        if mask.is_empty() {
            return Err(RenaError::EmptyMask);
        }
        let coords = mask.voxel_coords();
        Ok(VolumeMasker {
            mask_img: Some(mask.clone()),
            fitted: Some(FittedMask { mask, coords }),
        })
    }

    /// Resolve the mask against `volume`.
    pub fn fit(&mut self, volume: &Volume4D) -> Result<&mut Self> {
        let mask = match &self.mask_img {
            Some(mask) => {
                if mask.shape() != volume.shape3() {
                    return Err(RenaError::ShapeMismatch {
                        expected: volume.shape3().to_vec(),
                        actual: mask.shape().to_vec(),
                    });
                }
                mask.clone()
            }
            None => compute_background_mask(volume),
        };
        if mask.is_empty() {
            return Err(RenaError::EmptyMask);
        }
        log::debug!(
            "masker fitted: {} of {} voxels selected",
            mask.count(),
            mask.data().len()
        );
        let coords = mask.voxel_coords();
        self.fitted = Some(FittedMask { mask, coords });
        Ok(self)
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// The mask in use after `fit`.
    pub fn mask(&self) -> Option<&Mask3D> {
        self.fitted.as_ref().map(|f| &f.mask)
    }

    /// Number of masked voxels, i.e. columns of the sample matrix.
    pub fn n_features(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.coords.len())
    }

    fn fitted(&self) -> Result<&FittedMask> {
        self.fitted.as_ref().ok_or(RenaError::NotFitted("VolumeMasker"))
    }

    pub fn transform(&self, volume: &Volume4D) -> Result<SampleMatrix> {
        let fitted = self.fitted()?;
        if fitted.mask.shape() != volume.shape3() {
            return Err(RenaError::ShapeMismatch {
                expected: fitted.mask.shape().to_vec(),
                actual: volume.shape3().to_vec(),
            });
        }
        let data = volume.data();
        let n_samples = volume.n_samples();
        let mut out = Array2::zeros((n_samples, fitted.coords.len()));
        for (col, &[i, j, k]) in fitted.coords.iter().enumerate() {
            for t in 0..n_samples {
                out[[t, col]] = data[[i, j, k, t]];
            }
        }
        Ok(out)
    }

    /// Scatter the columns back into a volume; unmasked voxels are zero.
    pub fn inverse_transform(&self, matrix: &SampleMatrix) -> Result<Volume4D> {
        let fitted = self.fitted()?;
        if matrix.ncols() != fitted.coords.len() {
            return Err(RenaError::ShapeMismatch {
                expected: vec![matrix.nrows(), fitted.coords.len()],
                actual: matrix.shape().to_vec(),
            });
        }
        let n_samples = matrix.nrows();
        let mut volume = Volume4D::zeros(fitted.mask.shape(), n_samples);
        let data = volume.data_mut();
        for (col, &[i, j, k]) in fitted.coords.iter().enumerate() {
            for t in 0..n_samples {
                data[[i, j, k, t]] = matrix[[t, col]];
            }
        }
        Ok(volume)
    }
}

// ---------------------------------------------------------------------------
// Background mask
// ---------------------------------------------------------------------------

/// Mask every voxel whose mean differs from the background.
///
/// The background is the most frequent value in the border slab of the mean
/// image. If the border holds NaNs, the mask is simply the finite voxels.
pub fn compute_background_mask(volume: &Volume4D) -> Mask3D {
    let mean = volume.mean_image();
    let border = border_values(&mean, BORDER_SIZE);

    if border.iter().any(|v| v.is_nan()) {
        return Mask3D::new(mean.mapv(|v| v.is_finite()));
    }

    // Ties resolve to the smallest value.
    let mut counts: BTreeMap<u64, (f64, usize)> = BTreeMap::new();
    for v in border {
        // Fold -0.0 into 0.0 before keying on the bit pattern.
        let v = if v == 0.0 { 0.0 } else { v };
        counts.entry(v.to_bits()).or_insert((v, 0)).1 += 1;
    }
    let background = counts
        .values()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.total_cmp(&a.0)))
        .map(|&(v, _)| v)
        .unwrap_or(0.0);

    log::debug!("background value {background}");
    Mask3D::new(mean.mapv(|v| v.is_finite() && v != background))
}

fn border_values(image: &Array3<f64>, size: usize) -> Vec<f64> {
    let shape = image.shape();
    image
        .indexed_iter()
        .filter(|((i, j, k), _)| {
            [*i, *j, *k]
                .iter()
                .zip(shape.iter())
                .any(|(&c, &n)| c < size || c + size >= n)
        })
        .map(|(_, &v)| v)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::generate_fake_fmri;

    #[test]
    fn background_mask_recovers_box() {
        let (vol, mask) = generate_fake_fmri([10, 11, 12], 5, 1);
        let computed = compute_background_mask(&vol);
        assert_eq!(computed, mask);
    }

    #[test]
    fn transform_then_inverse_restores_masked_voxels() {
        let (vol, mask) = generate_fake_fmri([6, 7, 8], 3, 3);
        let mut masker = VolumeMasker::with_mask(mask.clone());
        assert!(!masker.is_fitted());
        masker.fit(&vol).unwrap();
        assert!(masker.is_fitted());

        let x = masker.transform(&vol).unwrap();
        assert_eq!(x.shape(), &[3, mask.count()]);

        let back = masker.inverse_transform(&x).unwrap();
        assert_eq!(back, vol);
    }

    #[test]
    fn transform_before_fit_fails() {
        let (vol, _) = generate_fake_fmri([4, 4, 4], 2, 0);
        let masker = VolumeMasker::default();
        assert!(matches!(
            masker.transform(&vol),
            Err(RenaError::NotFitted(_))
        ));
    }

    #[test]
    fn mismatched_mask_shape_is_rejected() {
        let (vol, _) = generate_fake_fmri([4, 4, 4], 2, 0);
        let mut masker = VolumeMasker::with_mask(Mask3D::full([4, 4, 5]));
        assert!(matches!(
            masker.fit(&vol),
            Err(RenaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn constant_volume_gives_empty_mask() {
        let vol = Volume4D::zeros([5, 5, 5], 2);
        let mut masker = VolumeMasker::default();
        assert!(matches!(masker.fit(&vol), Err(RenaError::EmptyMask)));
    }

    #[test]
    fn inverse_rejects_wrong_column_count() {
        let (vol, mask) = generate_fake_fmri([6, 6, 6], 2, 0);
        let mut masker = VolumeMasker::with_mask(mask);
        masker.fit(&vol).unwrap();
        let wrong = Array2::zeros((2, 3));
        assert!(masker.inverse_transform(&wrong).is_err());
    }
}
