use ndarray::{Array2, Array3, Array4, Axis};

use crate::error::{RenaError, Result};

// ---------------------------------------------------------------------------
// SampleMatrix – masked data, one row per sample, one column per voxel
// ---------------------------------------------------------------------------

/// `(n_samples, n_features)`. Columns follow the C-order of the masked voxels
/// (x slowest, z fastest).
pub type SampleMatrix = Array2<f64>;

// ---------------------------------------------------------------------------
// Volume4D – three spatial axes plus the sample/time axis
// ---------------------------------------------------------------------------

/// A dense 4-D image of shape `(nx, ny, nz, n_samples)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume4D {
    data: Array4<f64>,
}

impl Volume4D {
    /// Wrap an existing array. Every axis must be non-empty.
    pub fn new(data: Array4<f64>) -> Result<Self> {
        if data.shape().iter().any(|&d| d == 0) {
            return Err(RenaError::InsufficientData(format!(
                "volume has an empty axis: {:?}",
                data.shape()
            )));
        }
        Ok(Volume4D { data })
    }

    /// An all-zero volume.
    pub fn zeros(shape: [usize; 3], n_samples: usize) -> Self {
        Volume4D {
            data: Array4::zeros((shape[0], shape[1], shape[2], n_samples)),
        }
    }

    pub fn data(&self) -> &Array4<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array4<f64> {
        &mut self.data
    }

    /// Spatial shape `(nx, ny, nz)`.
    pub fn shape3(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    /// Length of the sample/time axis.
    pub fn n_samples(&self) -> usize {
        self.data.shape()[3]
    }

    /// Mean over the sample axis.
    pub fn mean_image(&self) -> Array3<f64> {
        let n = self.n_samples().max(1) as f64;
        self.data.sum_axis(Axis(3)) / n
    }
}

// ---------------------------------------------------------------------------
// Mask3D – voxels of interest
// ---------------------------------------------------------------------------

/// Boolean spatial mask of shape `(nx, ny, nz)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask3D {
    data: Array3<bool>,
}

impl Mask3D {
    pub fn new(data: Array3<bool>) -> Self {
        Mask3D { data }
    }

    /// A mask selecting every voxel.
    pub fn full(shape: [usize; 3]) -> Self {
        Mask3D {
            data: Array3::from_elem((shape[0], shape[1], shape[2]), true),
        }
    }

    pub fn data(&self) -> &Array3<bool> {
        &self.data
    }

    pub fn shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    /// Number of selected voxels.
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Flat C-order indices of the selected voxels, ascending.
    pub fn voxel_indices(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, &v)| v)
            .map(|(i, _)| i)
            .collect()
    }

    /// `(i, j, k)` coordinates of the selected voxels, in column order.
    pub fn voxel_coords(&self) -> Vec<[usize; 3]> {
        self.data
            .indexed_iter()
            .filter(|(_, &v)| v)
            .map(|((i, j, k), _)| [i, j, k])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_axis_is_rejected() {
        let err = Volume4D::new(Array4::zeros((3, 0, 2, 4))).unwrap_err();
        assert!(matches!(err, RenaError::InsufficientData(_)));
    }

    #[test]
    fn mean_image_averages_samples() {
        let mut vol = Volume4D::zeros([2, 2, 2], 4);
        for t in 0..4 {
            vol.data_mut()[[1, 0, 1, t]] = t as f64;
        }
        let mean = vol.mean_image();
        assert_eq!(mean[[1, 0, 1]], 1.5);
        assert_eq!(mean[[0, 0, 0]], 0.0);
    }

    #[test]
    fn voxel_indices_follow_c_order() {
        let mut data = Array3::from_elem((2, 3, 4), false);
        data[[0, 0, 1]] = true;
        data[[1, 2, 3]] = true;
        data[[0, 1, 0]] = true;
        let mask = Mask3D::new(data);

        assert_eq!(mask.count(), 3);
        assert_eq!(mask.voxel_indices(), vec![1, 4, 23]);
        assert_eq!(mask.voxel_coords(), vec![[0, 0, 1], [0, 1, 0], [1, 2, 3]]);
    }
}
