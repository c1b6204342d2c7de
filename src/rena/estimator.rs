use ndarray::Array3;
use serde::{Deserialize, Serialize};

use super::agglomeration::{average_columns, recursive_neighbor_agglomeration};
use crate::data::masker::VolumeMasker;
use crate::data::model::{Mask3D, SampleMatrix, Volume4D};
use crate::error::{RenaError, Result};
use crate::memory::{CacheKey, Memory};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// ReNA hyper-parameters.
///
/// Counts are signed so that invalid values survive construction and are
/// reported by [`ReNA::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReNAConfig {
    /// Number of clusters to reach.
    pub n_clusters: i64,
    /// Multiply each reduced feature by `sqrt(cluster size)`.
    pub scaling: bool,
    /// Maximum number of agglomeration steps.
    pub n_iter: i64,
    /// Relative tolerance for nearest-neighbour ties, also the weight floor.
    pub threshold: f64,
}

impl Default for ReNAConfig {
    fn default() -> Self {
        Self {
            n_clusters: 2,
            scaling: false,
            n_iter: 10,
            threshold: 1e-7,
        }
    }
}

impl ReNAConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_clusters <= 0 {
            return Err(RenaError::InvalidParameter(format!(
                "n_clusters should be an integer greater than 0. {} was provided.",
                self.n_clusters
            )));
        }
        if self.n_iter <= 0 {
            return Err(RenaError::InvalidParameter(format!(
                "n_iter should be an integer greater than 0. {} was provided.",
                self.n_iter
            )));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(RenaError::InvalidParameter(format!(
                "threshold should be a finite, non-negative number. {} was provided.",
                self.threshold
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReNA estimator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Clustering {
    masker: VolumeMasker,
    labels: Vec<usize>,
    n_clusters: usize,
    sizes: Vec<usize>,
}

/// Recursive Nearest Agglomeration: clusters spatially adjacent voxels with
/// similar signals and reduces a volume to one feature per cluster.
///
/// ```ignore
/// let mut rena = ReNA::new(10).with_mask(Some(VolumeMasker::with_mask(mask)));
/// let reduced = rena.fit_transform(&volume)?;
/// let restored = rena.inverse_transform(&reduced)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReNA {
    config: ReNAConfig,
    masker: Option<VolumeMasker>,
    memory: Memory,
    fitted: Option<Clustering>,
}

impl ReNA {
    pub fn new(n_clusters: i64) -> Self {
        Self::from_config(ReNAConfig {
            n_clusters,
            ..ReNAConfig::default()
        })
    }

    pub fn from_config(config: ReNAConfig) -> Self {
        ReNA {
            config,
            masker: None,
            memory: Memory::default(),
            fitted: None,
        }
    }

    /// `None` computes a background mask from the data at fit time.
    pub fn with_mask(mut self, masker: Option<VolumeMasker>) -> Self {
        self.masker = masker;
        self
    }

    pub fn with_scaling(mut self, scaling: bool) -> Self {
        self.config.scaling = scaling;
        self
    }

    pub fn with_n_iter(mut self, n_iter: i64) -> Self {
        self.config.n_iter = n_iter;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.config.threshold = threshold;
        self
    }

    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = memory;
        self
    }

    pub fn config(&self) -> &ReNAConfig {
        &self.config
    }

    // -- fitting --

    /// Learn the clusters of `volume`.
    ///
    /// Parameters are validated here, not at construction. A requested
    /// cluster count above the number of masked voxels is clamped with a
    /// warning.
    pub fn fit(&mut self, volume: &Volume4D) -> Result<&mut Self> {
        self.config.validate()?;

        let mut masker = self.masker.clone().unwrap_or_default();
        masker.fit(volume)?;
        let data = masker.transform(volume)?;
        let mask = masker.mask().ok_or(RenaError::NotFitted("VolumeMasker"))?;

        let (n_samples, n_features) = data.dim();
        if n_samples < 2 {
            return Err(RenaError::InsufficientData(format!(
                "found {n_samples} sample(s) while a minimum of 2 is required"
            )));
        }
        if n_features < 2 {
            return Err(RenaError::InsufficientData(format!(
                "found {n_features} masked voxel(s) while a minimum of 2 is required"
            )));
        }

        let mut n_clusters = self.config.n_clusters as usize;
        if n_clusters > n_features {
            log::warn!(
                "n_clusters should be at most the number of features. Taking n_clusters = {n_features} instead."
            );
            n_clusters = n_features;
        }
        let n_iter = self.config.n_iter as usize;
        let threshold = self.config.threshold;

        let key = CacheKey::new("recursive_neighbor_agglomeration")
            .param("n_clusters", n_clusters)
            .param("n_iter", n_iter)
            .param("threshold", threshold)
            .param("shape", format!("{:?}", mask.shape()))
            .indices(&mask.voxel_indices())
            .floats(data.iter());
        let (n_labels, labels): (usize, Vec<usize>) = self.memory.cache_checked(
            &key,
            |(n_labels, labels): &(usize, Vec<usize>)| {
                *n_labels <= n_features
                    && labels.len() == n_features
                    && labels.iter().all(|l| l < n_labels)
            },
            || recursive_neighbor_agglomeration(&data, mask, n_clusters, n_iter, threshold),
        )?;

        let mut sizes = vec![0usize; n_labels];
        for &l in &labels {
            sizes[l] += 1;
        }
        sizes.retain(|&s| s > 0);

        log::info!(
            "ReNA fitted: {n_features} voxels -> {} clusters ({} samples)",
            sizes.len(),
            n_samples
        );
        self.fitted = Some(Clustering {
            masker,
            labels,
            n_clusters: sizes.len(),
            sizes,
        });
        Ok(self)
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn clustering(&self) -> Result<&Clustering> {
        self.fitted.as_ref().ok_or(RenaError::NotFitted("ReNA"))
    }

    // -- accessors --

    /// Cluster of each masked voxel, in C-order of the mask.
    pub fn labels(&self) -> Result<&[usize]> {
        Ok(&self.clustering()?.labels)
    }

    /// Number of clusters actually learned.
    pub fn n_clusters_(&self) -> Result<usize> {
        Ok(self.clustering()?.n_clusters)
    }

    /// Voxel count of each cluster.
    pub fn sizes(&self) -> Result<&[usize]> {
        Ok(&self.clustering()?.sizes)
    }

    /// The mask the clustering was learned on.
    pub fn mask(&self) -> Result<&Mask3D> {
        self.clustering()?
            .masker
            .mask()
            .ok_or(RenaError::NotFitted("VolumeMasker"))
    }

    /// Label image: `label + 1` inside the mask, 0 outside.
    pub fn labels_img(&self) -> Result<Array3<i64>> {
        let clustering = self.clustering()?;
        let mask = self.mask()?;
        let [nx, ny, nz] = mask.shape();
        let mut img = Array3::zeros((nx, ny, nz));
        for ([i, j, k], &label) in mask.voxel_coords().into_iter().zip(&clustering.labels) {
            img[[i, j, k]] = label as i64 + 1;
        }
        Ok(img)
    }

    // -- transforms --

    /// Mean signal of every cluster: `(n_samples, n_clusters_)`.
    pub fn transform(&self, volume: &Volume4D) -> Result<SampleMatrix> {
        let clustering = self.clustering()?;
        let data = clustering.masker.transform(volume)?;
        let mut reduced = average_columns(&data, &clustering.labels, clustering.n_clusters);
        if self.config.scaling {
            for (mut col, &size) in reduced.columns_mut().into_iter().zip(&clustering.sizes) {
                col *= (size as f64).sqrt();
            }
        }
        Ok(reduced)
    }

    pub fn fit_transform(&mut self, volume: &Volume4D) -> Result<SampleMatrix> {
        self.fit(volume)?;
        self.transform(volume)
    }

    /// Broadcast every cluster value back to its voxels.
    pub fn inverse_transform(&self, reduced: &SampleMatrix) -> Result<Volume4D> {
        let clustering = self.clustering()?;
        if reduced.ncols() != clustering.n_clusters {
            return Err(RenaError::ShapeMismatch {
                expected: vec![reduced.nrows(), clustering.n_clusters],
                actual: reduced.shape().to_vec(),
            });
        }

        let mut reduced = reduced.clone();
        if self.config.scaling {
            for (mut col, &size) in reduced.columns_mut().into_iter().zip(&clustering.sizes) {
                col /= (size as f64).sqrt();
            }
        }

        let mut data = SampleMatrix::zeros((reduced.nrows(), clustering.labels.len()));
        for (col, &label) in clustering.labels.iter().enumerate() {
            data.column_mut(col).assign(&reduced.column(label));
        }
        clustering.masker.inverse_transform(&data)
    }

    // -- persistence --

    /// Snapshot of a fitted estimator.
    pub fn to_model(&self) -> Result<ReNAModel> {
        let clustering = self.clustering()?;
        let mask = self.mask()?;
        Ok(ReNAModel {
            config: self.config.clone(),
            shape: mask.shape(),
            voxels: mask.voxel_coords(),
            labels: clustering.labels.clone(),
            sizes: clustering.sizes.clone(),
        })
    }

    /// Rebuild a fitted estimator from a snapshot.
    pub fn from_model(model: ReNAModel) -> Result<Self> {
        model.config.validate()?;
        if model.labels.len() != model.voxels.len() {
            return Err(RenaError::ShapeMismatch {
                expected: vec![model.voxels.len()],
                actual: vec![model.labels.len()],
            });
        }
        let n_clusters = model.sizes.len();
        let mut counts = vec![0usize; n_clusters];
        for &label in &model.labels {
            if label >= n_clusters {
                return Err(RenaError::InvalidParameter(format!(
                    "label {label} out of range for {n_clusters} clusters"
                )));
            }
            counts[label] += 1;
        }
        if counts != model.sizes {
            return Err(RenaError::InvalidParameter(
                "cluster sizes do not match labels".to_string(),
            ));
        }

        let [nx, ny, nz] = model.shape;
        let mut data = Array3::from_elem((nx, ny, nz), false);
        for &[i, j, k] in &model.voxels {
            if i >= nx || j >= ny || k >= nz {
                return Err(RenaError::ShapeMismatch {
                    expected: model.shape.to_vec(),
                    actual: vec![i, j, k],
                });
            }
            data[[i, j, k]] = true;
        }
        let mask = Mask3D::new(data);
        // Labels follow mask C-order; the stored voxel list must too.
        if mask.voxel_coords() != model.voxels {
            return Err(RenaError::InvalidParameter(
                "model voxels must be unique and in C-order".to_string(),
            ));
        }
        let masker = VolumeMasker::from_fitted_mask(mask)?;

        Ok(ReNA {
            config: model.config,
            masker: Some(masker.clone()),
            memory: Memory::default(),
            fitted: Some(Clustering {
                masker,
                labels: model.labels,
                n_clusters,
                sizes: model.sizes,
            }),
        })
    }
}

/// Serializable form of a fitted [`ReNA`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReNAModel {
    pub config: ReNAConfig,
    pub shape: [usize; 3],
    /// Masked voxels in C-order.
    pub voxels: Vec<[usize; 3]>,
    pub labels: Vec<usize>,
    pub sizes: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::generate_fake_fmri;

    #[test]
    fn zero_iterations_are_rejected() {
        let (vol, mask) = generate_fake_fmri([6, 6, 6], 3, 0);
        let mut rena = ReNA::new(4)
            .with_mask(Some(VolumeMasker::with_mask(mask)))
            .with_n_iter(0);
        let err = rena.fit(&vol).unwrap_err();
        assert!(err.to_string().starts_with("n_iter should be"));
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let (vol, _) = generate_fake_fmri([6, 6, 6], 3, 0);
        let mut rena = ReNA::new(4).with_threshold(-1.0);
        assert!(matches!(rena.fit(&vol), Err(RenaError::InvalidParameter(_))));
    }

    #[test]
    fn too_many_clusters_are_clamped() {
        let (vol, mask) = generate_fake_fmri([4, 4, 4], 3, 5);
        let n_voxels = mask.count();
        let mut rena = ReNA::new(1000).with_mask(Some(VolumeMasker::with_mask(mask)));
        rena.fit(&vol).unwrap();
        assert_eq!(rena.n_clusters_().unwrap(), n_voxels);
        assert!(rena.sizes().unwrap().iter().all(|&s| s == 1));
    }

    #[test]
    fn single_sample_is_rejected() {
        let (vol, mask) = generate_fake_fmri([6, 6, 6], 1, 0);
        let mut rena = ReNA::new(2).with_mask(Some(VolumeMasker::with_mask(mask)));
        assert!(matches!(rena.fit(&vol), Err(RenaError::InsufficientData(_))));
    }

    #[test]
    fn transform_before_fit_fails() {
        let (vol, _) = generate_fake_fmri([6, 6, 6], 3, 0);
        let rena = ReNA::new(2);
        assert!(!rena.is_fitted());
        assert!(matches!(rena.transform(&vol), Err(RenaError::NotFitted(_))));
    }

    #[test]
    fn labels_img_marks_every_masked_voxel() {
        let (vol, mask) = generate_fake_fmri([8, 8, 8], 4, 2);
        let mut rena = ReNA::new(6).with_mask(Some(VolumeMasker::with_mask(mask.clone())));
        rena.fit(&vol).unwrap();
        let img = rena.labels_img().unwrap();
        for ((i, j, k), &v) in img.indexed_iter() {
            if mask.data()[[i, j, k]] {
                assert!((1..=6).contains(&v));
            } else {
                assert_eq!(v, 0);
            }
        }
    }

    #[test]
    fn model_round_trip_preserves_transform() {
        let (vol, mask) = generate_fake_fmri([8, 8, 8], 4, 3);
        let mut rena = ReNA::new(5)
            .with_mask(Some(VolumeMasker::with_mask(mask)))
            .with_scaling(true);
        let reduced = rena.fit_transform(&vol).unwrap();

        let json = serde_json::to_string(&rena.to_model().unwrap()).unwrap();
        let model: ReNAModel = serde_json::from_str(&json).unwrap();
        let restored = ReNA::from_model(model).unwrap();

        assert!(restored.is_fitted());
        assert_eq!(restored.config(), rena.config());
        assert_eq!(restored.labels().unwrap(), rena.labels().unwrap());
        assert_eq!(restored.transform(&vol).unwrap(), reduced);
    }

    #[test]
    fn inconsistent_model_is_rejected() {
        let model = ReNAModel {
            config: ReNAConfig::default(),
            shape: [2, 1, 1],
            voxels: vec![[0, 0, 0], [1, 0, 0]],
            labels: vec![0, 0],
            sizes: vec![1, 1],
        };
        assert!(ReNA::from_model(model).is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: ReNAConfig = serde_json::from_str(r#"{ "n_clusters": 7 }"#).unwrap();
        assert_eq!(config.n_clusters, 7);
        assert_eq!(config.n_iter, 10);
        assert!(!config.scaling);
    }
}
