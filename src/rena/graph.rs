use ndarray::{ArrayView1, Array3};

use crate::data::model::{Mask3D, SampleMatrix};
use crate::error::{RenaError, Result};

// ---------------------------------------------------------------------------
// WeightedGraph – symmetric sparse adjacency
// ---------------------------------------------------------------------------

/// Undirected weighted graph over `0..n_vertices`.
///
/// Every edge is stored in both endpoint lists; lists are sorted by
/// neighbour id and hold no self loops or duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedGraph {
    adjacency: Vec<Vec<(usize, f64)>>,
}

impl WeightedGraph {
    /// Build from undirected edges. Self loops are dropped; for repeated
    /// pairs the last weight wins.
    pub fn from_edges<I>(n_vertices: usize, edges: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_vertices];
        for (a, b, w) in edges {
            if a == b {
                continue;
            }
            adjacency[a].push((b, w));
            adjacency[b].push((a, w));
        }
        for list in &mut adjacency {
            // Stable sort keeps insertion order among duplicates, so after
            // reversing the last inserted one survives `dedup_by_key`.
            list.sort_by_key(|&(n, _)| n);
            list.reverse();
            list.dedup_by_key(|&mut (n, _)| n);
            list.reverse();
        }
        WeightedGraph { adjacency }
    }

    pub fn n_vertices(&self) -> usize {
        self.adjacency.len()
    }

    /// Number of undirected edges.
    pub fn n_edges(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }

    pub fn neighbors(&self, v: usize) -> &[(usize, f64)] {
        &self.adjacency[v]
    }

    /// Each undirected edge once, as `(i, j, w)` with `i < j`, ascending.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.adjacency.iter().enumerate().flat_map(|(i, list)| {
            list.iter()
                .filter(move |&&(j, _)| i < j)
                .map(move |&(j, w)| (i, j, w))
        })
    }
}

pub(crate) fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

// ---------------------------------------------------------------------------
// Voxel lattice
// ---------------------------------------------------------------------------

/// 6-connectivity graph over the masked voxels.
///
/// Vertex `c` is column `c` of `data`, i.e. the c-th masked voxel in C-order.
/// Each edge links two face-adjacent masked voxels and carries the squared
/// Euclidean distance between their columns, floored at `threshold`. Edges
/// whose distance is not finite are left out.
pub fn weighted_connectivity_graph(
    data: &SampleMatrix,
    mask: &Mask3D,
    threshold: f64,
) -> Result<WeightedGraph> {
    let n_features = mask.count();
    if data.ncols() != n_features {
        return Err(RenaError::ShapeMismatch {
            expected: vec![data.nrows(), n_features],
            actual: data.shape().to_vec(),
        });
    }

    let [nx, ny, nz] = mask.shape();
    let mut column: Array3<Option<usize>> = Array3::from_elem((nx, ny, nz), None);
    for (c, [i, j, k]) in mask.voxel_coords().into_iter().enumerate() {
        column[[i, j, k]] = Some(c);
    }

    let mut edges = Vec::new();
    for ((i, j, k), &a) in column.indexed_iter() {
        let Some(a) = a else {
            continue;
        };
        // deep (z), right (y), down (x)
        let forward = [
            (k + 1 < nz).then(|| [i, j, k + 1]),
            (j + 1 < ny).then(|| [i, j + 1, k]),
            (i + 1 < nx).then(|| [i + 1, j, k]),
        ];
        for idx in forward.into_iter().flatten() {
            let Some(b) = column[idx] else {
                continue;
            };
            let d = squared_distance(data.column(a), data.column(b));
            if d.is_finite() {
                edges.push((a, b, d.max(threshold)));
            }
        }
    }

    let graph = WeightedGraph::from_edges(n_features, edges);
    log::debug!(
        "connectivity graph: {} vertices, {} edges",
        graph.n_vertices(),
        graph.n_edges()
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn from_edges_is_symmetric_and_deduplicated() {
        let g = WeightedGraph::from_edges(3, vec![(0, 1, 1.0), (1, 0, 2.0), (2, 2, 5.0)]);
        assert_eq!(g.neighbors(0), &[(1, 2.0)]);
        assert_eq!(g.neighbors(1), &[(0, 2.0)]);
        assert!(g.neighbors(2).is_empty());
        assert_eq!(g.n_edges(), 1);
        assert_eq!(g.edges().collect::<Vec<_>>(), vec![(0, 1, 2.0)]);
    }

    #[test]
    fn full_lattice_edge_count() {
        let mask = Mask3D::full([3, 4, 5]);
        let data = Array2::from_shape_fn((2, 60), |(t, c)| (t * 60 + c) as f64);
        let g = weighted_connectivity_graph(&data, &mask, 1e-7).unwrap();
        // (nx-1)*ny*nz + nx*(ny-1)*nz + nx*ny*(nz-1)
        assert_eq!(g.n_edges(), 2 * 4 * 5 + 3 * 3 * 5 + 3 * 4 * 4);
    }

    #[test]
    fn weights_are_squared_distances_with_floor() {
        let mask = Mask3D::full([1, 1, 3]);
        let data = array![[0.0, 1.0, 1.0], [0.0, 2.0, 2.0]];
        let g = weighted_connectivity_graph(&data, &mask, 1e-7).unwrap();
        let edges: Vec<_> = g.edges().collect();
        assert_eq!(edges, vec![(0, 1, 5.0), (1, 2, 1e-7)]);
    }

    #[test]
    fn unmasked_voxels_break_the_lattice() {
        let mut m = Array3::from_elem((1, 1, 3), true);
        m[[0, 0, 1]] = false;
        let mask = Mask3D::new(m);
        let data = array![[0.0, 1.0]];
        let g = weighted_connectivity_graph(&data, &mask, 1e-7).unwrap();
        assert_eq!(g.n_edges(), 0);
    }

    #[test]
    fn column_count_must_match_mask() {
        let mask = Mask3D::full([2, 2, 2]);
        let data: SampleMatrix = Array2::zeros((3, 7));
        assert!(weighted_connectivity_graph(&data, &mask, 1e-7).is_err());
    }
}
