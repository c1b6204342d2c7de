use ndarray::Array2;

use super::graph::{WeightedGraph, squared_distance, weighted_connectivity_graph};
use crate::data::model::{Mask3D, SampleMatrix};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Union-find over graph vertices
// ---------------------------------------------------------------------------

struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        DisjointSets {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Returns false if `a` and `b` were already joined.
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }

    /// Compact labels `0..n_sets`, numbered by first vertex of each set.
    fn labels(&mut self) -> (usize, Vec<usize>) {
        let n = self.parent.len();
        let mut root_label = vec![usize::MAX; n];
        let mut labels = Vec::with_capacity(n);
        let mut next = 0;
        for v in 0..n {
            let r = self.find(v);
            if root_label[r] == usize::MAX {
                root_label[r] = next;
                next += 1;
            }
            labels.push(root_label[r]);
        }
        (next, labels)
    }
}

// ---------------------------------------------------------------------------
// One agglomeration step
// ---------------------------------------------------------------------------

/// Edges joining each vertex to its nearest neighbour(s).
///
/// Neighbour `j` of `i` is kept when `w(i, j) * (1 - threshold) <= w_min(i)`,
/// so near-ties are all kept. With a zero threshold only exact ties survive,
/// zero weights included. Edges are returned once, as `(i, j)` with `i < j`,
/// sorted ascending.
pub fn nearest_neighbor_edges(graph: &WeightedGraph, threshold: f64) -> Vec<(usize, usize)> {
    let mut edges = Vec::new();
    for i in 0..graph.n_vertices() {
        let neighbors = graph.neighbors(i);
        let w_min = neighbors
            .iter()
            .map(|&(_, w)| w)
            .fold(f64::INFINITY, f64::min);
        if !w_min.is_finite() {
            continue;
        }
        for &(j, w) in neighbors {
            if threshold >= 1.0 || w * (1.0 - threshold) <= w_min {
                edges.push((i.min(j), i.max(j)));
            }
        }
    }
    edges.sort_unstable();
    edges.dedup();
    edges
}

/// Group every vertex with its nearest neighbours and collapse the groups.
///
/// The groups are the connected components of the nearest-neighbour graph.
/// Edges are merged in ascending `(i, j)` order and merging stops as soon as
/// `n_clusters` groups remain, so a step never undershoots the target.
///
/// Returns the reduced graph, the reduced data and the label of every input
/// vertex.
pub fn nearest_neighbor_grouping(
    data: &SampleMatrix,
    graph: &WeightedGraph,
    n_clusters: usize,
    threshold: f64,
) -> (WeightedGraph, SampleMatrix, Vec<usize>) {
    let n = graph.n_vertices();
    let mut sets = DisjointSets::new(n);
    let mut n_groups = n;
    for (i, j) in nearest_neighbor_edges(graph, threshold) {
        if n_groups <= n_clusters {
            break;
        }
        if sets.union(i, j) {
            n_groups -= 1;
        }
    }
    let (n_labels, labels) = sets.labels();
    let (reduced_graph, reduced_data) =
        reduce_data_and_connectivity(&labels, n_labels, graph, data, threshold);
    (reduced_graph, reduced_data, labels)
}

/// Average the data per label and rebuild the graph between labels.
///
/// Two labels are connected when any of their members were; the new weight
/// is the squared distance between the averaged columns, floored at
/// `threshold`.
pub fn reduce_data_and_connectivity(
    labels: &[usize],
    n_labels: usize,
    graph: &WeightedGraph,
    data: &SampleMatrix,
    threshold: f64,
) -> (WeightedGraph, SampleMatrix) {
    let reduced_data = average_columns(data, labels, n_labels);

    let mut pairs: Vec<(usize, usize)> = graph
        .edges()
        .map(|(i, j, _)| (labels[i], labels[j]))
        .filter(|(a, b)| a != b)
        .map(|(a, b)| (a.min(b), a.max(b)))
        .collect();
    pairs.sort_unstable();
    pairs.dedup();

    let edges = pairs.into_iter().map(|(a, b)| {
        let d = squared_distance(reduced_data.column(a), reduced_data.column(b));
        (a, b, d.max(threshold))
    });
    let reduced_graph = WeightedGraph::from_edges(n_labels, edges);
    (reduced_graph, reduced_data)
}

/// Column-wise mean per label: `(n_samples, n_labels)`.
pub(crate) fn average_columns(data: &SampleMatrix, labels: &[usize], n_labels: usize) -> SampleMatrix {
    let mut sums = Array2::zeros((data.nrows(), n_labels));
    let mut counts = vec![0usize; n_labels];
    for (col, &label) in labels.iter().enumerate() {
        let mut target = sums.column_mut(label);
        target += &data.column(col);
        counts[label] += 1;
    }
    for (label, &count) in counts.iter().enumerate() {
        if count > 0 {
            sums.column_mut(label).mapv_inplace(|v| v / count as f64);
        }
    }
    sums
}

// ---------------------------------------------------------------------------
// Recursive driver
// ---------------------------------------------------------------------------

/// Recursive Nearest Agglomeration over the masked voxels of `data`.
///
/// Repeats [`nearest_neighbor_grouping`] on the reduced graph until at most
/// `n_clusters` labels remain, `n_iter` steps have run, or a step merges
/// nothing. Returns the number of labels and one label per column of `data`.
pub fn recursive_neighbor_agglomeration(
    data: &SampleMatrix,
    mask: &Mask3D,
    n_clusters: usize,
    n_iter: usize,
    threshold: f64,
) -> Result<(usize, Vec<usize>)> {
    let mut graph = weighted_connectivity_graph(data, mask, threshold)?;
    let mut reduced = data.clone();
    let mut labels: Vec<usize> = (0..graph.n_vertices()).collect();
    let mut n_labels = graph.n_vertices();

    for iteration in 0..n_iter {
        if n_labels <= n_clusters {
            break;
        }
        let (next_graph, next_data, step_labels) =
            nearest_neighbor_grouping(&reduced, &graph, n_clusters, threshold);
        let merged = next_graph.n_vertices();

        for label in labels.iter_mut() {
            *label = step_labels[*label];
        }
        log::debug!("ReNA iteration {iteration}: {n_labels} -> {merged} clusters");

        let stalled = merged == n_labels;
        graph = next_graph;
        reduced = next_data;
        n_labels = merged;
        if stalled {
            log::debug!("ReNA stopped early: no nearest-neighbour merge possible");
            break;
        }
    }

    Ok((n_labels, labels))
}
