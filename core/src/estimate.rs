//! Density clustering of the particle cloud into reportable position estimates.
//!
//! Particles are grouped by branch and each group is clustered along the centerline with a
//! one-dimensional DBSCAN. The largest cluster on the most populated branch is the primary
//! estimate; the largest remaining cluster anywhere on the map is the runner-up. Clustering is a
//! pure read of the population and is deterministic for fixed positions.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::particle::Particle;
use crate::signal::{mean, standard_error};

/// A group of spatially close particles on one branch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub branch: usize,
    /// Mean displacement of the members
    pub center: f64,
    /// Standard error of the mean displacement; zero for single-member clusters
    pub error: f64,
    pub number_of_particles: usize,
}
impl Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "branch {} at {:.3} ± {:.3} ({} particles)",
            self.branch, self.center, self.error, self.number_of_particles
        )
    }
}

/// Per-step summary of the particle cloud.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterPositionEstimate {
    pub first_cluster: Option<Cluster>,
    pub second_cluster: Option<Cluster>,
    /// Number of clusters over all branches, noise excluded
    pub number_of_clusters: usize,
    /// Particles not assigned to any cluster
    pub number_of_noise: usize,
    /// Branch holding the most particles
    pub dominant_branch: Option<usize>,
}
impl Display for ClusterPositionEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let describe = |c: &Option<Cluster>| match c {
            Some(cluster) => cluster.to_string(),
            None => "none".to_string(),
        };
        write!(
            f,
            "first: [{}], second: [{}], clusters: {}, noise: {}",
            describe(&self.first_cluster),
            describe(&self.second_cluster),
            self.number_of_clusters,
            self.number_of_noise
        )
    }
}

/// Label each value with a cluster id, or `None` for noise.
///
/// A point is a core point when at least `min_samples` values (itself included) lie within `eps`
/// (inclusive). Clusters grow from core points in ascending value order, so the labelling only
/// depends on the values, never on their order or on randomness.
pub fn dbscan_1d(values: &[f64], eps: f64, min_samples: usize) -> Vec<Option<usize>> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));
    let sorted: Vec<f64> = order.iter().map(|&i| values[i]).collect();
    let neighbourhood: Vec<(usize, usize)> = sorted
        .iter()
        .map(|&x| {
            let lo = sorted.partition_point(|&v| v < x - eps);
            let hi = sorted.partition_point(|&v| v <= x + eps);
            (lo, hi)
        })
        .collect();
    let core: Vec<bool> = neighbourhood
        .iter()
        .map(|&(lo, hi)| hi - lo >= min_samples)
        .collect();

    let mut sorted_labels: Vec<Option<usize>> = vec![None; n];
    let mut next_label = 0;
    for start in 0..n {
        if sorted_labels[start].is_some() || !core[start] {
            continue;
        }
        let label = next_label;
        next_label += 1;
        sorted_labels[start] = Some(label);
        let mut frontier = vec![start];
        while let Some(j) = frontier.pop() {
            let (lo, hi) = neighbourhood[j];
            for k in lo..hi {
                if sorted_labels[k].is_none() {
                    sorted_labels[k] = Some(label);
                    if core[k] {
                        frontier.push(k);
                    }
                }
            }
        }
    }
    let mut labels = vec![None; n];
    for (position, &original) in order.iter().enumerate() {
        labels[original] = sorted_labels[position];
    }
    labels
}

/// Clusters particle positions per branch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionEstimator {
    /// Neighbourhood radius along the centerline
    pub eps: f64,
    /// Minimum neighbourhood size of a core point, the point itself included
    pub min_samples: usize,
}
impl Default for PositionEstimator {
    fn default() -> Self {
        PositionEstimator {
            eps: 3.0,
            min_samples: 2,
        }
    }
}
impl PositionEstimator {
    pub fn new(eps: f64, min_samples: usize) -> Self {
        PositionEstimator { eps, min_samples }
    }
    /// Every cluster on every branch, plus the number of noise particles.
    pub fn clusters(&self, particles: &[Particle]) -> (Vec<Cluster>, usize) {
        let mut by_branch: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        for particle in particles {
            by_branch
                .entry(particle.position.branch)
                .or_default()
                .push(particle.position.displacement);
        }
        let mut clusters = Vec::new();
        let mut noise = 0;
        for (branch, displacements) in by_branch {
            let labels = dbscan_1d(&displacements, self.eps, self.min_samples);
            let count = labels.iter().flatten().max().map_or(0, |m| m + 1);
            let mut members: Vec<Vec<f64>> = vec![Vec::new(); count];
            for (label, displacement) in labels.iter().zip(&displacements) {
                match label {
                    Some(l) => members[*l].push(*displacement),
                    None => noise += 1,
                }
            }
            for group in members {
                clusters.push(Cluster {
                    branch,
                    center: mean(&group).unwrap_or(0.0),
                    error: standard_error(&group).unwrap_or(0.0),
                    number_of_particles: group.len(),
                });
            }
        }
        (clusters, noise)
    }
    /// Summarize a population into its two dominant clusters.
    pub fn estimate(&self, particles: &[Particle]) -> ClusterPositionEstimate {
        let mut population: BTreeMap<usize, usize> = BTreeMap::new();
        for particle in particles {
            *population.entry(particle.position.branch).or_default() += 1;
        }
        // ties resolve to the lowest branch index
        let dominant_branch = population
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&branch, _)| branch);

        let (mut clusters, number_of_noise) = self.clusters(particles);
        let number_of_clusters = clusters.len();
        clusters.sort_by(rank);
        let first_index = clusters
            .iter()
            .position(|c| Some(c.branch) == dominant_branch);
        let first_cluster = first_index.map(|i| clusters.remove(i));
        let second_cluster = clusters.first().copied();
        ClusterPositionEstimate {
            first_cluster,
            second_cluster,
            number_of_clusters,
            number_of_noise,
            dominant_branch,
        }
    }
}

/// Larger clusters first, then lower branch, then smaller center.
fn rank(a: &Cluster, b: &Cluster) -> Ordering {
    b.number_of_particles
        .cmp(&a.number_of_particles)
        .then(a.branch.cmp(&b.branch))
        .then(a.center.total_cmp(&b.center))
}
