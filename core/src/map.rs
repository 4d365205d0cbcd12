//! Static vessel tree map.
//!
//! A [`VesselMap`] is an arena of vessel segments indexed `0..N` in insertion order. Each segment is a
//! sequence of centerline samples (position along the centerline, expected reference signal) with
//! monotonically non-decreasing positions starting at zero. Directed parent → child mappings between
//! segment indices encode the branching topology, which must form a tree (or a forest of trees): every
//! segment has at most one parent and no mapping may close a cycle.
//!
//! The map is built once, through repeated [`VesselMap::add_vessel`] and [`VesselMap::add_mapping`]
//! calls (or loaded from JSON, which goes through the same calls), and is read-only afterwards. The
//! filter stages share it behind an `Rc`.
use std::fs::File;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{NavError, Result};

/// One centerline sample of a vessel segment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CenterlineSample {
    /// Position along the segment centerline (map units, typically millimetres)
    pub centerline_position: f64,
    /// Expected sensor reading (impedance or normalized diameter) at this position
    pub reference_signal: f64,
}

/// On-disk representation of a map, matching the `{"vessels": ..., "mappings": ...}` JSON layout.
#[derive(Debug, Serialize, Deserialize)]
struct MapFile {
    vessels: Vec<Vec<CenterlineSample>>,
    #[serde(default)]
    mappings: Vec<[usize; 2]>,
}

/// Branching vessel tree with per-segment reference signals.
#[derive(Clone, Debug, Default)]
pub struct VesselMap {
    vessels: Vec<Vec<CenterlineSample>>,
    mappings: Vec<(usize, usize)>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
}
impl VesselMap {
    pub fn new() -> Self {
        Self::default()
    }
    /// Build a single-segment map from a reference signal sampled at positions `0, 1, 2, ...`.
    ///
    /// This is the non-branching case: a flat reference array becomes segment `0` with no mappings.
    pub fn linear(reference_values: &[f64]) -> Result<Self> {
        let mut map = VesselMap::new();
        map.add_vessel_from_reference_values(0, reference_values)?;
        Ok(map)
    }
    /// Append the next vessel segment.
    ///
    /// # Arguments
    /// * `index` - Index of the new segment; must equal the current number of segments.
    /// * `samples` - Centerline samples, starting at position `0` with non-decreasing positions.
    ///
    /// # Errors
    /// Returns [`NavError::InvalidMap`] if the segment is out of order, empty, does not start at zero,
    /// has decreasing positions, or contains non-finite values.
    pub fn add_vessel(&mut self, index: usize, samples: Vec<CenterlineSample>) -> Result<()> {
        if index < self.vessels.len() {
            return Err(NavError::InvalidMap(format!(
                "vessel with index {index} was already added"
            )));
        }
        if index != self.vessels.len() {
            return Err(NavError::InvalidMap(format!(
                "vessels must be added in ascending order; expected index {}, got {index}",
                self.vessels.len()
            )));
        }
        if samples.is_empty() {
            return Err(NavError::InvalidMap(format!(
                "vessel {index} has no centerline samples"
            )));
        }
        if samples
            .iter()
            .any(|s| !s.centerline_position.is_finite() || !s.reference_signal.is_finite())
        {
            return Err(NavError::InvalidMap(format!(
                "vessel {index} contains non-finite samples"
            )));
        }
        if samples[0].centerline_position != 0.0 {
            return Err(NavError::InvalidMap(format!(
                "vessel {index} must start at centerline position 0, starts at {}",
                samples[0].centerline_position
            )));
        }
        if samples
            .windows(2)
            .any(|w| w[1].centerline_position < w[0].centerline_position)
        {
            return Err(NavError::InvalidMap(format!(
                "centerline positions of vessel {index} must be monotonically non-decreasing"
            )));
        }
        debug!(
            "Adding vessel {} with {} samples, length {}",
            index,
            samples.len(),
            samples[samples.len() - 1].centerline_position
        );
        self.vessels.push(samples);
        self.parents.push(None);
        self.children.push(Vec::new());
        Ok(())
    }
    /// Append the next vessel segment from paired position and reference lists.
    pub fn add_vessel_with_positions(
        &mut self,
        index: usize,
        positions: &[f64],
        reference_values: &[f64],
    ) -> Result<()> {
        if positions.len() != reference_values.len() {
            return Err(NavError::InvalidMap(format!(
                "vessel {index}: {} positions but {} reference values",
                positions.len(),
                reference_values.len()
            )));
        }
        let samples = positions
            .iter()
            .zip(reference_values)
            .map(|(&centerline_position, &reference_signal)| CenterlineSample {
                centerline_position,
                reference_signal,
            })
            .collect();
        self.add_vessel(index, samples)
    }
    /// Append the next vessel segment from reference values sampled at positions `0, 1, 2, ...`.
    pub fn add_vessel_from_reference_values(
        &mut self,
        index: usize,
        reference_values: &[f64],
    ) -> Result<()> {
        let positions: Vec<f64> = (0..reference_values.len()).map(|i| i as f64).collect();
        self.add_vessel_with_positions(index, &positions, reference_values)
    }
    /// Add a directed parent → child mapping.
    ///
    /// # Errors
    /// Returns [`NavError::InvalidMap`] if either index is unknown, the child already has a parent,
    /// or the mapping would create a cycle.
    pub fn add_mapping(&mut self, parent: usize, child: usize) -> Result<()> {
        let count = self.vessels.len();
        if parent >= count || child >= count {
            return Err(NavError::InvalidMap(format!(
                "mapping [{parent}, {child}] references a vessel outside 0..{count}"
            )));
        }
        if parent == child {
            return Err(NavError::InvalidMap(format!(
                "vessel {parent} cannot be its own parent"
            )));
        }
        if let Some(existing) = self.parents[child] {
            return Err(NavError::InvalidMap(format!(
                "vessel {child} already has parent {existing}"
            )));
        }
        let mut ancestor = Some(parent);
        while let Some(a) = ancestor {
            if a == child {
                return Err(NavError::InvalidMap(format!(
                    "mapping [{parent}, {child}] would create a cycle"
                )));
            }
            ancestor = self.parents[a];
        }
        self.parents[child] = Some(parent);
        self.children[parent].push(child);
        self.mappings.push((parent, child));
        Ok(())
    }
    pub fn number_of_vessels(&self) -> usize {
        self.vessels.len()
    }
    pub fn is_empty(&self) -> bool {
        self.vessels.is_empty()
    }
    /// Parent → child mappings in insertion order.
    pub fn mappings(&self) -> &[(usize, usize)] {
        &self.mappings
    }
    /// Fail with [`NavError::InvalidBranch`] unless `branch` is a segment of this map.
    pub fn check_branch(&self, branch: usize) -> Result<()> {
        if branch < self.vessels.len() {
            Ok(())
        } else {
            Err(NavError::InvalidBranch {
                branch,
                vessel_count: self.vessels.len(),
            })
        }
    }
    /// Centerline samples of a segment.
    pub fn vessel(&self, branch: usize) -> Result<&[CenterlineSample]> {
        self.check_branch(branch)?;
        Ok(&self.vessels[branch])
    }
    /// Length of a segment: the position of its last centerline sample.
    pub fn segment_length(&self, branch: usize) -> Result<f64> {
        let vessel = self.vessel(branch)?;
        Ok(vessel[vessel.len() - 1].centerline_position)
    }
    /// Parent segment, or `None` for a root segment.
    pub fn predecessor(&self, branch: usize) -> Result<Option<usize>> {
        self.check_branch(branch)?;
        Ok(self.parents[branch])
    }
    /// Child segments in mapping insertion order; empty for a leaf.
    pub fn successors(&self, branch: usize) -> Result<&[usize]> {
        self.check_branch(branch)?;
        Ok(&self.children[branch])
    }
    /// Expected reference signal at a displacement along a segment.
    ///
    /// Displacements before the first or after the last sample clamp to the end values; anything in
    /// between is linearly interpolated from the two bracketing samples. A displacement that coincides
    /// with a sample returns that sample exactly.
    ///
    /// # Errors
    /// Fails on an unknown branch or a NaN displacement.
    pub fn reference_value(&self, branch: usize, displacement: f64) -> Result<f64> {
        let vessel = self.vessel(branch)?;
        if displacement.is_nan() {
            return Err(NavError::InvalidMeasurement(format!(
                "displacement on branch {branch} is NaN"
            )));
        }
        let first = vessel[0];
        let last = vessel[vessel.len() - 1];
        if displacement <= first.centerline_position {
            return Ok(first.reference_signal);
        }
        if displacement >= last.centerline_position {
            return Ok(last.reference_signal);
        }
        // First sample strictly beyond the displacement; 1..len by the clamps above.
        let upper = vessel.partition_point(|s| s.centerline_position <= displacement);
        let (a, b) = (vessel[upper - 1], vessel[upper]);
        if a.centerline_position == displacement {
            return Ok(a.reference_signal);
        }
        let span = b.centerline_position - a.centerline_position;
        let fraction = (displacement - a.centerline_position) / span;
        Ok(a.reference_signal + fraction * (b.reference_signal - a.reference_signal))
    }
    /// Centerline distance from the root of the tree to a displacement along `branch`.
    pub fn distance_from_root(&self, branch: usize, displacement: f64) -> Result<f64> {
        let mut distance = displacement;
        let mut current = branch;
        while let Some(parent) = self.predecessor(current)? {
            distance += self.segment_length(parent)?;
            current = parent;
        }
        Ok(distance)
    }
    /// Largest integer centerline index that lies on the segment.
    pub fn last_index(&self, branch: usize) -> Result<i64> {
        Ok(self.segment_length(branch)?.floor().max(0.0) as i64)
    }
    /// Sequence of segments visited when travelling from `from` to `to` along the tree.
    ///
    /// The path climbs from `from` to the lowest common ancestor and descends to `to`; both ends are
    /// included. Returns `Ok(None)` when the two segments lie in disconnected trees.
    pub fn branch_path(&self, from: usize, to: usize) -> Result<Option<Vec<usize>>> {
        self.check_branch(from)?;
        self.check_branch(to)?;
        let up = self.ancestors(from);
        let down = self.ancestors(to);
        let Some((down_index, common)) = down
            .iter()
            .enumerate()
            .find(|(_, branch)| up.contains(*branch))
        else {
            return Ok(None);
        };
        let mut path: Vec<usize> = up.iter().copied().take_while(|&b| b != *common).collect();
        path.push(*common);
        path.extend(down[..down_index].iter().rev());
        Ok(Some(path))
    }
    /// `branch` followed by its chain of parents up to the root.
    fn ancestors(&self, branch: usize) -> Vec<usize> {
        let mut chain = vec![branch];
        let mut current = self.parents[branch];
        while let Some(parent) = current {
            chain.push(parent);
            current = self.parents[parent];
        }
        chain
    }
    /// Write the map as pretty-printed JSON.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let map_file = MapFile {
            vessels: self.vessels.clone(),
            mappings: self.mappings.iter().map(|&(p, c)| [p, c]).collect(),
        };
        serde_json::to_writer_pretty(file, &map_file)
            .map_err(|e| NavError::Serialization(e.to_string()))
    }
    /// Read a map from JSON, validating every vessel and mapping as it is added.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let map_file: MapFile =
            serde_json::from_reader(file).map_err(|e| NavError::Serialization(e.to_string()))?;
        let mut map = VesselMap::new();
        for (index, samples) in map_file.vessels.into_iter().enumerate() {
            map.add_vessel(index, samples)?;
        }
        for [parent, child] in map_file.mappings {
            map.add_mapping(parent, child)?;
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// 0 → {1, 2}, 1 → {3}
    fn tree() -> VesselMap {
        let mut map = VesselMap::new();
        map.add_vessel_from_reference_values(0, &[1.0; 11]).unwrap();
        map.add_vessel_from_reference_values(1, &[2.0; 21]).unwrap();
        map.add_vessel_from_reference_values(2, &[3.0; 6]).unwrap();
        map.add_vessel_from_reference_values(3, &[4.0; 8]).unwrap();
        map.add_mapping(0, 1).unwrap();
        map.add_mapping(0, 2).unwrap();
        map.add_mapping(1, 3).unwrap();
        map
    }

    #[test]
    fn interpolates_between_samples() {
        let mut map = VesselMap::new();
        map.add_vessel_with_positions(0, &[0.0, 2.0, 4.0], &[0.0, 10.0, 6.0])
            .unwrap();
        assert_approx_eq!(map.reference_value(0, 1.0).unwrap(), 5.0, 1e-12);
        assert_approx_eq!(map.reference_value(0, 3.0).unwrap(), 8.0, 1e-12);
        assert_eq!(map.reference_value(0, 2.0).unwrap(), 10.0);
        assert_eq!(map.reference_value(0, 4.0).unwrap(), 6.0);
    }
    #[test]
    fn clamps_outside_sampled_range() {
        let mut map = VesselMap::new();
        map.add_vessel_with_positions(0, &[0.0, 1.0], &[3.0, 7.0])
            .unwrap();
        assert_eq!(map.reference_value(0, -5.0).unwrap(), 3.0);
        assert_eq!(map.reference_value(0, 50.0).unwrap(), 7.0);
    }
    #[test]
    fn equal_samples_interpolate_flat() {
        let map = VesselMap::linear(&[5.0, 5.0, 5.0]).unwrap();
        let mut x = 0.0;
        while x <= 2.0 {
            assert_eq!(map.reference_value(0, x).unwrap(), 5.0);
            x += 0.1;
        }
    }
    #[test]
    fn duplicate_positions_are_allowed() {
        let mut map = VesselMap::new();
        map.add_vessel_with_positions(0, &[0.0, 1.0, 1.0, 2.0], &[0.0, 1.0, 3.0, 3.0])
            .unwrap();
        assert_eq!(map.reference_value(0, 1.0).unwrap(), 3.0);
        assert_approx_eq!(map.reference_value(0, 0.5).unwrap(), 0.5, 1e-12);
    }
    #[test]
    fn unknown_branch_is_an_error() {
        let map = tree();
        assert!(matches!(
            map.reference_value(7, 0.0),
            Err(NavError::InvalidBranch {
                branch: 7,
                vessel_count: 4
            })
        ));
        assert!(map.successors(4).is_err());
        assert!(map.segment_length(9).is_err());
    }
    #[test]
    fn nan_displacement_is_an_error() {
        let map = tree();
        assert!(matches!(
            map.reference_value(1, f64::NAN),
            Err(NavError::InvalidMeasurement(_))
        ));
        assert_eq!(map.reference_value(1, f64::INFINITY).unwrap(), 2.0);
    }
    #[test]
    fn rejects_out_of_order_vessels() {
        let mut map = VesselMap::new();
        assert!(map.add_vessel_from_reference_values(1, &[1.0]).is_err());
        map.add_vessel_from_reference_values(0, &[1.0]).unwrap();
        assert!(map.add_vessel_from_reference_values(0, &[1.0]).is_err());
        assert!(map.add_vessel_from_reference_values(1, &[]).is_err());
    }
    #[test]
    fn rejects_bad_samples() {
        let mut map = VesselMap::new();
        assert!(
            map.add_vessel_with_positions(0, &[0.0, 2.0, 1.0], &[1.0, 1.0, 1.0])
                .is_err()
        );
        assert!(map.add_vessel_with_positions(0, &[1.0, 2.0], &[1.0, 1.0]).is_err());
        assert!(map.add_vessel_with_positions(0, &[0.0, 1.0], &[1.0]).is_err());
        assert!(
            map.add_vessel_with_positions(0, &[0.0, 1.0], &[1.0, f64::NAN])
                .is_err()
        );
    }
    #[test]
    fn rejects_malformed_mappings() {
        let mut map = tree();
        assert!(map.add_mapping(2, 1).is_err()); // 1 already has a parent
        assert!(map.add_mapping(3, 0).is_err()); // cycle through the root
        assert!(map.add_mapping(0, 9).is_err());
        assert!(map.add_mapping(2, 2).is_err());
    }
    #[test]
    fn adjacency_queries() {
        let map = tree();
        assert_eq!(map.predecessor(0).unwrap(), None);
        assert_eq!(map.predecessor(3).unwrap(), Some(1));
        assert_eq!(map.successors(0).unwrap(), &[1, 2]);
        assert!(map.successors(2).unwrap().is_empty());
        assert_eq!(map.segment_length(1).unwrap(), 20.0);
        assert_eq!(map.last_index(3).unwrap(), 7);
    }
    #[test]
    fn distance_from_root_adds_ancestor_lengths() {
        let map = tree();
        assert_eq!(map.distance_from_root(0, 4.0).unwrap(), 4.0);
        assert_eq!(map.distance_from_root(2, 1.5).unwrap(), 11.5);
        assert_eq!(map.distance_from_root(3, 2.0).unwrap(), 32.0);
        assert!(map.distance_from_root(4, 0.0).is_err());
    }
    #[test]
    fn branch_paths_go_through_common_ancestor() {
        let map = tree();
        assert_eq!(map.branch_path(3, 2).unwrap(), Some(vec![3, 1, 0, 2]));
        assert_eq!(map.branch_path(0, 3).unwrap(), Some(vec![0, 1, 3]));
        assert_eq!(map.branch_path(3, 0).unwrap(), Some(vec![3, 1, 0]));
        assert_eq!(map.branch_path(2, 2).unwrap(), Some(vec![2]));
    }
    #[test]
    fn disconnected_segments_have_no_path() {
        let mut map = VesselMap::new();
        map.add_vessel_from_reference_values(0, &[1.0; 3]).unwrap();
        map.add_vessel_from_reference_values(1, &[1.0; 3]).unwrap();
        assert_eq!(map.branch_path(0, 1).unwrap(), None);
    }
    #[test]
    fn json_round_trip_revalidates() {
        let map = tree();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        map.to_json(&path).unwrap();
        let loaded = VesselMap::from_json(&path).unwrap();
        assert_eq!(loaded.number_of_vessels(), 4);
        assert_eq!(loaded.mappings(), map.mappings());
        assert_eq!(loaded.reference_value(3, 2.0).unwrap(), 4.0);

        let bad = dir.path().join("bad.json");
        std::fs::write(
            &bad,
            r#"{"vessels": [[{"centerline_position": 0.0, "reference_signal": 1.0}]], "mappings": [[0, 3]]}"#,
        )
        .unwrap();
        assert!(matches!(
            VesselMap::from_json(&bad),
            Err(NavError::InvalidMap(_))
        ));
    }
}
