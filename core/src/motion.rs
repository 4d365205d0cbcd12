//! Displacement-driven motion propagation over the vessel tree.
use std::rc::Rc;

use log::debug;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand_distr::{Distribution, Normal};

use crate::map::VesselMap;
use crate::particle::{Particle, Position};
use crate::signal::{RollingWindow, standard_error};
use crate::{NavError, Result};

/// Noise scale used until two displacement readings have been seen.
pub const DEFAULT_MOTION_NOISE: f64 = 0.3;

/// Advances particles by the shared displacement reading scaled by each particle's alpha.
///
/// The Gaussian noise scale is the standard error of the most recent displacement readings, so the
/// cloud spreads more while the catheter is moved erratically. Leaving a segment walks the tree:
/// backwards through parents (clamping at a root) and forwards through uniformly chosen children
/// (stopping at the end of a leaf).
#[derive(Clone, Debug)]
pub struct MotionModel {
    map: Rc<VesselMap>,
    displacement_history: RollingWindow,
    default_noise: f64,
}
impl MotionModel {
    pub fn new(map: Rc<VesselMap>, history_length: usize, default_noise: f64) -> Self {
        MotionModel {
            map,
            displacement_history: RollingWindow::new(history_length),
            default_noise,
        }
    }
    /// Current noise scale derived from the displacement history.
    pub fn noise_scale(&self) -> f64 {
        standard_error(&self.displacement_history.to_vec())
            .filter(|sem| sem.is_finite())
            .unwrap_or(self.default_noise)
    }
    pub fn displacement_history(&self) -> &RollingWindow {
        &self.displacement_history
    }
    /// Move every particle in place.
    ///
    /// Branch changes are decided on the noise-free estimate. The noise is added afterwards and the
    /// result clamped to the destination segment, so noise alone never carries a particle past a
    /// branch point and particles pile up slightly at segment ends.
    ///
    /// # Arguments
    /// * `particles` - Population to move; positions, not weights, are updated.
    /// * `displacement` - Raw displacement reading for this step.
    /// * `rng` - The filter's random source (noise and branch choices).
    ///
    /// # Errors
    /// Fails if a particle references a branch that is not in the map.
    pub fn move_particles(
        &mut self,
        particles: &mut [Particle],
        displacement: f64,
        rng: &mut StdRng,
    ) -> Result<()> {
        self.displacement_history.push(displacement);
        let noise = self.noise_scale();
        debug!("Moving {} particles by {displacement} (noise {noise})", particles.len());
        for particle in particles.iter_mut() {
            let estimate = particle.position.displacement + displacement * particle.alpha;
            let target = self.resolve(particle.position.branch, estimate, rng)?;
            let perturbed = Normal::new(target.displacement, noise)
                .map_err(|e| NavError::Configuration(format!("invalid motion noise: {e}")))?
                .sample(rng);
            let length = self.map.segment_length(target.branch)?;
            particle.position = Position::new(target.branch, perturbed.clamp(0.0, length));
        }
        Ok(())
    }
    /// Walk the tree from `branch` until `estimate` falls inside a segment.
    fn resolve(&self, branch: usize, estimate: f64, rng: &mut StdRng) -> Result<Position> {
        let mut branch = branch;
        let mut remaining = estimate;
        let mut length = self.map.segment_length(branch)?;
        while remaining < 0.0 {
            match self.map.predecessor(branch)? {
                Some(parent) => {
                    branch = parent;
                    length = self.map.segment_length(branch)?;
                    remaining += length;
                }
                None => remaining = 0.0,
            }
        }
        while remaining > length {
            match self.map.successors(branch)?.choose(rng) {
                Some(&child) => {
                    remaining -= length;
                    branch = child;
                    length = self.map.segment_length(branch)?;
                }
                None => remaining = length,
            }
        }
        Ok(Position::new(branch, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    /// 0 (length 100) → {1 (length 40), 2 (length 60)}
    fn fork() -> Rc<VesselMap> {
        let mut map = VesselMap::new();
        map.add_vessel_from_reference_values(0, &[1.0; 101]).unwrap();
        map.add_vessel_from_reference_values(1, &[2.0; 41]).unwrap();
        map.add_vessel_from_reference_values(2, &[3.0; 61]).unwrap();
        map.add_mapping(0, 1).unwrap();
        map.add_mapping(0, 2).unwrap();
        Rc::new(map)
    }
    fn particle(branch: usize, displacement: f64) -> Particle {
        Particle::new(Position::new(branch, displacement), 1.0, 1.0, 10)
    }

    #[test]
    fn default_noise_until_two_readings() {
        let mut model = MotionModel::new(fork(), 10, DEFAULT_MOTION_NOISE);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(model.noise_scale(), DEFAULT_MOTION_NOISE);
        model.move_particles(&mut [], 1.0, &mut rng).unwrap();
        assert_eq!(model.noise_scale(), DEFAULT_MOTION_NOISE);
        model.move_particles(&mut [], 3.0, &mut rng).unwrap();
        // s = sqrt(2), n = 2
        assert_approx_eq!(model.noise_scale(), 1.0, 1e-12);
    }
    #[test]
    fn history_is_bounded() {
        let mut model = MotionModel::new(fork(), 3, DEFAULT_MOTION_NOISE);
        let mut rng = StdRng::seed_from_u64(1);
        for d in 0..10 {
            model.move_particles(&mut [], d as f64, &mut rng).unwrap();
        }
        assert_eq!(model.displacement_history().to_vec(), vec![7.0, 8.0, 9.0]);
    }
    #[test]
    fn moves_within_segment() {
        let mut model = MotionModel::new(fork(), 10, DEFAULT_MOTION_NOISE);
        let mut rng = StdRng::seed_from_u64(4);
        let mut particles = vec![particle(0, 20.0)];
        particles[0].alpha = 0.5;
        model.move_particles(&mut particles, 10.0, &mut rng).unwrap();
        assert_eq!(particles[0].branch(), 0);
        assert_approx_eq!(particles[0].displacement(), 25.0, 2.0);
    }
    #[test]
    fn forward_crossing_lands_on_a_child() {
        let mut model = MotionModel::new(fork(), 10, DEFAULT_MOTION_NOISE);
        let mut rng = StdRng::seed_from_u64(8);
        let mut particles: Vec<Particle> = (0..200).map(|_| particle(0, 99.9)).collect();
        model.move_particles(&mut particles, 20.1, &mut rng).unwrap();
        let mut seen = [false; 3];
        for p in &particles {
            assert!(p.branch() == 1 || p.branch() == 2);
            // 99.9 + 20.1 - 100 consumed on the parent
            assert_approx_eq!(p.displacement(), 20.0, 2.0);
            seen[p.branch()] = true;
        }
        assert!(seen[1] && seen[2]);
    }
    #[test]
    fn noise_alone_does_not_cross_a_branch_point() {
        let mut model = MotionModel::new(fork(), 10, DEFAULT_MOTION_NOISE);
        let mut rng = StdRng::seed_from_u64(12);
        let mut particles: Vec<Particle> = (0..200).map(|_| particle(0, 99.9)).collect();
        model.move_particles(&mut particles, 0.0, &mut rng).unwrap();
        assert!(particles.iter().all(|p| p.branch() == 0 && p.displacement() <= 100.0));
        assert!(particles.iter().any(|p| p.displacement() == 100.0));
    }
    #[test]
    fn backward_crossing_returns_to_parent() {
        let mut model = MotionModel::new(fork(), 10, DEFAULT_MOTION_NOISE);
        let mut rng = StdRng::seed_from_u64(2);
        let mut particles = vec![particle(2, 5.0)];
        model.move_particles(&mut particles, -15.0, &mut rng).unwrap();
        assert_eq!(particles[0].branch(), 0);
        assert_approx_eq!(particles[0].displacement(), 90.0, 2.0);
    }
    #[test]
    fn clamps_at_root_and_leaf() {
        let mut model = MotionModel::new(fork(), 10, DEFAULT_MOTION_NOISE);
        let mut rng = StdRng::seed_from_u64(6);
        let mut particles = vec![particle(0, 5.0), particle(1, 30.0)];
        model.move_particles(&mut particles, -500.0, &mut rng).unwrap();
        assert_eq!(particles[0].branch(), 0);
        assert_eq!(particles[1].branch(), 0);
        for p in &particles {
            assert!(p.displacement() >= 0.0 && p.displacement() <= 100.0);
        }
        let mut leaf = vec![particle(1, 30.0)];
        model.move_particles(&mut leaf, 500.0, &mut rng).unwrap();
        assert_eq!(leaf[0].branch(), 1);
        assert!(leaf[0].displacement() <= 40.0);
    }
    #[test]
    fn unknown_branch_is_fatal() {
        let mut model = MotionModel::new(fork(), 10, DEFAULT_MOTION_NOISE);
        let mut rng = StdRng::seed_from_u64(6);
        let mut particles = vec![particle(5, 1.0)];
        assert!(matches!(
            model.move_particles(&mut particles, 1.0, &mut rng),
            Err(NavError::InvalidBranch { branch: 5, .. })
        ));
    }
}
