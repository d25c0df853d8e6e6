//! Seeded machine generator.
//!
//! Produces partially-populated machines reproducibly: the same seed always
//! knocks out the same cores. Node (0, 0) is never degraded so the anchor
//! cell always exists.

use heatmesh_env::{Machine, NodeCoord};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Generates machines with randomly degraded nodes.
pub struct MachineGenerator {
    rng: ChaCha8Rng,
}

impl MachineGenerator {
    pub fn new(seed: u64) -> Self {
        // Salted so machine shapes don't correlate with other seeded streams
        let seed = seed.wrapping_mul(0x9e3779b97f4a7c15);
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// A `width x height` machine where each node other than the origin is
    /// degraded with probability `degraded_fraction` to between 1 and
    /// `cores_per_node - 1` working cores.
    pub fn generate(&mut self, width: u16, height: u16, cores_per_node: u8, degraded_fraction: f64) -> Machine {
        let mut machine = Machine::new(width, height, cores_per_node);
        let fraction = degraded_fraction.clamp(0.0, 1.0);
        let nodes: Vec<NodeCoord> = machine.nodes().collect();

        for node in nodes {
            if node == NodeCoord::ORIGIN || cores_per_node <= 1 {
                continue;
            }
            if self.rng.gen_bool(fraction) {
                let cores = self.rng.gen_range(1..cores_per_node);
                machine.set_cores(node, cores);
            }
        }
        machine
    }
}
