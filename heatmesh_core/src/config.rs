//! Config Serializer - per-core configuration blocks.
//!
//! Layout (seven little-endian 32-bit words):
//!
//! | word | field                                            |
//! |------|--------------------------------------------------|
//! | 0    | observation count (non-zero on one core per node)|
//! | 1    | diffusivity, s15.16                              |
//! | 2    | own broadcast key                                |
//! | 3-6  | neighbour keys: East, West, North, South         |

use crate::fixed::Fix16;
use crate::keys::NetKeys;
use crate::nets::NetList;
use crate::topology::{CellCoord, Direction, Topology};
use heatmesh_env::CoreLocation;

/// Decoded configuration of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellConfig {
    /// Number of cells the node's reporting core aggregates; zero elsewhere
    pub observation_count: u32,
    pub alpha: Fix16,
    pub own_key: u32,
    pub neighbour_keys: [u32; 4],
}

impl CellConfig {
    pub const WORDS: usize = 3 + 4;
    pub const SIZE: usize = Self::WORDS * 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.observation_count,
            self.alpha.to_bits(),
            self.own_key,
            self.neighbour_keys[0],
            self.neighbour_keys[1],
            self.neighbour_keys[2],
            self.neighbour_keys[3],
        ];
        let mut bytes = [0u8; Self::SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut words = [0u32; Self::WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(Self {
            observation_count: words[0],
            alpha: Fix16::from_bits(words[1]),
            own_key: words[2],
            neighbour_keys: [words[3], words[4], words[5], words[6]],
        })
    }

    pub fn neighbour_key(&self, dir: Direction) -> u32 {
        self.neighbour_keys[dir.index()]
    }
}

/// A serialized config bound for one core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub location: CoreLocation,
    pub cell: CellCoord,
    pub config: CellConfig,
}

/// Builds the config of every cell.
///
/// Output is grouped by node and ordered by ascending core within each
/// node; the loader must write them in this order.
pub fn serialize_configs(
    topology: &Topology,
    nets: &NetList,
    keys: &NetKeys,
    alpha: f64,
) -> Vec<CoreConfig> {
    let alpha = Fix16::from_f64(alpha);
    let mut out = Vec::with_capacity(topology.len());

    for (_, coords) in topology.nodes() {
        for (i, coord) in coords.iter().enumerate() {
            let Some(cell) = topology.cell(*coord) else {
                continue;
            };
            let (Some(own), Some(neighbours)) = (nets.broadcast_net(*coord), nets.neighbour_nets(*coord))
            else {
                continue;
            };

            let config = CellConfig {
                observation_count: if i == 0 { coords.len() as u32 } else { 0 },
                alpha,
                own_key: keys.key(own),
                neighbour_keys: neighbours.map(|id| keys.key(id)),
            };

            out.push(CoreConfig {
                location: cell.location,
                cell: *coord,
                config,
            });
        }
    }

    out
}
