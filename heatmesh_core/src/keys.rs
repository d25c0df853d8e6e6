//! Key Assignor - unique routing keys for every net.
//!
//! Keys are handed out sequentially from `KeySpace::base` in net arena order,
//! so identical topologies always get identical keys. Bit 31 belongs to the
//! transport (status bit) and never appears in a key.

use crate::error::DeployError;
use crate::nets::{NetId, NetList};
use crate::topology::Direction;
use heatmesh_env::{KEY_MASK, STATUS_BIT};
use serde::{Deserialize, Serialize};
use tracing::info;

/// The range of keys a deployment may use: `base..limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpace {
    /// First key handed out
    pub base: u32,

    /// Exclusive upper bound; at most 2^31
    pub limit: u32,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self {
            base: 0,
            limit: STATUS_BIT,
        }
    }
}

impl KeySpace {
    pub fn capacity(&self) -> u64 {
        (self.limit as u64).saturating_sub(self.base as u64)
    }
}

/// Key and mask of every net, indexed by [`NetId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetKeys {
    keys: Vec<u32>,
    mask: u32,
}

/// Routing keys of the four boundary nets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeKeys([u32; 4]);

impl EdgeKeys {
    pub fn get(&self, dir: Direction) -> u32 {
        self.0[dir.index()]
    }
}

/// Assigns a distinct key to every net.
pub fn assign_keys(nets: &NetList, space: &KeySpace) -> Result<NetKeys, DeployError> {
    if space.limit > STATUS_BIT {
        return Err(DeployError::capacity(format!(
            "key space limit {:#x} overlaps the status bit",
            space.limit
        )));
    }
    if (nets.len() as u64) > space.capacity() {
        return Err(DeployError::capacity(format!(
            "{} nets need more keys than the {} available in {:#x}..{:#x}",
            nets.len(),
            space.capacity(),
            space.base,
            space.limit
        )));
    }

    let keys: Vec<u32> = (0..nets.len() as u32).map(|i| space.base + i).collect();

    info!(
        "Assigned {} keys ({:#x}..{:#x})",
        keys.len(),
        space.base,
        space.base as u64 + keys.len() as u64
    );

    Ok(NetKeys {
        keys,
        mask: KEY_MASK,
    })
}

impl NetKeys {
    pub fn key(&self, id: NetId) -> u32 {
        self.keys[id.0]
    }

    /// Mask shared by every key (all bits but the status bit).
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// `(key, mask)` for a net.
    pub fn get(&self, id: NetId) -> (u32, u32) {
        (self.key(id), self.mask)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetId, u32)> + '_ {
        self.keys.iter().enumerate().map(|(i, k)| (NetId(i), *k))
    }

    /// Keys of the boundary nets, used by the operator console.
    pub fn edge_keys(&self, nets: &NetList) -> EdgeKeys {
        let mut keys = [0u32; 4];
        for dir in Direction::ALL {
            keys[dir.index()] = self.key(nets.boundary_net(dir));
        }
        EdgeKeys(keys)
    }
}
