//! Net Builder - multicast groups between cells.
//!
//! Every cell owns one broadcast net reaching its live orthogonal neighbours.
//! For each direction there is also a boundary net, sourced at the anchor
//! cell, reaching every cell with no live neighbour in that direction; the
//! host injects edge temperatures through these.
//!
//! The nets live in a flat arena indexed by [`NetId`]. The arena order is the
//! key enumeration order: broadcast nets in ascending cell order, then the
//! four boundary nets in canonical direction order.

use crate::error::DeployError;
use crate::topology::{CellCoord, Direction, Topology};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// Index of a net in a [`NetList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetId(pub usize);

/// What a net carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetKind {
    /// A cell's own temperature broadcast
    Broadcast(CellCoord),
    /// Host-controlled edge temperature for one direction
    Boundary(Direction),
}

/// A multicast group: one source, any number of sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Net {
    pub id: NetId,
    pub kind: NetKind,
    pub source: CellCoord,

    /// Sink cells in ascending coordinate order
    pub sinks: Vec<CellCoord>,
}

/// All nets of a deployment plus the per-cell neighbour index.
#[derive(Debug, Clone)]
pub struct NetList {
    nets: Vec<Net>,
    broadcast: BTreeMap<CellCoord, NetId>,
    boundary: [NetId; 4],

    /// For each cell, the net delivering each neighbour's temperature
    neighbour_nets: HashMap<CellCoord, [NetId; 4]>,
}

/// Builds broadcast and boundary nets for a topology.
pub fn build_nets(topology: &Topology) -> Result<NetList, DeployError> {
    let anchor = topology.anchor();
    if !topology.contains(anchor) {
        return Err(DeployError::topology(format!("anchor cell {} is not hosted", anchor)));
    }

    let mut nets = Vec::with_capacity(topology.len() + Direction::ALL.len());
    let mut broadcast = BTreeMap::new();

    for cell in topology.cells() {
        let id = NetId(nets.len());
        let sinks = Direction::ALL
            .iter()
            .filter_map(|dir| topology.neighbour(cell.coord, *dir))
            .collect::<Vec<_>>();
        nets.push(Net {
            id,
            kind: NetKind::Broadcast(cell.coord),
            source: cell.coord,
            sinks: sorted(sinks),
        });
        broadcast.insert(cell.coord, id);
    }

    let mut boundary = [NetId(0); 4];
    for dir in Direction::ALL {
        let id = NetId(nets.len());
        // Cells are visited in ascending order, so sinks come out sorted
        let sinks = topology
            .cells()
            .filter(|cell| topology.neighbour(cell.coord, dir).is_none())
            .map(|cell| cell.coord)
            .collect();
        nets.push(Net {
            id,
            kind: NetKind::Boundary(dir),
            source: anchor,
            sinks,
        });
        boundary[dir.index()] = id;
    }

    let neighbour_nets = topology
        .cells()
        .map(|cell| {
            let mut lookup = [NetId(0); 4];
            for dir in Direction::ALL {
                lookup[dir.index()] = match topology.neighbour(cell.coord, dir) {
                    Some(n) => broadcast[&n],
                    None => boundary[dir.index()],
                };
            }
            (cell.coord, lookup)
        })
        .collect();

    info!(
        "Built {} nets ({} broadcast, {} boundary)",
        nets.len(),
        broadcast.len(),
        boundary.len()
    );

    Ok(NetList {
        nets,
        broadcast,
        boundary,
        neighbour_nets,
    })
}

fn sorted(mut cells: Vec<CellCoord>) -> Vec<CellCoord> {
    cells.sort();
    cells
}

impl NetList {
    /// All nets in key enumeration order.
    pub fn nets(&self) -> &[Net] {
        &self.nets
    }

    pub fn net(&self, id: NetId) -> &Net {
        &self.nets[id.0]
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// The net a cell broadcasts its own temperature on.
    pub fn broadcast_net(&self, cell: CellCoord) -> Option<NetId> {
        self.broadcast.get(&cell).copied()
    }

    /// The boundary net for one direction.
    pub fn boundary_net(&self, dir: Direction) -> NetId {
        self.boundary[dir.index()]
    }

    /// The net delivering `cell`'s neighbour temperature in `dir`.
    pub fn neighbour_net(&self, cell: CellCoord, dir: Direction) -> Option<NetId> {
        self.neighbour_nets.get(&cell).map(|lookup| lookup[dir.index()])
    }

    /// All four neighbour nets of a cell in canonical order.
    pub fn neighbour_nets(&self, cell: CellCoord) -> Option<&[NetId; 4]> {
        self.neighbour_nets.get(&cell)
    }
}
