//! Topology Mapper - assigns grid cells to (node, core) pairs.
//!
//! Each node hosts a `block_width x block_height` block of the heat map. The
//! `n`-th application core (core `n + 1`, core 0 is the node monitor) hosts
//! local cell `(n % block_width, n / block_width)`. Nodes with fewer usable
//! cores than the block size simply host fewer cells.
//!
//! ```text
//!  y
//!  ^   node (0,1)        node (1,1)
//!  |  +--+--+--+--+    +--+--+--+--+
//!  |  |13|14|15|16|    |13|14|15|16|
//!  |  ...
//!  |  +--+--+--+--+    +--+--+--+--+
//!  |  | 1| 2| 3| 4|    | 1| 2| 3| 4|   <- core numbers
//!  |  +--+--+--+--+    +--+--+--+--+
//!  +---------------------------------> x
//! ```

use crate::error::DeployError;
use heatmesh_env::{ApplicationMap, CoreLocation, Machine, NodeCoord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Block layout and core budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Cells per node along x
    pub block_width: u8,

    /// Cells per node along y
    pub block_height: u8,

    /// Largest core count (monitor included) a node may report
    pub max_cores_per_node: u8,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            block_width: 4,
            block_height: 4,
            max_cores_per_node: 18,
        }
    }
}

impl TopologyConfig {
    /// Number of cells in a fully populated block.
    pub fn block_size(&self) -> usize {
        self.block_width as usize * self.block_height as usize
    }
}

/// The four orthogonal neighbour directions, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    East,
    West,
    North,
    South,
}

impl Direction {
    /// Canonical order used by cell configs and key enumeration.
    pub const ALL: [Direction; 4] = [
        Direction::East,
        Direction::West,
        Direction::North,
        Direction::South,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn delta(self) -> (i64, i64) {
        match self {
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
            Direction::North => (0, 1),
            Direction::South => (0, -1),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::East => "East",
            Direction::West => "West",
            Direction::North => "North",
            Direction::South => "South",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Grid coordinate of a cell in the heat map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: u32,
    pub y: u32,
}

impl CellCoord {
    pub const ORIGIN: CellCoord = CellCoord { x: 0, y: 0 };

    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// The coordinate one step in `dir`, if it is non-negative.
    pub fn step(self, dir: Direction) -> Option<CellCoord> {
        let (dx, dy) = dir.delta();
        let x = u32::try_from(self.x as i64 + dx).ok()?;
        let y = u32::try_from(self.y as i64 + dy).ok()?;
        Some(CellCoord { x, y })
    }
}

impl std::fmt::Display for CellCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}

/// One grid cell and the core simulating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell {
    pub coord: CellCoord,
    pub location: CoreLocation,
}

impl Cell {
    pub fn node(&self) -> NodeCoord {
        self.location.node
    }

    pub fn core(&self) -> u8 {
        self.location.core
    }
}

/// Immutable cell-to-core mapping for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Heat map width (bounding box, in cells)
    width: u32,

    /// Heat map height (bounding box, in cells)
    height: u32,

    cells: BTreeMap<CellCoord, Cell>,

    /// Cells hosted by each node, ascending core order
    node_cells: BTreeMap<NodeCoord, Vec<CellCoord>>,
}

/// Maps every usable core of `machine` to a grid cell.
pub fn map_cells(machine: &Machine, config: &TopologyConfig) -> Result<Topology, DeployError> {
    if machine.width == 0 || machine.height == 0 {
        return Err(DeployError::topology(format!(
            "machine is {}x{} nodes",
            machine.width, machine.height
        )));
    }
    if config.block_width == 0 || config.block_height == 0 {
        return Err(DeployError::topology(format!(
            "cell block is {}x{}",
            config.block_width, config.block_height
        )));
    }

    let block = config.block_size();
    if block + 1 > config.max_cores_per_node as usize {
        return Err(DeployError::capacity(format!(
            "a {}x{} block needs {} cores per node, limit is {}",
            config.block_width,
            config.block_height,
            block + 1,
            config.max_cores_per_node
        )));
    }

    let bw = config.block_width as u32;
    let bh = config.block_height as u32;
    let mut cells = BTreeMap::new();
    let mut node_cells = BTreeMap::new();

    for node in machine.nodes() {
        let cores = machine.cores_at(node);
        if cores > config.max_cores_per_node {
            return Err(DeployError::capacity(format!(
                "node {} reports {} cores, limit is {}",
                node, cores, config.max_cores_per_node
            )));
        }

        // Core 0 runs the node monitor
        let hosted = block.min(cores.saturating_sub(1) as usize);
        let mut hosted_cells = Vec::with_capacity(hosted);

        for n in 0..hosted as u32 {
            let coord = CellCoord::new(node.x as u32 * bw + n % bw, node.y as u32 * bh + n / bw);
            let location = CoreLocation::new(node, (n + 1) as u8);
            cells.insert(coord, Cell { coord, location });
            hosted_cells.push(coord);
        }

        if hosted < block {
            debug!("Node {} hosts {}/{} cells", node, hosted, block);
        }
        if !hosted_cells.is_empty() {
            node_cells.insert(node, hosted_cells);
        }
    }

    if cells.is_empty() {
        return Err(DeployError::topology("machine hosts no cells"));
    }
    if !cells.contains_key(&CellCoord::ORIGIN) {
        return Err(DeployError::topology(
            "anchor cell [0, 0] is not hosted (node (0, 0) has no application cores)",
        ));
    }

    let topology = Topology {
        width: machine.width as u32 * bw,
        height: machine.height as u32 * bh,
        cells,
        node_cells,
    };

    info!(
        "Mapped {} cells onto {} nodes ({}x{} heat map)",
        topology.len(),
        topology.node_cells.len(),
        topology.width,
        topology.height
    );

    Ok(topology)
}

impl Topology {
    /// Heat map width in cells.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Heat map height in cells.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of hosted cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, coord: CellCoord) -> Option<&Cell> {
        self.cells.get(&coord)
    }

    pub fn contains(&self, coord: CellCoord) -> bool {
        self.cells.contains_key(&coord)
    }

    /// All cells in ascending coordinate order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// The fixed anchor cell boundary nets are rooted at.
    pub fn anchor(&self) -> CellCoord {
        CellCoord::ORIGIN
    }

    /// The neighbouring cell in `dir`, if it is hosted.
    pub fn neighbour(&self, coord: CellCoord, dir: Direction) -> Option<CellCoord> {
        coord.step(dir).filter(|n| self.cells.contains_key(n))
    }

    /// Cells hosted on a node, in ascending core order.
    pub fn node_cells(&self, node: NodeCoord) -> &[CellCoord] {
        self.node_cells.get(&node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Nodes hosting at least one cell, with their cells.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeCoord, &[CellCoord])> {
        self.node_cells.iter().map(|(n, c)| (*n, c.as_slice()))
    }

    /// Placement of every cell.
    pub fn placements(&self) -> BTreeMap<CellCoord, CoreLocation> {
        self.cells.iter().map(|(c, cell)| (*c, cell.location)).collect()
    }

    /// Cores to start on each node.
    pub fn application_map(&self) -> ApplicationMap {
        self.node_cells
            .iter()
            .map(|(node, coords)| {
                let cores = coords
                    .iter()
                    .filter_map(|c| self.cells.get(c))
                    .map(|cell| cell.core())
                    .collect();
                (*node, cores)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_full_machine_layout() {
        let machine = Machine::new(2, 2, 18);
        let topology = map_cells(&machine, &TopologyConfig::default()).unwrap();

        assert_eq!(topology.len(), 64);
        assert_eq!((topology.width(), topology.height()), (8, 8));

        let first = topology.cell(CellCoord::new(4, 0)).unwrap();
        assert_eq!(first.location, CoreLocation::new(NodeCoord::new(1, 0), 1));

        let last = topology.cell(CellCoord::new(7, 7)).unwrap();
        assert_eq!(last.location, CoreLocation::new(NodeCoord::new(1, 1), 16));

        let row = topology.cell(CellCoord::new(1, 2)).unwrap();
        assert_eq!(row.core(), 10); // n = 9 -> (1, 2)
    }

    #[test]
    fn test_partial_node_hosts_fewer_cells() {
        let machine = Machine::new(2, 1, 18).with_cores(NodeCoord::new(1, 0), 5);
        let topology = map_cells(&machine, &TopologyConfig::default()).unwrap();

        let hosted = topology.node_cells(NodeCoord::new(1, 0));
        assert_eq!(hosted.len(), 4);
        assert_eq!(
            hosted,
            &[
                CellCoord::new(4, 0),
                CellCoord::new(5, 0),
                CellCoord::new(6, 0),
                CellCoord::new(7, 0)
            ]
        );
        assert!(!topology.contains(CellCoord::new(4, 1)));
        assert_eq!(topology.len(), 20);
    }

    #[test]
    fn test_core_zero_never_assigned() {
        let machine = Machine::new(3, 2, 18).with_cores(NodeCoord::new(2, 1), 1);
        let topology = map_cells(&machine, &TopologyConfig::default()).unwrap();

        assert!(topology.cells().all(|c| c.core() >= 1));
        assert!(topology.node_cells(NodeCoord::new(2, 1)).is_empty());
    }

    #[test]
    fn test_application_map() {
        let machine = Machine::new(1, 1, 4);
        let topology = map_cells(&machine, &TopologyConfig::default()).unwrap();
        let app = topology.application_map();

        let cores: Vec<u8> = app[&NodeCoord::ORIGIN].iter().copied().collect();
        assert_eq!(cores, vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_sized_machine_rejected() {
        let machine = Machine::new(0, 4, 18);
        let err = map_cells(&machine, &TopologyConfig::default()).unwrap_err();
        assert!(matches!(err, DeployError::Topology(_)));
    }

    #[test]
    fn test_missing_anchor_rejected() {
        let machine = Machine::new(2, 1, 18).with_cores(NodeCoord::ORIGIN, 1);
        let err = map_cells(&machine, &TopologyConfig::default()).unwrap_err();
        assert!(matches!(err, DeployError::Topology(_)));
    }

    #[test]
    fn test_core_budget_exceeded() {
        let machine = Machine::new(1, 1, 40);
        let err = map_cells(&machine, &TopologyConfig::default()).unwrap_err();
        assert!(matches!(err, DeployError::Capacity(_)));

        let config = TopologyConfig {
            block_width: 5,
            block_height: 4,
            ..Default::default()
        };
        let err = map_cells(&Machine::new(1, 1, 18), &config).unwrap_err();
        assert!(matches!(err, DeployError::Capacity(_)));
    }

    #[test]
    fn test_neighbour_lookup() {
        let machine = Machine::new(1, 1, 18);
        let topology = map_cells(&machine, &TopologyConfig::default()).unwrap();

        assert_eq!(
            topology.neighbour(CellCoord::new(0, 0), Direction::East),
            Some(CellCoord::new(1, 0))
        );
        assert_eq!(topology.neighbour(CellCoord::new(0, 0), Direction::West), None);
        assert_eq!(topology.neighbour(CellCoord::new(3, 3), Direction::North), None);
    }

    fn arb_machine() -> impl Strategy<Value = Machine> {
        (1u16..5, 1u16..5, 2u8..19, prop::collection::vec((0u16..5, 0u16..5, 1u8..19), 0..6))
            .prop_map(|(w, h, cores, overrides)| {
                let mut machine = Machine::new(w, h, cores);
                for (x, y, c) in overrides {
                    // Keep the anchor node alive
                    if (x, y) != (0, 0) {
                        machine.set_cores(NodeCoord::new(x, y), c);
                    }
                }
                machine
            })
    }

    proptest! {
        #[test]
        fn prop_mapping_is_bijective(machine in arb_machine()) {
            let topology = map_cells(&machine, &TopologyConfig::default()).unwrap();

            let mut seen = HashSet::new();
            for cell in topology.cells() {
                prop_assert!(cell.core() >= 1);
                prop_assert!((cell.core() as usize) < machine.cores_at(cell.node()) as usize);
                prop_assert!(seen.insert(cell.location), "core {} hosts two cells", cell.location);
            }
            prop_assert_eq!(seen.len(), topology.len());
        }

        #[test]
        fn prop_mapping_is_deterministic(machine in arb_machine()) {
            let a = map_cells(&machine, &TopologyConfig::default()).unwrap();
            let b = map_cells(&machine.clone(), &TopologyConfig::default()).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
