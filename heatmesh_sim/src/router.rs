//! Dimension-ordered (X then Y) multicast router.
//!
//! Each net becomes a tree rooted at its source node: packets first travel
//! along x to the sink's column, then along y. Paths to different sinks share
//! hops, so a node on several paths gets a single entry with the union of
//! the outgoing links.
//!
//! Link bits: East = 0, West = 1, North = 2, South = 3.

use heatmesh_core::{Direction, NetKeys, NetList, Router, Topology};
use heatmesh_env::{EnvError, Machine, NodeCoord, RoutingEntry, RoutingTables};
use std::collections::BTreeMap;

/// Highest core a route word can address.
const MAX_ROUTED_CORE: u8 = (32 - RoutingEntry::ROUTE_CORE_SHIFT) as u8 - 1;

/// X-then-Y tree router.
#[derive(Debug, Default, Clone, Copy)]
pub struct XyRouter;

/// Link index of a direction (matches `Direction::index`).
pub fn link_of(dir: Direction) -> u8 {
    dir.index() as u8
}

/// Node one hop away in `dir`, if it lies inside the machine.
pub fn neighbour_node(machine: &Machine, node: NodeCoord, dir: Direction) -> Option<NodeCoord> {
    let (dx, dy) = dir.delta();
    let x = u16::try_from(node.x as i64 + dx).ok()?;
    let y = u16::try_from(node.y as i64 + dy).ok()?;
    let next = NodeCoord::new(x, y);
    machine.contains(next).then_some(next)
}

/// Sequence of `(node, outgoing direction)` hops from `from` to `to`.
fn xy_path(from: NodeCoord, to: NodeCoord) -> Vec<(NodeCoord, Direction)> {
    let mut hops = Vec::new();
    let mut at = from;
    while at.x != to.x {
        let dir = if to.x > at.x { Direction::East } else { Direction::West };
        hops.push((at, dir));
        at.x = if to.x > at.x { at.x + 1 } else { at.x - 1 };
    }
    while at.y != to.y {
        let dir = if to.y > at.y { Direction::North } else { Direction::South };
        hops.push((at, dir));
        at.y = if to.y > at.y { at.y + 1 } else { at.y - 1 };
    }
    hops
}

impl Router for XyRouter {
    fn route(
        &self,
        nets: &NetList,
        keys: &NetKeys,
        machine: &Machine,
        placements: &Topology,
    ) -> Result<RoutingTables, EnvError> {
        // node -> key -> route word
        let mut routes: BTreeMap<NodeCoord, BTreeMap<u32, u32>> = BTreeMap::new();

        for net in nets.nets() {
            let source = placements
                .cell(net.source)
                .ok_or_else(|| EnvError::RoutingError(format!("net source {} is not placed", net.source)))?
                .node();
            let key = keys.key(net.id);

            for sink in &net.sinks {
                let cell = placements
                    .cell(*sink)
                    .ok_or_else(|| EnvError::RoutingError(format!("net sink {} is not placed", sink)))?;
                if cell.core() > MAX_ROUTED_CORE {
                    return Err(EnvError::RoutingError(format!(
                        "core {} cannot be addressed in a route word",
                        cell.location
                    )));
                }
                if !machine.contains(cell.node()) {
                    return Err(EnvError::RoutingError(format!("sink node {} outside machine", cell.node())));
                }

                for (node, dir) in xy_path(source, cell.node()) {
                    *routes.entry(node).or_default().entry(key).or_default() |= RoutingEntry::link_bit(link_of(dir));
                }
                *routes.entry(cell.node()).or_default().entry(key).or_default() |= RoutingEntry::core_bit(cell.core());
            }
        }

        let mask = keys.mask();
        Ok(routes
            .into_iter()
            .map(|(node, entries)| {
                let entries = entries
                    .into_iter()
                    .map(|(key, route)| RoutingEntry { key, mask, route })
                    .collect();
                (node, entries)
            })
            .collect())
    }
}
