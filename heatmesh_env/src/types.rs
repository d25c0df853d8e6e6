//! Common types shared between the core pipeline and its collaborators.

use crate::error::EnvError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Bit 31 of every multicast key is reserved for in-band status signalling.
pub const STATUS_BIT: u32 = 0x8000_0000;

/// Mask applied to every assigned key (all bits except the status bit).
pub const KEY_MASK: u32 = !STATUS_BIT;

/// Physical mesh coordinate of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeCoord {
    pub x: u16,
    pub y: u16,
}

impl NodeCoord {
    pub const ORIGIN: NodeCoord = NodeCoord { x: 0, y: 0 };

    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for NodeCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A single core on a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreLocation {
    pub node: NodeCoord,
    pub core: u8,
}

impl CoreLocation {
    pub fn new(node: NodeCoord, core: u8) -> Self {
        Self { node, core }
    }
}

impl std::fmt::Display for CoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.node, self.core)
    }
}

/// Shape and per-node core counts of a mesh machine.
///
/// Every node in the `width x height` rectangle exists. The core count of a
/// node includes core 0, which is reserved for node management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub width: u16,
    pub height: u16,

    /// Core count of every node without an override
    pub cores_per_node: u8,

    /// Nodes with fewer (or more) working cores than the default
    core_overrides: BTreeMap<NodeCoord, u8>,
}

impl Machine {
    /// Creates a uniform machine.
    pub fn new(width: u16, height: u16, cores_per_node: u8) -> Self {
        Self {
            width,
            height,
            cores_per_node,
            core_overrides: BTreeMap::new(),
        }
    }

    /// Overrides the core count of a single node.
    pub fn with_cores(mut self, node: NodeCoord, cores: u8) -> Self {
        self.set_cores(node, cores);
        self
    }

    /// Overrides the core count of a single node in place.
    pub fn set_cores(&mut self, node: NodeCoord, cores: u8) {
        self.core_overrides.insert(node, cores);
    }

    /// Returns the total core count (monitor included) of a node.
    pub fn cores_at(&self, node: NodeCoord) -> u8 {
        if !self.contains(node) {
            return 0;
        }
        self.core_overrides
            .get(&node)
            .copied()
            .unwrap_or(self.cores_per_node)
    }

    /// Returns true if the node lies inside the machine.
    pub fn contains(&self, node: NodeCoord) -> bool {
        node.x < self.width && node.y < self.height
    }

    /// Iterates over all nodes in a fixed order (ascending x, then y).
    pub fn nodes(&self) -> impl Iterator<Item = NodeCoord> + '_ {
        (0..self.width).flat_map(move |x| (0..self.height).map(move |y| NodeCoord::new(x, y)))
    }

    /// Number of nodes in the machine.
    pub fn node_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// One forwarding rule in a node's routing table.
///
/// Route bits 0-3 select the outgoing links (East, West, North, South) and
/// bit `ROUTE_CORE_SHIFT + n` delivers to local core `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub key: u32,
    pub mask: u32,
    pub route: u32,
}

impl RoutingEntry {
    pub const ROUTE_CORE_SHIFT: u32 = 6;

    /// Returns true if a packet carrying `key` matches this entry.
    pub fn matches(&self, key: u32) -> bool {
        key & self.mask == self.key
    }

    /// Route bit for a local core.
    pub fn core_bit(core: u8) -> u32 {
        1 << (Self::ROUTE_CORE_SHIFT + core as u32)
    }

    /// Route bit for an outgoing link (0..4).
    pub fn link_bit(link: u8) -> u32 {
        1 << link
    }
}

/// Per-node routing tables, opaque to the core pipeline.
pub type RoutingTables = BTreeMap<NodeCoord, Vec<RoutingEntry>>;

/// Cores to start on each node when the application is loaded.
pub type ApplicationMap = BTreeMap<NodeCoord, BTreeSet<u8>>;

/// Named synchronisation phases of the barrier protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Cores have finished local setup and wait for the start signal
    Sync0,
    /// Cores have finished running
    Exit,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Sync0 => "sync0",
            Phase::Exit => "exit",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Host-to-mesh control packet: multicast `value` with routing `key`.
///
/// Wire format: `key: u32 LE`, `value: i32 LE` (raw s15.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPacket {
    pub key: u32,
    pub value: i32,
}

impl ControlPacket {
    pub const SIZE: usize = 8;

    pub fn new(key: u32, value: i32) -> Self {
        Self { key, value }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.key.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.value.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvError> {
        if bytes.len() != Self::SIZE {
            return Err(EnvError::SerializationError(format!(
                "control packet must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let key = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let value = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { key, value })
    }
}

/// Mesh-to-host telemetry report.
///
/// The payload is opaque here; the telemetry listener decodes it as a
/// sequence of s15.16 values in ascending core order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPacket {
    /// Node that produced the report
    pub source: NodeCoord,

    /// Reporting core on that node
    pub core: u8,

    pub payload: Vec<u8>,
}

impl ReportPacket {
    pub const HEADER_SIZE: usize = 4;

    pub fn new(source: NodeCoord, core: u8, payload: Vec<u8>) -> Self {
        Self {
            source,
            core,
            payload,
        }
    }

    /// Encodes as a datagram: `x: u8, y: u8, core: u8, reserved: u8, payload`.
    pub fn to_datagram(&self) -> Result<Vec<u8>, EnvError> {
        let x = u8::try_from(self.source.x)
            .map_err(|_| EnvError::SerializationError(format!("node x {} exceeds u8", self.source.x)))?;
        let y = u8::try_from(self.source.y)
            .map_err(|_| EnvError::SerializationError(format!("node y {} exceeds u8", self.source.y)))?;
        let mut bytes = Vec::with_capacity(Self::HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&[x, y, self.core, 0]);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Decodes a datagram produced by [`ReportPacket::to_datagram`].
    pub fn from_datagram(bytes: &[u8]) -> Result<Self, EnvError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(EnvError::SerializationError(format!(
                "report datagram too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            source: NodeCoord::new(bytes[0] as u16, bytes[1] as u16),
            core: bytes[2],
            payload: bytes[Self::HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_overrides() {
        let machine = Machine::new(2, 2, 18).with_cores(NodeCoord::new(1, 0), 5);

        assert_eq!(machine.cores_at(NodeCoord::new(0, 0)), 18);
        assert_eq!(machine.cores_at(NodeCoord::new(1, 0)), 5);
        assert_eq!(machine.cores_at(NodeCoord::new(2, 0)), 0);
        assert_eq!(machine.node_count(), 4);
    }

    #[test]
    fn test_machine_node_order() {
        let machine = Machine::new(2, 2, 18);
        let nodes: Vec<_> = machine.nodes().collect();

        let mut sorted = nodes.clone();
        sorted.sort();
        assert_eq!(nodes, sorted);
    }

    #[test]
    fn test_control_packet_layout() {
        let packet = ControlPacket::new(0x0102_0304, -2);
        let bytes = packet.to_bytes();

        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(ControlPacket::from_bytes(&bytes).unwrap(), packet);
        assert!(ControlPacket::from_bytes(&bytes[..7]).is_err());
    }

    #[test]
    fn test_report_datagram() {
        let report = ReportPacket::new(NodeCoord::new(3, 1), 1, vec![1, 2, 3, 4]);
        let datagram = report.to_datagram().unwrap();

        assert_eq!(&datagram[..4], &[3, 1, 1, 0]);
        assert_eq!(ReportPacket::from_datagram(&datagram).unwrap(), report);
        assert!(ReportPacket::from_datagram(&[1, 2]).is_err());
    }

    #[test]
    fn test_routing_entry_match() {
        let entry = RoutingEntry {
            key: 7,
            mask: KEY_MASK,
            route: RoutingEntry::core_bit(1) | RoutingEntry::link_bit(0),
        };

        assert!(entry.matches(7));
        assert!(entry.matches(7 | STATUS_BIT));
        assert!(!entry.matches(8));
        assert_eq!(entry.route, (1 << 7) | 1);
    }
}
