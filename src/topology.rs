//! Tree roles and parent selection.
//!
//! The node's view of its own place in the mesh tree lives in
//! [`TopologyState`], owned by the transport loop and handed out as cheap
//! snapshots. Parent selection is a pure function over scan results so it can
//! be tested without a radio.

use crate::peers::MeshAddress;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Layer value meaning "not part of a tree yet".
pub const LAYER_UNSET: i32 = -1;

/// Role a node plays in the mesh tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeRole {
    /// Not started.
    Idle,
    /// Looking for a tree to join (or an upstream router, if root-capable).
    Scanning,
    /// Tree root, bridging the mesh to the external network.
    Root,
    /// Intermediate node with a parent, relaying for children.
    Node,
    /// Has a parent, accepts no children.
    Leaf,
}

/// One result from a completed scan. Carries the mesh association metadata
/// advertised by a candidate parent (or a plain router beacon, for which
/// `layer`/`child_capacity` are absent).
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub addr: MeshAddress,
    pub ssid: String,
    pub rssi_dbm: i8,
    /// Advertised tree layer; `None` for a non-mesh access point.
    pub layer: Option<i32>,
    /// Remaining child slots the candidate will accept.
    pub child_capacity: Option<u8>,
}

/// The parent (or root upstream) chosen from a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentChoice {
    pub addr: MeshAddress,
    /// The layer this node will occupy once associated.
    pub layer: i32,
    pub role: NodeRole,
}

/// Snapshot of the node's tree position.
///
/// Invariant: `connected` implies `layer >= 0` and (`role == Root` or
/// `parent` is set). All mutators preserve it.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyState {
    pub role: NodeRole,
    pub layer: i32,
    pub parent: Option<MeshAddress>,
    /// IP of the parent's gateway interface, used by the cache proxy.
    pub parent_gateway: Option<Ipv4Addr>,
    pub connected: bool,
}

impl Default for TopologyState {
    fn default() -> Self {
        TopologyState {
            role: NodeRole::Idle,
            layer: LAYER_UNSET,
            parent: None,
            parent_gateway: None,
            connected: false,
        }
    }
}

impl TopologyState {
    pub fn begin_scanning(&mut self) {
        self.role = NodeRole::Scanning;
        self.layer = LAYER_UNSET;
        self.parent = None;
        self.parent_gateway = None;
        self.connected = false;
    }

    pub fn connect_as_root(&mut self) {
        self.role = NodeRole::Root;
        self.layer = 0;
        self.parent = None;
        self.parent_gateway = None;
        self.connected = true;
    }

    pub fn connect_to_parent(&mut self, choice: &ParentChoice, gateway: Option<Ipv4Addr>) {
        debug_assert!(matches!(choice.role, NodeRole::Node | NodeRole::Leaf));
        self.role = choice.role;
        self.layer = choice.layer;
        self.parent = Some(choice.addr);
        self.parent_gateway = gateway;
        self.connected = true;
    }

    pub fn set_layer(&mut self, layer: i32) {
        if layer >= 0 {
            self.layer = layer;
        }
    }
}

/// Pick a parent from scan results, per the tree-join policy:
/// discard candidates with exhausted child capacity or RSSI below the floor,
/// then prefer the smallest layer, breaking ties by the smallest remaining
/// capacity (a less congested subtree). The node joins one layer below its
/// parent, as a `Leaf` when that layer cannot host children of its own.
pub fn select_parent(
    scans: &[ScanResult],
    rssi_floor_dbm: i8,
    max_layer: i32,
) -> Option<ParentChoice> {
    let best = scans
        .iter()
        .filter_map(|s| {
            let layer = s.layer?;
            let capacity = s.child_capacity?;
            (capacity > 0 && s.rssi_dbm >= rssi_floor_dbm && layer >= 0)
                .then_some((s, layer, capacity))
        })
        .min_by_key(|&(_, layer, capacity)| (layer, capacity))?;

    let (candidate, parent_layer, _) = best;
    let layer = parent_layer + 1;
    let role = if layer >= max_layer {
        NodeRole::Leaf
    } else {
        NodeRole::Node
    };
    Some(ParentChoice {
        addr: candidate.addr,
        layer,
        role,
    })
}

/// Root selection: scan results are matched against the configured router
/// SSID; any exact match makes this node the (single) bridge to the upstream
/// network.
pub fn select_root<'a>(scans: &'a [ScanResult], router_ssid: &str) -> Option<&'a ScanResult> {
    scans.iter().find(|s| s.ssid == router_ssid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh_ap(mac: u8, rssi: i8, layer: i32, capacity: u8) -> ScanResult {
        ScanResult {
            addr: MeshAddress([0, 0, 0, 0, 0, mac]),
            ssid: format!("mesh_{mac:02x}"),
            rssi_dbm: rssi,
            layer: Some(layer),
            child_capacity: Some(capacity),
        }
    }

    #[test]
    fn rejects_weak_and_full_candidates() {
        let scans = vec![
            mesh_ap(1, -80, 1, 4), // below the RSSI floor
            mesh_ap(2, -50, 1, 0), // no child slots left
        ];
        assert_eq!(select_parent(&scans, -70, 6), None);
    }

    #[test]
    fn never_picks_below_floor_when_a_qualifier_exists() {
        let scans = vec![
            mesh_ap(1, -90, 0, 8), // closer to root but unusable
            mesh_ap(2, -60, 3, 2),
        ];
        let choice = select_parent(&scans, -70, 6).unwrap();
        assert_eq!(choice.addr, MeshAddress([0, 0, 0, 0, 0, 2]));
        assert_eq!(choice.layer, 4);
    }

    #[test]
    fn prefers_smallest_layer() {
        let scans = vec![mesh_ap(1, -55, 2, 1), mesh_ap(2, -69, 1, 1)];
        let choice = select_parent(&scans, -70, 6).unwrap();
        assert_eq!(choice.addr, MeshAddress([0, 0, 0, 0, 0, 2]));
        assert_eq!(choice.layer, 2);
        assert_eq!(choice.role, NodeRole::Node);
    }

    #[test]
    fn ties_break_on_remaining_capacity() {
        let scans = vec![mesh_ap(1, -40, 1, 9), mesh_ap(2, -60, 1, 3)];
        let choice = select_parent(&scans, -70, 6).unwrap();
        assert_eq!(choice.addr, MeshAddress([0, 0, 0, 0, 0, 2]));
    }

    #[test]
    fn joins_as_leaf_at_the_depth_limit() {
        let scans = vec![mesh_ap(1, -50, 5, 2)];
        let choice = select_parent(&scans, -70, 6).unwrap();
        assert_eq!(choice.layer, 6);
        assert_eq!(choice.role, NodeRole::Leaf);
    }

    #[test]
    fn plain_access_points_are_not_parents() {
        let scans = vec![ScanResult {
            addr: MeshAddress([0xaa; 6]),
            ssid: "HomeRouter".into(),
            rssi_dbm: -30,
            layer: None,
            child_capacity: None,
        }];
        assert_eq!(select_parent(&scans, -70, 6), None);
        assert!(select_root(&scans, "HomeRouter").is_some());
        assert!(select_root(&scans, "OtherNet").is_none());
    }

    #[test]
    fn connect_transitions_keep_the_invariant() {
        let mut state = TopologyState::default();
        state.begin_scanning();
        assert!(!state.connected);
        assert_eq!(state.layer, LAYER_UNSET);

        state.connect_as_root();
        assert!(state.connected && state.layer == 0 && state.parent.is_none());

        state.begin_scanning();
        let choice = ParentChoice {
            addr: MeshAddress([1; 6]),
            layer: 2,
            role: NodeRole::Node,
        };
        state.connect_to_parent(&choice, Some(Ipv4Addr::new(192, 168, 4, 1)));
        assert!(state.connected && state.layer >= 0 && state.parent.is_some());
    }
}
