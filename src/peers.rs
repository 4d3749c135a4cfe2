//! Peer table: known mesh addresses with link quality and latency.
//!
//! Bounded at a configured capacity; when full, the oldest-seen entry is
//! evicted first. Entries come and go with scan results and topology events,
//! RTT estimates come from the ping/pong exchange.

use crate::topology::ScanResult;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Consecutive send failures after which a peer is treated as unreachable.
pub const SEND_FAILURE_LIMIT: u8 = 3;

/// 6-byte hardware identifier of a mesh station. Byte-wise equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshAddress(pub [u8; 6]);

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// `aa:bb:cc:dd:ee:ff` notation.
impl FromStr for MeshAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for slot in &mut bytes {
            let part = parts.next().ok_or_else(|| format!("bad mesh address: {s}"))?;
            *slot = u8::from_str_radix(part, 16).map_err(|e| format!("bad mesh address: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("bad mesh address: {s}"));
        }
        Ok(MeshAddress(bytes))
    }
}

/// One known sibling in the mesh.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: MeshAddress,
    pub rssi_dbm: i8,
    pub layer: i32,
    pub last_seen: Instant,
    pub rtt: Option<Duration>,
    send_failures: u8,
}

/// Bounded mapping from address to peer state.
pub struct PeerTable {
    peers: HashMap<MeshAddress, Peer>,
    /// Outstanding ping timestamps, paired with the next pong per address.
    pending_pings: HashMap<MeshAddress, Instant>,
    capacity: usize,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        PeerTable {
            peers: HashMap::new(),
            pending_pings: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, addr: &MeshAddress) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn get(&self, addr: &MeshAddress) -> Option<&Peer> {
        self.peers.get(addr)
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    /// Rebuild the table from a completed scan: keep only addresses present
    /// in both the current routing table and the scan results, refreshing
    /// signal strength and layer. RTT estimates survive for retained peers.
    pub fn observe_scan(&mut self, scans: &[ScanResult], routing_table: &[MeshAddress]) {
        let now = Instant::now();
        self.peers.retain(|addr, _| {
            routing_table.contains(addr) && scans.iter().any(|s| s.addr == *addr)
        });
        for scan in scans {
            if !routing_table.contains(&scan.addr) {
                continue;
            }
            match self.peers.get_mut(&scan.addr) {
                Some(peer) => {
                    peer.rssi_dbm = scan.rssi_dbm;
                    peer.layer = scan.layer.unwrap_or(peer.layer);
                    peer.last_seen = now;
                }
                None => self.insert(Peer {
                    addr: scan.addr,
                    rssi_dbm: scan.rssi_dbm,
                    layer: scan.layer.unwrap_or(crate::topology::LAYER_UNSET),
                    last_seen: now,
                    rtt: None,
                    send_failures: 0,
                }),
            }
        }
    }

    /// Note the send timestamp of a ping so the matching pong yields an RTT.
    /// Also resets the failure streak, since the send itself succeeded.
    pub fn mark_ping_sent(&mut self, addr: MeshAddress, at: Instant) {
        self.pending_pings.insert(addr, at);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.send_failures = 0;
        }
    }

    /// Record a pong from `addr`, returning the measured round trip when an
    /// outstanding ping exists. A pong from an unknown address creates the
    /// entry; replies never require prior table membership.
    pub fn record_pong(&mut self, addr: MeshAddress, now: Instant) -> Option<Duration> {
        let rtt = self.pending_pings.remove(&addr).map(|sent| now - sent);
        match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.last_seen = now;
                peer.send_failures = 0;
                if rtt.is_some() {
                    peer.rtt = rtt;
                }
            }
            None => self.insert(Peer {
                addr,
                rssi_dbm: 0,
                layer: crate::topology::LAYER_UNSET,
                last_seen: now,
                rtt,
                send_failures: 0,
            }),
        }
        rtt
    }

    /// Count a failed send to `addr`. After [`SEND_FAILURE_LIMIT`]
    /// consecutive failures the peer is dropped as unreachable; returns
    /// whether that happened. One failure is transient and keeps the entry.
    pub fn record_send_failure(&mut self, addr: MeshAddress) -> bool {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return false;
        };
        peer.send_failures = peer.send_failures.saturating_add(1);
        if peer.send_failures >= SEND_FAILURE_LIMIT {
            self.remove(&addr);
            return true;
        }
        false
    }

    /// Drop a peer immediately (child disconnect), regardless of scan timing.
    pub fn remove(&mut self, addr: &MeshAddress) {
        self.peers.remove(addr);
        self.pending_pings.remove(addr);
    }

    fn insert(&mut self, peer: Peer) {
        if self.peers.len() >= self.capacity && !self.peers.contains_key(&peer.addr) {
            // Evict the oldest-seen entry to stay within capacity.
            if let Some(oldest) = self
                .peers
                .values()
                .min_by_key(|p| p.last_seen)
                .map(|p| p.addr)
            {
                self.remove(&oldest);
            }
        }
        self.peers.insert(peer.addr, peer);
    }
}
