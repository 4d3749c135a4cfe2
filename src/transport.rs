//! Mesh transport: the driver seam plus the long-lived loops that keep a
//! node joined to the tree and its peer table warm.
//!
//! The radio itself lives behind [`MeshDriver`]. Everything above it is
//! portable: parent selection, reconnect handling, the ping/pong sweep and
//! RTT bookkeeping.

use crate::config::Config;
use crate::packet::{Packet, PacketKind};
use crate::peers::{MeshAddress, PeerTable};
use crate::telemetry::Activity;
use crate::topology::{select_parent, select_root, ParentChoice, TopologyState};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub use crate::topology::ScanResult;

/// Poll granularity for the TX tick and the RX receive timeout.
const TICK: Duration = Duration::from_millis(500);

/// Why the link to the parent went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Beacon loss, parent powered off, moved out of range.
    LinkLost,
    /// Parent hit its child limit and shed us.
    TooManyAssociations,
}

/// Asynchronous notifications from the link layer.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    Started,
    Stopped,
    ChildConnected(MeshAddress),
    ChildDisconnected(MeshAddress),
    ParentConnected { gateway: Option<Ipv4Addr> },
    ParentDisconnected(DisconnectReason),
    LayerChanged(i32),
    /// Results of a scan the driver ran on its own schedule.
    ScanDone(Vec<ScanResult>),
    RoutingTableChanged,
}

/// Link-layer capability surface. One implementation per radio; the
/// in-process [`SimDriver`] stands in where no radio exists.
#[async_trait]
pub trait MeshDriver: Send + Sync + 'static {
    /// This node's own link address.
    fn local_addr(&self) -> MeshAddress;

    /// Bring up the softap children associate with, capped at
    /// `max_children` concurrent associations.
    async fn advertise_softap(&self, ssid: &str, max_children: u8) -> Result<()>;

    /// Survey nearby APs and mesh nodes.
    async fn scan(&self) -> Result<Vec<ScanResult>>;

    /// Associate with the external router, taking the root role.
    async fn join_router(&self) -> Result<()>;

    /// Associate with a mesh parent. Success is confirmed by a later
    /// [`MeshEvent::ParentConnected`].
    async fn join_parent(&self, choice: &ParentChoice) -> Result<()>;

    /// Send one frame. `None` broadcasts to every directly connected node.
    async fn send_to(&self, dest: Option<MeshAddress>, frame: Bytes) -> Result<()>;

    /// Receive the next inbound frame, or `None` if the timeout lapses.
    async fn recv(&self, timeout: Duration) -> Result<Option<(MeshAddress, Bytes)>>;

    /// Next link-layer event; `None` means the driver shut down.
    async fn next_event(&self) -> Option<MeshEvent>;

    /// Addresses of directly connected nodes (parent and children).
    fn routing_table(&self) -> Vec<MeshAddress>;

    /// Frames queued but not yet on the air.
    fn pending_tx(&self) -> usize;
}

/// Owns the topology + peer state and the three loops that maintain them.
#[derive(Clone)]
pub struct Transport {
    driver: Arc<dyn MeshDriver>,
    config: Arc<Config>,
    topology: Arc<Mutex<TopologyState>>,
    peers: Arc<Mutex<PeerTable>>,
    activity: Activity,
    shutdown: watch::Receiver<bool>,
}

impl Transport {
    pub fn new(
        driver: Arc<dyn MeshDriver>,
        config: Arc<Config>,
        activity: Activity,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let peers = PeerTable::new(config.mesh.peer_capacity);
        Transport {
            driver,
            config,
            topology: Arc::new(Mutex::new(TopologyState::default())),
            peers: Arc::new(Mutex::new(peers)),
            activity,
            shutdown,
        }
    }

    /// Current topology view, cheap enough to call per HTTP request.
    pub fn topology(&self) -> TopologyState {
        self.topology.lock().expect("topology mutex poisoned").clone()
    }

    /// Shared handle for consumers that resolve routing per request.
    pub fn topology_handle(&self) -> Arc<Mutex<TopologyState>> {
        self.topology.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer mutex poisoned").len()
    }

    /// Spawn the control, TX and RX loops. Returns immediately; the loops
    /// run until the shutdown watch flips.
    pub fn start(&self) {
        let t = self.clone();
        tokio::spawn(async move { t.control_loop().await });
        let t = self.clone();
        tokio::spawn(async move { t.tx_loop().await });
        let t = self.clone();
        tokio::spawn(async move { t.rx_loop().await });
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn publish_link(&self) {
        let topo = self.topology();
        self.activity.set_link(topo.role, topo.layer, topo.connected);
    }

    /// State machine: scan and join while disconnected, field link events
    /// while connected.
    async fn control_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut pending_parent: Option<ParentChoice> = None;

        let ssid = self.config.softap_ssid(self.driver.local_addr());
        match self
            .driver
            .advertise_softap(&ssid, self.config.mesh.max_children)
            .await
        {
            Ok(()) => info!(%ssid, max_children = self.config.mesh.max_children, "softap up"),
            Err(e) => warn!("softap bring-up failed: {e}"),
        }

        loop {
            if self.stopping() {
                break;
            }
            let connected = self.topology().connected;
            if !connected && pending_parent.is_none() {
                match self.try_join().await {
                    Ok(Some(choice)) => pending_parent = Some(choice),
                    Ok(None) => {
                        // Root path completes synchronously.
                        self.publish_link();
                    }
                    Err(e) => {
                        debug!("join attempt failed: {e}");
                        // Keep draining link events while waiting to rescan.
                        let backoff = Duration::from_millis(1000 + rand::random_range(0..1000u64));
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            event = self.driver.next_event() => {
                                match event {
                                    Some(event) => self.handle_event(event, &mut pending_parent),
                                    None => break,
                                }
                            }
                            _ = shutdown.changed() => break,
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                event = self.driver.next_event() => {
                    match event {
                        Some(event) => self.handle_event(event, &mut pending_parent),
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("mesh control loop stopped");
    }

    /// One scan-and-associate attempt. `Ok(Some(choice))` means a parent
    /// association is in flight and its events are still to come.
    async fn try_join(&self) -> Result<Option<ParentChoice>> {
        self.topology
            .lock()
            .expect("topology mutex poisoned")
            .begin_scanning();
        self.publish_link();

        let scans = self.driver.scan().await?;
        {
            let routing = self.driver.routing_table();
            let mut peers = self.peers.lock().expect("peer mutex poisoned");
            peers.observe_scan(&scans, &routing);
            self.activity.set_peer_count(peers.len());
        }

        let router_visible = select_root(&scans, &self.config.router.ssid).is_some();
        if self.config.mesh.pin_root || router_visible {
            if self.config.mesh.pin_root && !router_visible {
                warn!(
                    ssid = %self.config.router.ssid,
                    "pinned root but router not visible, associating anyway"
                );
            }
            self.driver.join_router().await?;
            self.topology
                .lock()
                .expect("topology mutex poisoned")
                .connect_as_root();
            info!("joined as root");
            return Ok(None);
        }

        let choice = select_parent(
            &scans,
            self.config.mesh.rssi_floor_dbm,
            self.config.mesh.max_layer,
        )
        .ok_or_else(|| anyhow::anyhow!("no eligible parent in {} scan results", scans.len()))?;

        info!(parent = %choice.addr, layer = choice.layer, "associating with parent");
        self.driver.join_parent(&choice).await?;
        Ok(Some(choice))
    }

    fn handle_event(&self, event: MeshEvent, pending_parent: &mut Option<ParentChoice>) {
        match event {
            MeshEvent::Started => info!("mesh started"),
            MeshEvent::Stopped => info!("mesh stopped"),
            MeshEvent::ChildConnected(addr) => {
                info!(child = %addr, "child connected");
            }
            MeshEvent::ChildDisconnected(addr) => {
                info!(child = %addr, "child disconnected");
                let mut peers = self.peers.lock().expect("peer mutex poisoned");
                peers.remove(&addr);
                self.activity.set_peer_count(peers.len());
            }
            MeshEvent::ParentConnected { gateway } => {
                if let Some(choice) = pending_parent.take() {
                    self.topology
                        .lock()
                        .expect("topology mutex poisoned")
                        .connect_to_parent(&choice, gateway);
                    info!(parent = %choice.addr, ?gateway, "parent connected");
                } else {
                    warn!("parent connected with no association in flight");
                }
                self.publish_link();
            }
            MeshEvent::ParentDisconnected(reason) => {
                warn!(?reason, "parent disconnected");
                pending_parent.take();
                self.topology
                    .lock()
                    .expect("topology mutex poisoned")
                    .begin_scanning();
                self.publish_link();
            }
            MeshEvent::LayerChanged(layer) => {
                self.topology
                    .lock()
                    .expect("topology mutex poisoned")
                    .set_layer(layer);
                debug!(layer, "layer changed");
                self.publish_link();
            }
            MeshEvent::ScanDone(scans) => {
                let routing = self.driver.routing_table();
                let mut peers = self.peers.lock().expect("peer mutex poisoned");
                peers.observe_scan(&scans, &routing);
                self.activity.set_peer_count(peers.len());
            }
            MeshEvent::RoutingTableChanged => {
                self.activity.set_peer_count(self.peer_count());
            }
        }
    }

    /// Periodic ping sweep over the routing table. The interval check is a
    /// monotonic elapsed comparison, so a slow tick can never skip a round.
    async fn tx_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        let interval = Duration::from_secs(self.config.mesh.ping_interval_secs);
        let now = Instant::now();
        let mut last_ping = now.checked_sub(interval).unwrap_or(now);

        loop {
            // Little to sweep means little reason to wake up often.
            let tick = if self.driver.routing_table().is_empty() {
                TICK * 4
            } else {
                TICK
            };
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => break,
            }
            if self.stopping() {
                break;
            }

            let backlog = self.driver.pending_tx();
            if backlog > 0 {
                debug!(backlog, "frames waiting for air time");
            }

            if !self.topology().connected || last_ping.elapsed() < interval {
                continue;
            }
            last_ping = Instant::now();
            self.ping_sweep().await;
        }
        info!("mesh tx loop stopped");
    }

    async fn ping_sweep(&self) {
        let table = self.driver.routing_table();
        if table.is_empty() {
            // Nobody routed yet; a broadcast lets neighbours learn us.
            if let Err(e) = self.driver.send_to(None, Packet::ping().encode()).await {
                debug!("broadcast ping failed: {e}");
            }
            return;
        }

        for addr in table {
            match self.driver.send_to(Some(addr), Packet::ping().encode()).await {
                Ok(()) => {
                    let mut peers = self.peers.lock().expect("peer mutex poisoned");
                    peers.mark_ping_sent(addr, Instant::now());
                }
                Err(e) => {
                    debug!(peer = %addr, "ping send failed: {e}");
                    let mut peers = self.peers.lock().expect("peer mutex poisoned");
                    if peers.record_send_failure(addr) {
                        warn!(peer = %addr, "peer dropped after repeated send failures");
                    }
                    self.activity.set_peer_count(peers.len());
                }
            }
        }
        self.activity.set_peer_count(self.peer_count());
    }

    /// Inbound frame pump: answer pings, settle pongs into RTT samples.
    async fn rx_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if self.stopping() {
                break;
            }
            let frame = tokio::select! {
                frame = self.driver.recv(TICK) => frame,
                _ = shutdown.changed() => break,
            };
            let (from, frame) = match frame {
                Ok(Some(pair)) => pair,
                Ok(None) => continue,
                Err(e) => {
                    warn!("mesh receive error: {e}");
                    tokio::time::sleep(TICK).await;
                    continue;
                }
            };
            let packet = match Packet::decode(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(peer = %from, "dropping malformed frame: {e}");
                    continue;
                }
            };
            match packet.kind {
                PacketKind::Ping => {
                    // Reply even to senders we have not scanned yet; the
                    // pong is how they learn we are reachable.
                    if let Err(e) = self.driver.send_to(Some(from), Packet::pong().encode()).await {
                        debug!(peer = %from, "pong send failed: {e}");
                        let mut peers = self.peers.lock().expect("peer mutex poisoned");
                        peers.record_send_failure(from);
                    }
                }
                PacketKind::Pong => {
                    let rtt = {
                        let mut peers = self.peers.lock().expect("peer mutex poisoned");
                        let rtt = peers.record_pong(from, Instant::now());
                        self.activity.set_peer_count(peers.len());
                        rtt
                    };
                    if let Some(rtt) = rtt {
                        debug!(peer = %from, rtt_ms = rtt.as_millis() as u64, "pong");
                        self.activity.record_rtt(rtt);
                    }
                }
            }
        }
        info!("mesh rx loop stopped");
    }
}

/// In-process driver used where no radio exists: unit tests and dev runs.
/// Frames sent through it land in an outbox the harness can drain; inbound
/// frames and events are injected through channels.
pub struct SimDriver {
    addr: MeshAddress,
    softap: Mutex<Option<(String, u8)>>,
    scans: Mutex<Vec<ScanResult>>,
    routing: Mutex<Vec<MeshAddress>>,
    outbox_tx: mpsc::UnboundedSender<(Option<MeshAddress>, Bytes)>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(MeshAddress, Bytes)>>,
    event_tx: mpsc::UnboundedSender<MeshEvent>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MeshEvent>>,
}

/// Harness side of a [`SimDriver`]: inject traffic, observe sends.
pub struct SimHandle {
    pub outbox: mpsc::UnboundedReceiver<(Option<MeshAddress>, Bytes)>,
    inbox_tx: mpsc::UnboundedSender<(MeshAddress, Bytes)>,
    event_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl SimHandle {
    pub fn inject_frame(&self, from: MeshAddress, frame: Bytes) {
        let _ = self.inbox_tx.send((from, frame));
    }

    pub fn inject_event(&self, event: MeshEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl SimDriver {
    pub fn new(addr: MeshAddress) -> (Arc<Self>, SimHandle) {
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = Arc::new(SimDriver {
            addr,
            softap: Mutex::new(None),
            scans: Mutex::new(Vec::new()),
            routing: Mutex::new(Vec::new()),
            outbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            event_tx: event_tx.clone(),
            event_rx: tokio::sync::Mutex::new(event_rx),
        });
        let handle = SimHandle {
            outbox,
            inbox_tx,
            event_tx,
        };
        (driver, handle)
    }

    pub fn set_scan_results(&self, scans: Vec<ScanResult>) {
        *self.scans.lock().expect("sim scan mutex poisoned") = scans;
    }

    pub fn set_routing_table(&self, routing: Vec<MeshAddress>) {
        *self.routing.lock().expect("sim routing mutex poisoned") = routing;
    }

    /// SSID and child cap last passed to `advertise_softap`, if any.
    pub fn advertised_softap(&self) -> Option<(String, u8)> {
        self.softap.lock().expect("sim softap mutex poisoned").clone()
    }
}

#[async_trait]
impl MeshDriver for SimDriver {
    fn local_addr(&self) -> MeshAddress {
        self.addr
    }

    async fn advertise_softap(&self, ssid: &str, max_children: u8) -> Result<()> {
        *self.softap.lock().expect("sim softap mutex poisoned") =
            Some((ssid.to_string(), max_children));
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<ScanResult>> {
        Ok(self.scans.lock().expect("sim scan mutex poisoned").clone())
    }

    async fn join_router(&self) -> Result<()> {
        let _ = self.event_tx.send(MeshEvent::Started);
        let _ = self.event_tx.send(MeshEvent::LayerChanged(0));
        Ok(())
    }

    async fn join_parent(&self, choice: &ParentChoice) -> Result<()> {
        {
            let mut routing = self.routing.lock().expect("sim routing mutex poisoned");
            if !routing.contains(&choice.addr) {
                routing.push(choice.addr);
            }
        }
        let _ = self.event_tx.send(MeshEvent::ParentConnected {
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
        });
        let _ = self.event_tx.send(MeshEvent::LayerChanged(choice.layer));
        Ok(())
    }

    async fn send_to(&self, dest: Option<MeshAddress>, frame: Bytes) -> Result<()> {
        self.outbox_tx
            .send((dest, frame))
            .map_err(|_| anyhow::anyhow!("sim outbox closed"))
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<(MeshAddress, Bytes)>> {
        let mut inbox = self.inbox_rx.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(pair)) => Ok(Some(pair)),
            Ok(None) => Err(anyhow::anyhow!("sim inbox closed")),
            Err(_) => Ok(None),
        }
    }

    async fn next_event(&self) -> Option<MeshEvent> {
        self.event_rx.lock().await.recv().await
    }

    fn routing_table(&self) -> Vec<MeshAddress> {
        self.routing.lock().expect("sim routing mutex poisoned").clone()
    }

    fn pending_tx(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeRole;

    fn addr(last: u8) -> MeshAddress {
        MeshAddress([0x02, 0, 0, 0, 0, last])
    }

    fn mesh_ap(last: u8, rssi: i8, layer: i32, capacity: u8) -> ScanResult {
        ScanResult {
            addr: addr(last),
            ssid: format!("meshcache_0000{last:02x}"),
            rssi_dbm: rssi,
            layer: Some(layer),
            child_capacity: Some(capacity),
        }
    }

    fn transport_with_sim(config: Config) -> (Transport, SimHandle, watch::Sender<bool>) {
        let (driver, handle) = SimDriver::new(addr(0xaa));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::new(
            driver,
            Arc::new(config),
            Activity::new(),
            shutdown_rx,
        );
        (transport, handle, shutdown_tx)
    }

    async fn next_unicast(
        handle: &mut SimHandle,
    ) -> (Option<MeshAddress>, Packet) {
        let (dest, frame) = tokio::time::timeout(Duration::from_secs(5), handle.outbox.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbox closed");
        (dest, Packet::decode(&frame).expect("sent frame must decode"))
    }

    #[tokio::test]
    async fn startup_advertises_softap_with_child_cap() {
        let (driver, _handle) = SimDriver::new(addr(0xaa));
        let config = Config::for_testing();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::new(
            driver.clone(),
            Arc::new(config.clone()),
            Activity::new(),
            shutdown_rx,
        );
        transport.start();

        let mut advertised = None;
        for _ in 0..100 {
            advertised = driver.advertised_softap();
            if advertised.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (ssid, cap) = advertised.expect("softap never advertised");
        assert_eq!(ssid, config.softap_ssid(addr(0xaa)));
        assert_eq!(cap, config.mesh.max_children);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong_even_from_stranger() {
        let (transport, mut handle, _shutdown) = transport_with_sim(Config::for_testing());
        transport.start();

        let stranger = addr(0x99);
        handle.inject_frame(stranger, Packet::ping().encode());

        let (dest, packet) = next_unicast(&mut handle).await;
        assert_eq!(dest, Some(stranger));
        assert_eq!(packet.kind, PacketKind::Pong);
        // Answering a ping does not put the sender in the table.
        assert_eq!(transport.peer_count(), 0);
    }

    #[tokio::test]
    async fn pong_settles_rtt_for_pinged_peer() {
        let (transport, handle, _shutdown) = transport_with_sim(Config::for_testing());
        let peer = addr(0x10);
        {
            let mut peers = transport.peers.lock().unwrap();
            peers.mark_ping_sent(peer, Instant::now() - Duration::from_millis(40));
        }
        transport.start();

        handle.inject_frame(peer, Packet::pong().encode());
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(p) = transport.peers.lock().unwrap().get(&peer) {
                    if let Some(rtt) = p.rtt {
                        assert!(rtt >= Duration::from_millis(40));
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rtt never recorded");
        assert!(transport.activity.snapshot().avg_rtt_ms.is_some());
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_reply() {
        let (transport, mut handle, _shutdown) = transport_with_sim(Config::for_testing());
        transport.start();

        handle.inject_frame(addr(0x11), Bytes::new());
        handle.inject_frame(addr(0x11), Packet::ping().encode());

        // Only the valid ping earns a reply.
        let (dest, packet) = next_unicast(&mut handle).await;
        assert_eq!(dest, Some(addr(0x11)));
        assert_eq!(packet.kind, PacketKind::Pong);
    }

    #[tokio::test]
    async fn router_in_scan_makes_node_root() {
        let (driver, _handle) = SimDriver::new(addr(0xaa));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::new(
            driver.clone(),
            Arc::new(Config::for_testing()),
            Activity::new(),
            shutdown_rx,
        );
        driver.set_scan_results(vec![ScanResult {
            addr: addr(0x01),
            ssid: "testnet".into(),
            rssi_dbm: -50,
            layer: None,
            child_capacity: None,
        }]);
        transport.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let topo = transport.topology();
                if topo.connected && topo.role == NodeRole::Root {
                    assert_eq!(topo.layer, 0);
                    assert!(topo.parent.is_none());
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("never became root");
    }

    #[tokio::test]
    async fn mesh_ap_in_scan_makes_node_child() {
        let config = Config::for_testing();
        let (driver, handle) = SimDriver::new(addr(0xaa));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::new(
            driver.clone(),
            Arc::new(config),
            Activity::new(),
            shutdown_rx,
        );
        driver.set_scan_results(vec![mesh_ap(0x01, -55, 1, 4)]);
        transport.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let topo = transport.topology();
                if topo.connected {
                    assert_eq!(topo.role, NodeRole::Node);
                    assert_eq!(topo.layer, 2);
                    assert_eq!(topo.parent, Some(addr(0x01)));
                    assert_eq!(topo.parent_gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("never joined parent");
        drop(handle);
    }

    #[tokio::test]
    async fn driver_scan_results_refresh_the_peer_table() {
        let (driver, handle) = SimDriver::new(addr(0xaa));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::new(
            driver.clone(),
            Arc::new(Config::for_testing()),
            Activity::new(),
            shutdown_rx,
        );
        driver.set_scan_results(vec![ScanResult {
            addr: addr(0x01),
            ssid: "testnet".into(),
            rssi_dbm: -50,
            layer: None,
            child_capacity: None,
        }]);
        driver.set_routing_table(vec![addr(0x05)]);
        transport.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !transport.topology().connected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("never became root");

        handle.inject_event(MeshEvent::ScanDone(vec![mesh_ap(0x05, -48, 2, 3)]));
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.peer_count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("scan results never reached the peer table");
        assert_eq!(
            transport.peers.lock().unwrap().get(&addr(0x05)).unwrap().rssi_dbm,
            -48
        );
    }

    #[tokio::test]
    async fn child_disconnect_removes_peer_immediately() {
        let (transport, handle, _shutdown) = transport_with_sim(Config::for_testing());
        let child = addr(0x22);
        {
            let mut peers = transport.peers.lock().unwrap();
            peers.record_pong(child, Instant::now());
        }
        assert_eq!(transport.peer_count(), 1);
        transport.start();

        handle.inject_event(MeshEvent::ChildDisconnected(child));
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.peer_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer was not removed");
    }

    #[tokio::test]
    async fn parent_loss_returns_node_to_scanning() {
        let config = Config::for_testing();
        let (driver, handle) = SimDriver::new(addr(0xaa));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::new(
            driver.clone(),
            Arc::new(config),
            Activity::new(),
            shutdown_rx,
        );
        driver.set_scan_results(vec![mesh_ap(0x01, -55, 1, 4)]);
        transport.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !transport.topology().connected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("never joined");

        handle.inject_event(MeshEvent::ParentDisconnected(DisconnectReason::LinkLost));
        // The scan results still list the parent, so the node rejoins.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let topo = transport.topology();
                if topo.connected && topo.parent == Some(addr(0x01)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("never rejoined after disconnect");
    }
}
