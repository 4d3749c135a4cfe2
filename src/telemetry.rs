use crate::topology::NodeRole;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// RTT samples kept for the rolling average.
const RTT_WINDOW: usize = 16;

/// Shared, cloneable view of node health. Loops push updates in, the status
/// surface and the heartbeat logger read snapshots out via a watch channel.
#[derive(Clone)]
pub struct Activity {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    tx: watch::Sender<ActivitySnapshot>,
}

struct State {
    rtt_ms: Vec<f32>,
    next_slot: usize,
    role: NodeRole,
    layer: i32,
    connected: bool,
    peer_count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ActivitySnapshot {
    pub role: NodeRole,
    pub layer: i32,
    pub connected: bool,
    pub peer_count: usize,
    /// Rolling average over the last [`RTT_WINDOW`] pings, None until the
    /// first pong lands.
    pub avg_rtt_ms: Option<f32>,
}

impl Default for ActivitySnapshot {
    fn default() -> Self {
        ActivitySnapshot {
            role: NodeRole::Idle,
            layer: crate::topology::LAYER_UNSET,
            connected: false,
            peer_count: 0,
            avg_rtt_ms: None,
        }
    }
}

impl Activity {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ActivitySnapshot::default());
        Activity {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    rtt_ms: Vec::with_capacity(RTT_WINDOW),
                    next_slot: 0,
                    role: NodeRole::Idle,
                    layer: crate::topology::LAYER_UNSET,
                    connected: false,
                    peer_count: 0,
                }),
                tx,
            }),
        }
    }

    pub fn record_rtt(&self, rtt: Duration) {
        let ms = rtt.as_secs_f32() * 1000.0;
        self.update(|state| {
            if state.rtt_ms.len() < RTT_WINDOW {
                state.rtt_ms.push(ms);
            } else {
                state.rtt_ms[state.next_slot] = ms;
            }
            state.next_slot = (state.next_slot + 1) % RTT_WINDOW;
        });
    }

    pub fn set_link(&self, role: NodeRole, layer: i32, connected: bool) {
        self.update(|state| {
            state.role = role;
            state.layer = layer;
            state.connected = connected;
            if !connected {
                state.rtt_ms.clear();
                state.next_slot = 0;
            }
        });
    }

    pub fn set_peer_count(&self, count: usize) {
        self.update(|state| state.peer_count = count);
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let state = self.inner.state.lock().expect("activity mutex poisoned");
        snapshot_from(&state)
    }

    /// Watch handle for anything that wants to react to status changes
    /// without polling.
    pub fn subscribe(&self) -> watch::Receiver<ActivitySnapshot> {
        self.inner.tx.subscribe()
    }

    fn update(&self, apply: impl FnOnce(&mut State)) {
        let mut state = self.inner.state.lock().expect("activity mutex poisoned");
        apply(&mut state);
        let _ = self.inner.tx.send(snapshot_from(&state));
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_from(state: &State) -> ActivitySnapshot {
    let avg_rtt_ms = if state.rtt_ms.is_empty() {
        None
    } else {
        Some(state.rtt_ms.iter().sum::<f32>() / state.rtt_ms.len() as f32)
    };
    ActivitySnapshot {
        role: state.role,
        layer: state.layer,
        connected: state.connected,
        peer_count: state.peer_count,
        avg_rtt_ms,
    }
}
