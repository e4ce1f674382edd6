//! Connection and subscription registry with bounded outbound queues.
//!
//! Delivery is message passing: the matcher never touches a socket. Each
//! connection owns an [`Outbound`] queue that its writer task drains, so a
//! slow consumer can only ever hurt itself.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use serde_json::json;
use tokio::sync::Notify;

use crate::config::SlowPolicy;
use crate::event::Event;
use crate::filter::Filter;

/// Opaque identifier for one client connection.
pub type ConnId = u64;

/// Frame queued for delivery to one client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutFrame {
    Event { sub_id: String, event: Event },
    Ok { event_id: String, accepted: bool, message: String },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
}

impl OutFrame {
    /// Encode as a NIP-01 JSON array frame.
    pub fn to_json(&self) -> String {
        match self {
            OutFrame::Event { sub_id, event } => json!(["EVENT", sub_id, event]).to_string(),
            OutFrame::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]).to_string(),
            OutFrame::Eose { sub_id } => json!(["EOSE", sub_id]).to_string(),
            OutFrame::Closed { sub_id, message } => {
                json!(["CLOSED", sub_id, message]).to_string()
            }
            OutFrame::Notice { message } => json!(["NOTICE", message]).to_string(),
        }
    }
}

/// Bounded outbound queue for a single connection.
pub struct Outbound {
    capacity: usize,
    policy: SlowPolicy,
    state: Mutex<OutboundState>,
    notify: Notify,
}

struct OutboundState {
    queue: VecDeque<OutFrame>,
    dropped: u64,
    closed: bool,
}

impl Outbound {
    fn new(capacity: usize, policy: SlowPolicy) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            policy,
            state: Mutex::new(OutboundState {
                queue: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Queue a frame. Returns `false` when the connection should be dropped
    /// (queue closed, or overflow under the disconnect policy).
    pub fn push(&self, frame: OutFrame) -> bool {
        {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return false;
            }
            if st.queue.len() >= self.capacity {
                match self.policy {
                    SlowPolicy::DropOldest => {
                        st.queue.pop_front();
                        st.dropped += 1;
                    }
                    SlowPolicy::Disconnect => {
                        st.closed = true;
                        st.queue.clear();
                        drop(st);
                        self.notify.notify_one();
                        return false;
                    }
                }
            }
            st.queue.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Take the next frame without waiting.
    ///
    /// When frames were evicted under drop-oldest since the last call, the
    /// gap is surfaced first as a `NOTICE` so the client knows it missed data.
    pub fn try_next(&self) -> Option<OutFrame> {
        let mut st = self.state.lock().unwrap();
        if st.dropped > 0 {
            let n = st.dropped;
            st.dropped = 0;
            return Some(OutFrame::Notice {
                message: format!("slow consumer: {n} frames dropped"),
            });
        }
        st.queue.pop_front()
    }

    /// Wait for the next frame; `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<OutFrame> {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.try_next() {
                return Some(frame);
            }
            if self.is_closed() {
                return self.try_next();
            }
            notified.await;
        }
    }

    /// Close the queue, waking the writer.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

/// Per-connection state: its queue and its named subscriptions.
pub(crate) struct ConnState {
    pub(crate) outbound: Arc<Outbound>,
    pub(crate) subs: HashMap<String, Vec<Filter>>,
}

pub(crate) type ConnMap = HashMap<ConnId, ConnState>;

/// Registry of live connections and their subscriptions.
///
/// The connection map's mutex doubles as the write-serialization point for
/// publish and subscribe critical sections (see `relay.rs`), which is what
/// makes the insertion point linearizable with respect to fan-out.
pub struct Registry {
    conns: Mutex<ConnMap>,
    next_id: AtomicU64,
    queue_capacity: usize,
    policy: SlowPolicy,
}

impl Registry {
    pub fn new(queue_capacity: usize, policy: SlowPolicy) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
            policy,
        }
    }

    /// Register a new connection and hand back its outbound queue.
    pub fn connect(&self) -> (ConnId, Arc<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outbound = Outbound::new(self.queue_capacity, self.policy);
        self.conns.lock().unwrap().insert(
            id,
            ConnState {
                outbound: outbound.clone(),
                subs: HashMap::new(),
            },
        );
        (id, outbound)
    }

    /// Drop a connection and all subscriptions it owns.
    pub fn disconnect(&self, conn: ConnId) {
        if let Some(state) = self.conns.lock().unwrap().remove(&conn) {
            state.outbound.close();
        }
    }

    /// Remove one subscription. Closing an unknown id is a no-op.
    pub fn close(&self, conn: ConnId, sub_id: &str) -> bool {
        let mut conns = self.conns.lock().unwrap();
        conns
            .get_mut(&conn)
            .map(|state| state.subs.remove(sub_id).is_some())
            .unwrap_or(false)
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnMap> {
        self.conns.lock().unwrap()
    }

    /// Deliver an event to every matching subscription in the map.
    ///
    /// Connections whose queue refuses the frame are removed on the spot.
    pub(crate) fn fan_out(conns: &mut ConnMap, ev: &Event) {
        let mut dead = Vec::new();
        'conn: for (id, state) in conns.iter() {
            for (sub_id, filters) in &state.subs {
                if filters.iter().any(|f| f.matches(ev)) {
                    let delivered = state.outbound.push(OutFrame::Event {
                        sub_id: sub_id.clone(),
                        event: ev.clone(),
                    });
                    if !delivered {
                        dead.push(*id);
                        continue 'conn;
                    }
                }
            }
        }
        for id in dead {
            if let Some(state) = conns.remove(&id) {
                state.outbound.close();
            }
        }
    }
}
