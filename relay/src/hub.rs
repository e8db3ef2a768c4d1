use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mjpeg_relay_common::frame::Frame;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub type ClientId = u64;

struct ClientSlot {
    tx: mpsc::Sender<Frame>,
    peer: String,
}

struct Clients {
    slots: HashMap<ClientId, ClientSlot>,
    /// Set by `close_all`; later registrations get an already-closed queue.
    closed: bool,
}

/// Receiving end of one viewer's frame queue.
#[derive(Debug)]
pub struct ClientSubscription {
    id: ClientId,
    rx: mpsc::Receiver<Frame>,
}

impl ClientSubscription {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Next frame for this client. `None` once the hub has dropped the client.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

/// Fans frames out to every registered viewer.
///
/// Each client owns a bounded queue drained by its connection task. A broadcast
/// only ever `try_send`s, so a stalled socket can not hold up ingestion: a
/// client whose queue is full or closed is removed on the spot.
pub struct BroadcastHub {
    clients: Mutex<Clients>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(Clients {
                slots: HashMap::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Add a client. It receives frames broadcast from now on, not earlier ones.
    pub fn register(&self, peer: impl Into<String>) -> ClientSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = peer.into();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut clients = self.lock();
        if clients.closed {
            debug!(client = id, peer, "hub closed, rejecting client");
            return ClientSubscription { id, rx };
        }
        clients.slots.insert(id, ClientSlot { tx, peer: peer.clone() });
        info!(client = id, peer, clients = clients.slots.len(), "client registered");
        ClientSubscription { id, rx }
    }

    /// Remove a client. Returns false if it was not registered.
    pub fn unregister(&self, id: ClientId) -> bool {
        let mut clients = self.lock();
        match clients.slots.remove(&id) {
            Some(slot) => {
                info!(
                    client = id,
                    peer = slot.peer,
                    clients = clients.slots.len(),
                    "client unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Queue `frame` for every client and return how many accepted it.
    ///
    /// Delivery failures are never returned to the caller; the failing client
    /// is dropped from the set instead.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let mut clients = self.lock();
        if clients.slots.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        clients.slots.retain(|id, slot| match slot.tx.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    client = *id,
                    peer = slot.peer,
                    "client queue full, dropping slow client"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                info!(client = *id, peer = slot.peer, "client gone, removing");
                false
            }
        });
        delivered
    }

    /// Drop every client and refuse new ones. Connection tasks see their queue
    /// end and close their sockets.
    pub fn close_all(&self) -> usize {
        let mut clients = self.lock();
        clients.closed = true;
        let count = clients.slots.len();
        clients.slots.clear();
        if count > 0 {
            info!(clients = count, "closed all clients");
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.lock().slots.contains_key(&id)
    }

    fn lock(&self) -> MutexGuard<'_, Clients> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(n: u16) -> Frame {
        let [hi, lo] = n.to_be_bytes();
        Frame::from_jpeg(vec![0xFF, 0xD8, hi, lo, 0xFF, 0xD9]).unwrap()
    }

    fn number(frame: &Frame) -> u16 {
        let b = frame.as_bytes();
        u16::from_be_bytes([b[2], b[3]])
    }

    fn drain(sub: &mut ClientSubscription) -> Vec<u16> {
        std::iter::from_fn(|| sub.try_recv()).map(|f| number(&f)).collect()
    }

    #[test]
    fn every_client_gets_every_frame_in_order() {
        let hub = BroadcastHub::new(64);
        let mut subs: Vec<_> = (0..5).map(|i| hub.register(format!("peer-{i}"))).collect();
        for n in 0..20 {
            assert_eq!(hub.broadcast(&frame(n)), 5);
        }
        let expected: Vec<u16> = (0..20).collect();
        for sub in &mut subs {
            assert_eq!(drain(sub), expected);
        }
    }

    #[test]
    fn late_client_does_not_see_earlier_frames() {
        let hub = BroadcastHub::new(8);
        let mut early = hub.register("early");
        hub.broadcast(&frame(1));
        let mut late = hub.register("late");
        hub.broadcast(&frame(2));
        assert_eq!(drain(&mut early), vec![1, 2]);
        assert_eq!(drain(&mut late), vec![2]);
    }

    #[test]
    fn closed_client_is_removed_and_skipped() {
        let hub = BroadcastHub::new(8);
        let mut alive = hub.register("alive");
        let gone = hub.register("gone");
        let gone_id = gone.id();
        drop(gone);

        assert_eq!(hub.broadcast(&frame(1)), 1);
        assert!(!hub.contains(gone_id));
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.broadcast(&frame(2)), 1);
        assert_eq!(drain(&mut alive), vec![1, 2]);
    }

    #[test]
    fn slow_client_is_dropped_without_blocking_others() {
        let hub = BroadcastHub::new(2);
        let mut slow = hub.register("slow");
        let mut fast = hub.register("fast");

        for n in 0..5 {
            hub.broadcast(&frame(n));
            assert_eq!(drain(&mut fast), vec![n]);
        }
        assert!(!hub.contains(slow.id()));
        assert!(hub.contains(fast.id()));
        // Frames queued before the drop are still readable, then the queue ends.
        assert_eq!(drain(&mut slow), vec![0, 1]);
    }

    #[tokio::test]
    async fn dropped_client_queue_ends() {
        let hub = BroadcastHub::new(1);
        let mut sub = hub.register("slow");
        hub.broadcast(&frame(7));
        hub.broadcast(&frame(8));
        assert_eq!(sub.recv().await.map(|f| number(&f)), Some(7));
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn unregister_is_idempotent() {
        let hub = BroadcastHub::new(4);
        let sub = hub.register("peer");
        assert!(hub.unregister(sub.id()));
        assert!(!hub.unregister(sub.id()));
        assert!(hub.is_empty());
        assert_eq!(hub.broadcast(&frame(1)), 0);
    }

    #[tokio::test]
    async fn close_all_ends_every_queue() {
        let hub = BroadcastHub::new(4);
        let mut a = hub.register("a");
        let mut b = hub.register("b");
        hub.broadcast(&frame(1));
        assert_eq!(hub.close_all(), 2);
        assert!(hub.is_closed());

        assert_eq!(a.recv().await.map(|f| number(&f)), Some(1));
        assert!(a.recv().await.is_none());
        assert_eq!(b.recv().await.map(|f| number(&f)), Some(1));
        assert!(b.recv().await.is_none());

        let mut late = hub.register("late");
        assert!(hub.is_empty());
        assert!(late.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ordering_holds_with_concurrent_churn() {
        const FRAMES: u16 = 500;
        let hub = Arc::new(BroadcastHub::new(FRAMES as usize));
        let steady: Vec<_> = (0..4).map(|i| hub.register(format!("steady-{i}"))).collect();

        let churn = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let mut sub = hub.register(format!("churn-{i}"));
                    tokio::task::yield_now().await;
                    let seen = drain(&mut sub);
                    // Whatever a transient client saw is an in-order run.
                    assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
                    hub.unregister(sub.id());
                }
            })
        };

        let readers: Vec<_> = steady
            .into_iter()
            .map(|mut sub| {
                tokio::spawn(async move {
                    let mut seen = Vec::with_capacity(FRAMES as usize);
                    while seen.len() < FRAMES as usize {
                        match sub.recv().await {
                            Some(f) => seen.push(number(&f)),
                            None => break,
                        }
                    }
                    seen
                })
            })
            .collect();

        let broadcaster = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for n in 0..FRAMES {
                    hub.broadcast(&frame(n));
                    if n % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        broadcaster.await.unwrap();
        churn.await.unwrap();
        let expected: Vec<u16> = (0..FRAMES).collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), expected);
        }
    }
}
