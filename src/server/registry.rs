use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use super::session::{Outbound, PushedChange, SessionOutbox};

#[derive(Debug)]
struct Slot {
    peer: SocketAddr,
    /// Set once the client holds a snapshot and can take pushed changes.
    outbox: Option<SessionOutbox>,
}

/// Bounded set of control sessions currently attached to the server.
#[derive(Debug)]
pub struct ClientRegistry {
    capacity: usize,
    clients: Mutex<BTreeMap<u64, Slot>>,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            clients: Mutex::new(BTreeMap::new()),
        })
    }

    fn clients(&self) -> MutexGuard<'_, BTreeMap<u64, Slot>> {
        // Nothing panics while holding the lock, but a poisoned map is still usable.
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims a slot for connection `id`. Returns `None` when full.
    ///
    /// The slot is released when the returned registration is dropped.
    pub fn register(self: &Arc<Self>, id: u64, peer: SocketAddr) -> Option<Registration> {
        let mut clients = self.clients();
        if clients.len() >= self.capacity {
            return None;
        }
        clients.insert(id, Slot { peer, outbox: None });
        info!(
            "Registered client {} from {} ({}/{})",
            id,
            peer,
            clients.len(),
            self.capacity
        );
        Some(Registration {
            registry: self.clone(),
            id,
        })
    }

    /// Starts passing changes on to session `id`.
    pub(crate) fn subscribe(&self, id: u64, outbox: SessionOutbox) -> bool {
        match self.clients().get_mut(&id) {
            Some(slot) => {
                slot.outbox = Some(outbox);
                true
            }
            None => false,
        }
    }

    /// Whether any subscribed session other than `origin` would get a push.
    pub fn has_subscribers(&self, origin: Option<u64>) -> bool {
        self.clients()
            .iter()
            .any(|(id, slot)| Some(*id) != origin && slot.outbox.is_some())
    }

    /// Queues `change` for every subscribed session except `origin`.
    ///
    /// Never waits: a session whose queue is full has fallen behind and is
    /// disconnected. Returns how many sessions got the change.
    pub(crate) fn broadcast(&self, origin: Option<u64>, change: Arc<PushedChange>) -> usize {
        let mut delivered = 0;
        for (id, slot) in self.clients().iter_mut() {
            if Some(*id) == origin {
                continue;
            }
            let Some(outbox) = &slot.outbox else {
                continue;
            };
            let lost = match outbox.tx.try_send(Outbound::Push(change.clone())) {
                Ok(()) => {
                    delivered += 1;
                    false
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Client {} at {} fell behind, disconnecting it", id, slot.peer);
                    outbox.kick.cancel();
                    true
                }
                Err(TrySendError::Closed(_)) => true,
            };
            if lost {
                slot.outbox = None;
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.clients().values().map(|slot| slot.peer).collect()
    }
}

#[derive(Debug)]
pub struct Registration {
    registry: Arc<ClientRegistry>,
    id: u64,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(slot) = self.registry.clients().remove(&self.id) {
            info!("Unregistered client {} from {}", self.id, slot.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::ChangeEvent;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn outbox(depth: usize) -> (SessionOutbox, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth);
        let outbox = SessionOutbox {
            tx,
            kick: CancellationToken::new(),
        };
        (outbox, rx)
    }

    fn pushed(path: &str) -> Arc<PushedChange> {
        Arc::new(PushedChange {
            event: ChangeEvent::deleted(path),
            content: None,
        })
    }

    #[test]
    fn rejects_beyond_capacity() {
        let registry = ClientRegistry::new(2);
        let a = registry.register(1, peer(1000)).unwrap();
        let _b = registry.register(2, peer(1001)).unwrap();
        assert!(registry.register(3, peer(1002)).is_none());
        assert_eq!(registry.len(), 2);

        drop(a);
        assert_eq!(registry.len(), 1);
        let c = registry.register(4, peer(1003)).unwrap();
        assert_eq!(c.id(), 4);
        assert_eq!(registry.peers(), vec![peer(1001), peer(1003)]);
    }

    #[test]
    fn zero_capacity_admits_nobody() {
        let registry = ClientRegistry::new(0);
        assert!(registry.register(1, peer(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_skips_the_origin_and_unsubscribed_sessions() {
        let registry = ClientRegistry::new(4);
        let _a = registry.register(1, peer(1)).unwrap();
        let _b = registry.register(2, peer(2)).unwrap();
        let _c = registry.register(3, peer(3)).unwrap();
        let (box_a, mut rx_a) = outbox(4);
        let (box_b, mut rx_b) = outbox(4);
        assert!(registry.subscribe(1, box_a));
        assert!(registry.subscribe(2, box_b));
        assert!(!registry.subscribe(9, outbox(1).0));

        assert!(registry.has_subscribers(Some(1)));
        assert_eq!(registry.broadcast(Some(1), pushed("x.txt")), 1);
        assert!(rx_a.try_recv().is_err());
        match rx_b.try_recv() {
            Ok(Outbound::Push(change)) => assert_eq!(change.event.path, "x.txt"),
            other => panic!("expected a push, got {other:?}"),
        }
    }

    #[test]
    fn a_session_that_falls_behind_is_kicked() {
        let registry = ClientRegistry::new(2);
        let _a = registry.register(1, peer(1)).unwrap();
        let (slow, _rx) = outbox(1);
        let kick = slow.kick.clone();
        registry.subscribe(1, slow);

        assert_eq!(registry.broadcast(None, pushed("one")), 1);
        assert_eq!(registry.broadcast(None, pushed("two")), 0);
        assert!(kick.is_cancelled());
        assert!(!registry.has_subscribers(None));
    }

    #[test]
    fn departed_sessions_get_nothing() {
        let registry = ClientRegistry::new(2);
        let a = registry.register(1, peer(1)).unwrap();
        let (box_a, rx_a) = outbox(4);
        registry.subscribe(1, box_a);
        drop(rx_a);
        assert_eq!(registry.broadcast(None, pushed("x")), 0);
        drop(a);
        assert!(!registry.has_subscribers(None));
    }
}
