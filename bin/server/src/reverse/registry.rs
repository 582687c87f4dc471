use std::{collections::HashMap, sync::Arc};

use derive_more::derive::{Display, From};
use parking_lot::Mutex;
use protocol::ForwardKey;
use tokio::sync::oneshot;

/// Generation of one listener, so a stale accept task never removes its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, From, Display)]
#[display("listener-{_0:016x}")]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

/// Control side of one running reverse listener.
///
/// Dropping the handle stops the accept task; [`ListenerHandle::close`] also waits until the socket is released.
pub struct ListenerHandle {
    close_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

/// Accept-task side of a [`ListenerHandle`].
pub struct ListenerSignal {
    pub close_rx: oneshot::Receiver<()>,
    pub done_tx: oneshot::Sender<()>,
}

impl ListenerHandle {
    pub fn pair() -> (Self, ListenerSignal) {
        let (close_tx, close_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        (Self { close_tx, done_rx }, ListenerSignal { close_rx, done_tx })
    }

    pub async fn close(self) {
        let Self { close_tx, done_rx } = self;
        drop(close_tx);
        let _ = done_rx.await;
    }
}

struct ListenerEntry {
    id: ListenerId,
    handle: ListenerHandle,
}

/// Reverse listeners of one SSH connection, keyed by bind address and bound port.
#[derive(Clone, Default)]
pub struct ForwardRegistry {
    listeners: Arc<Mutex<HashMap<ForwardKey, ListenerEntry>>>,
}

impl ForwardRegistry {
    /// Returns the previous listener of the same key, which the caller must close.
    pub fn register(&self, key: ForwardKey, id: ListenerId, handle: ListenerHandle) -> Option<ListenerHandle> {
        let old = self.listeners.lock().insert(key.clone(), ListenerEntry { id, handle });
        old.map(|entry| {
            log::warn!("[ForwardRegistry] replace listener {key}, old listener {} will close", entry.id);
            entry.handle
        })
    }

    pub fn contains(&self, key: &ForwardKey) -> bool {
        self.listeners.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    pub fn unregister(&self, key: &ForwardKey) -> Option<ListenerHandle> {
        self.listeners.lock().remove(key).map(|entry| entry.handle)
    }

    /// Remove `key` only while it still belongs to listener `id`.
    pub fn unregister_if(&self, key: &ForwardKey, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.get(key).is_some_and(|entry| entry.id == id) {
            listeners.remove(key);
            return true;
        }
        false
    }

    pub fn drain(&self) -> Vec<(ForwardKey, ListenerHandle)> {
        self.listeners.lock().drain().map(|(key, entry)| (key, entry.handle)).collect()
    }
}

#[cfg(test)]
mod tests {
    use protocol::ForwardKey;
    use test_log::test;

    use super::{ForwardRegistry, ListenerHandle, ListenerId};

    #[test]
    fn unregister_is_idempotent() {
        let registry = ForwardRegistry::default();
        let key = ForwardKey::new("127.0.0.1", 9000);
        let (handle, _signal) = ListenerHandle::pair();
        assert!(registry.register(key.clone(), ListenerId::from(1), handle).is_none());
        assert!(registry.contains(&key));

        assert!(registry.unregister(&key).is_some());
        assert!(registry.unregister(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_owner_does_not_remove_new_entry() {
        let registry = ForwardRegistry::default();
        let key = ForwardKey::new("", 9001);
        let (first, _first_signal) = ListenerHandle::pair();
        registry.register(key.clone(), ListenerId::from(1), first);
        let (second, _second_signal) = ListenerHandle::pair();
        assert!(registry.register(key.clone(), ListenerId::from(2), second).is_some());

        assert!(!registry.unregister_if(&key, ListenerId::from(1)));
        assert!(registry.contains(&key));
        assert!(registry.unregister_if(&key, ListenerId::from(2)));
        assert!(!registry.contains(&key));
    }

    #[test(tokio::test)]
    async fn close_waits_for_accept_side() {
        let (handle, signal) = ListenerHandle::pair();
        let task = tokio::spawn(async move {
            let _ = signal.close_rx.await;
            signal.done_tx.send(()).expect("should notify");
        });
        handle.close().await;
        task.await.expect("should join");
    }

    #[test]
    fn drain_returns_everything() {
        let registry = ForwardRegistry::default();
        for port in 0..3 {
            let (handle, _signal) = ListenerHandle::pair();
            registry.register(ForwardKey::new("127.0.0.1", 7000 + port), ListenerId::from(port as u64), handle);
        }
        assert_eq!(registry.drain().len(), 3);
        assert_eq!(registry.len(), 0);
    }
}
