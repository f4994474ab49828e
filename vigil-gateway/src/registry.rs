//! Live sessions, keyed by client name.
//!
//! At most one session per client name (I4): registering a name a second
//! time replaces the previous handle, which ends the old session on its next
//! outbound poll. Removal is id-guarded so a finished session never evicts
//! its reconnected successor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use vigil_types::ClientName;

/// Id of one registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(u64);

/// Why a message could not be handed to a session.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// No session is registered under this name.
    NotConnected,
    /// The session existed but its task is gone; the entry was dropped.
    Gone,
}

struct SessionHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<String>,
}

/// Map of live sessions.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<ClientName, SessionHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl SessionRegistry {
    /// Registers a session, replacing any previous one under the same name.
    pub fn register(
        &self,
        client: ClientName,
        outbound: mpsc::UnboundedSender<String>,
    ) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let previous = self
            .sessions
            .lock()
            .insert(client.clone(), SessionHandle { id, outbound });
        if previous.is_some() {
            tracing::info!("replaced live session of '{client}' with a new connection");
        }
        id
    }

    /// Removes the session iff it is still the one identified by `id`.
    pub fn remove(&self, client: &ClientName, id: SessionId) {
        let mut sessions = self.sessions.lock();
        if sessions.get(client).is_some_and(|handle| handle.id == id) {
            sessions.remove(client);
        }
    }

    /// Hands a serialized message to the session of `client`.
    pub fn send_to(&self, client: &ClientName, message: String) -> Result<(), SendError> {
        let mut sessions = self.sessions.lock();
        let Some(handle) = sessions.get(client) else {
            return Err(SendError::NotConnected);
        };
        if handle.outbound.send(message).is_err() {
            sessions.remove(client);
            return Err(SendError::Gone);
        }
        Ok(())
    }

    /// Names of all live sessions.
    pub fn client_names(&self) -> Vec<String> {
        self.sessions
            .lock()
            .keys()
            .map(|name| name.as_str().to_owned())
            .collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> ClientName {
        ClientName::parse(name).unwrap()
    }

    #[test]
    fn register_send_remove() {
        let registry = SessionRegistry::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.register(client("obama"), tx);

        registry.send_to(&client("obama"), "hi".to_owned()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "hi");
        assert_eq!(
            registry.send_to(&client("biden"), "x".to_owned()),
            Err(SendError::NotConnected)
        );

        registry.remove(&client("obama"), id);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_removal_keeps_the_successor() {
        let registry = SessionRegistry::default();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let old_id = registry.register(client("obama"), old_tx);
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        let _new_id = registry.register(client("obama"), new_tx);

        // the old session cleans up late; the new registration must survive
        registry.remove(&client("obama"), old_id);
        registry.send_to(&client("obama"), "still here".to_owned()).unwrap();
        assert_eq!(new_rx.try_recv().unwrap(), "still here");
    }

    #[test]
    fn dead_receiver_is_evicted_on_send() {
        let registry = SessionRegistry::default();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(client("obama"), tx);
        drop(rx);
        assert_eq!(
            registry.send_to(&client("obama"), "x".to_owned()),
            Err(SendError::Gone)
        );
        assert!(registry.is_empty());
    }
}
