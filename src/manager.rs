use crate::awareness::{AwarenessPatch, PeerState};
use crate::bridge::SyncBridge;
use crate::config::CollabConfig;
use crate::provider::Provider;
use crate::store::ElementStore;
use crate::transport::{Status, StatusSubscription};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// The instance-based facade over provider, bridge and awareness.
///
/// One manager hosts one session at a time; multiple canvases hold
/// multiple managers. Misuse (syncing before connecting) is logged and
/// ignored rather than surfaced as a panic: the UI keeps running, just
/// not collaboratively.
#[derive(Default)]
pub struct CollaborationManager {
    provider: Mutex<Option<Arc<Provider>>>,
    bridge: Mutex<Option<Arc<SyncBridge>>>,
}

impl CollaborationManager {
    /// Creates an idle manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session; an existing one is disposed first.
    pub fn connect(&self, config: &CollabConfig) -> Result<()> {
        self.dispose();
        let provider = Provider::connect(config)?;
        *self.provider.lock() = Some(Arc::new(provider));
        Ok(())
    }

    /// Starts bidirectional sync between the session document and a
    /// store. A no-op (with a log line) when not connected.
    pub fn start_sync(&self, store: &ElementStore, debounce: Duration) {
        let Some(provider) = self.provider.lock().clone() else {
            tracing::warn!("start_sync called before connect, ignoring");
            return;
        };
        let mut slot = self.bridge.lock();
        let bridge = slot
            .get_or_insert_with(|| Arc::new(SyncBridge::new(provider.elements())))
            .clone();
        drop(slot);
        bridge.start(store, debounce);
    }

    /// Stops the bridge; the session stays up.
    pub fn stop_sync(&self) {
        if let Some(bridge) = self.bridge.lock().as_ref() {
            bridge.stop();
        }
    }

    /// Merges a partial update into the local awareness record.
    pub fn update_awareness(&self, patch: &AwarenessPatch) {
        if let Some(provider) = self.provider.lock().as_ref() {
            provider.awareness().update_local(patch);
        }
    }

    /// The remote peers of the current session.
    pub fn remote_awareness(&self) -> Vec<PeerState> {
        self.provider
            .lock()
            .as_ref()
            .map(|provider| provider.awareness().remote_states())
            .unwrap_or_default()
    }

    /// Current transport status; `Disconnected` without a session.
    pub fn status(&self) -> Status {
        self.provider
            .lock()
            .as_ref()
            .map(|provider| provider.status())
            .unwrap_or(Status::Disconnected)
    }

    /// True while the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Registers a status listener with the current session.
    pub fn on_status_change(
        &self,
        f: impl Fn(Status) + Send + Sync + 'static,
    ) -> Option<StatusSubscription> {
        self.provider
            .lock()
            .as_ref()
            .map(|provider| provider.on_status_change(f))
    }

    /// Stops syncing and tears the session down.
    pub fn dispose(&self) {
        if let Some(bridge) = self.bridge.lock().take() {
            bridge.stop();
        }
        if let Some(provider) = self.provider.lock().take() {
            provider.dispose();
        }
    }
}

impl Drop for CollaborationManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The optional process-wide manager, for hosts with a single canvas.
/// It is nothing more than a shared slot holding the same type the
/// instance-based API hands out.
pub fn global() -> &'static CollaborationManager {
    static GLOBAL: OnceLock<CollaborationManager> = OnceLock::new();
    GLOBAL.get_or_init(CollaborationManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_before_connect_is_ignored() {
        let manager = CollaborationManager::new();
        let store = ElementStore::new();
        manager.start_sync(&store, Duration::from_millis(50));
        assert!(!manager.is_connected());
        assert_eq!(manager.status(), Status::Disconnected);
        assert!(manager.remote_awareness().is_empty());
        manager.stop_sync();
        manager.dispose();
    }

    #[test]
    fn global_slot_returns_the_same_manager() {
        let a = global() as *const CollaborationManager;
        let b = global() as *const CollaborationManager;
        assert_eq!(a, b);
    }
}
