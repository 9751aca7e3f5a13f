//! Off-main-thread hosting of the provider and sync bridge.
//!
//! The UI side holds a [`WorkerBridge`] and exchanges plain message
//! enums with a dedicated background thread; element lists cross the
//! boundary whole, which keeps the protocol small. Everything the
//! background handler can get wrong is caught at the router and comes
//! back as [`WorkerEvent::Error`].

use crate::awareness::{AwarenessPatch, PeerState};
use crate::bridge::SyncBridge;
use crate::config::CollabConfig;
use crate::element::Element;
use crate::provider::Provider;
use crate::store::{ElementStore, StoreSubscription};
use crate::transport::Status;
use anyhow::Result;
use futures::channel::mpsc;
use futures::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Messages from the UI context to the background context.
#[derive(Debug)]
pub enum WorkerRequest {
    /// Construct the provider and start syncing.
    Connect {
        /// Session configuration.
        config: CollabConfig,
    },
    /// Tear the session down.
    Disconnect,
    /// An element list as the store would have emitted it; feeds the
    /// bridge's local-to-remote half.
    LocalUpdate {
        /// The full current element list.
        elements: Vec<Element>,
    },
    /// Merge into the local awareness record.
    Awareness(AwarenessPatch),
}

/// Messages from the background context to the UI context.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Forwarded transport status.
    Status(Status),
    /// The full projected element list after a remote change.
    RemoteUpdate {
        /// The new element list.
        elements: Vec<Element>,
    },
    /// The room's remote peers after an awareness change.
    Peers(Vec<PeerState>),
    /// A background failure, stringly surfaced.
    Error(String),
}

/// The UI-side handle to the background sync context.
pub struct WorkerBridge {
    tx: mpsc::UnboundedSender<WorkerRequest>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerBridge {
    /// Spawns the background thread. On spawn failure the returned
    /// bridge is inert and the event channel reports `Disconnected`;
    /// callers fall back to hosting the bridge on their own thread.
    pub fn spawn() -> (WorkerBridge, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (req_tx, req_rx) = mpsc::unbounded();
        let (ev_tx, ev_rx) = mpsc::unbounded();
        let spawned = std::thread::Builder::new()
            .name("easel-worker".to_owned())
            .spawn({
                let ev_tx = ev_tx.clone();
                move || async_global_executor::block_on(router(req_rx, ev_tx))
            });
        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!("worker thread creation failed: {}", err);
                ev_tx.unbounded_send(WorkerEvent::Status(Status::Disconnected)).ok();
                None
            }
        };
        (
            WorkerBridge {
                tx: req_tx,
                thread,
            },
            ev_rx,
        )
    }

    /// True when the background thread is running.
    pub fn is_alive(&self) -> bool {
        self.thread.is_some()
    }

    /// Sends a raw request.
    pub fn send(&self, request: WorkerRequest) {
        self.tx.unbounded_send(request).ok();
    }

    /// Starts a session.
    pub fn connect(&self, config: CollabConfig) {
        self.send(WorkerRequest::Connect { config });
    }

    /// Ends the session.
    pub fn disconnect(&self) {
        self.send(WorkerRequest::Disconnect);
    }

    /// Feeds a local element list to the bridge.
    pub fn local_update(&self, elements: Vec<Element>) {
        self.send(WorkerRequest::LocalUpdate { elements });
    }

    /// Merges into the local awareness record.
    pub fn awareness(&self, patch: AwarenessPatch) {
        self.send(WorkerRequest::Awareness(patch));
    }

    /// Stops the background thread and waits for it to finish.
    pub fn shutdown(mut self) {
        self.disconnect();
        self.tx.close_channel();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

struct WorkerSession {
    provider: Provider,
    store: ElementStore,
    bridge: Arc<SyncBridge>,
    _store_sub: StoreSubscription,
    _status_sub: crate::transport::StatusSubscription,
    _awareness_sub: crate::awareness::AwarenessSubscription,
}

impl WorkerSession {
    fn teardown(self) {
        self.bridge.stop();
        self.provider.dispose();
    }
}

async fn router(
    mut rx: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut session: Option<WorkerSession> = None;
    while let Some(request) = rx.next().await {
        let outcome = catch_unwind(AssertUnwindSafe(|| handle(&mut session, request, &events)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                events
                    .unbounded_send(WorkerEvent::Error(format!("{:#}", err)))
                    .ok();
            }
            Err(_) => {
                events
                    .unbounded_send(WorkerEvent::Error("background handler panicked".to_owned()))
                    .ok();
            }
        }
    }
    if let Some(session) = session.take() {
        session.teardown();
    }
}

fn handle(
    session: &mut Option<WorkerSession>,
    request: WorkerRequest,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> Result<()> {
    match request {
        WorkerRequest::Connect { config } => {
            if let Some(previous) = session.take() {
                previous.teardown();
            }
            let provider = Provider::connect(&config)?;
            let store = ElementStore::new();
            let bridge = Arc::new(SyncBridge::new(provider.elements()));
            bridge.start(&store, Duration::from_millis(config.sync_debounce_ms));

            let status_events = events.clone();
            let status_sub = provider.on_status_change(move |status| {
                status_events
                    .unbounded_send(WorkerEvent::Status(status))
                    .ok();
            });
            events
                .unbounded_send(WorkerEvent::Status(provider.status()))
                .ok();

            // remote-driven store changes go back whole; the bridge's
            // flag tells them apart from local-update echoes
            let remote_events = events.clone();
            let watcher = bridge.clone();
            let store_sub = store.subscribe(move |current, _previous| {
                if watcher.is_applying_remote() {
                    remote_events
                        .unbounded_send(WorkerEvent::RemoteUpdate {
                            elements: (*current.elements).clone(),
                        })
                        .ok();
                }
            });

            let peer_events = events.clone();
            let awareness = provider.awareness().clone();
            let awareness_sub = provider.awareness().on_change(move || {
                peer_events
                    .unbounded_send(WorkerEvent::Peers(awareness.remote_states()))
                    .ok();
            });

            if !provider.doc().is_empty() {
                events
                    .unbounded_send(WorkerEvent::RemoteUpdate {
                        elements: (*bridge.last_elements()).clone(),
                    })
                    .ok();
            }

            *session = Some(WorkerSession {
                provider,
                store,
                bridge,
                _store_sub: store_sub,
                _status_sub: status_sub,
                _awareness_sub: awareness_sub,
            });
        }
        WorkerRequest::Disconnect => {
            if let Some(previous) = session.take() {
                previous.teardown();
            }
            events
                .unbounded_send(WorkerEvent::Status(Status::Disconnected))
                .ok();
        }
        WorkerRequest::LocalUpdate { elements } => {
            if let Some(session) = session.as_ref() {
                session.store.set_elements(Arc::new(elements));
            } else {
                tracing::debug!("local-update before connect, dropped");
            }
        }
        WorkerRequest::Awareness(patch) => {
            if let Some(session) = session.as_ref() {
                session.provider.awareness().update_local(&patch);
            }
        }
    }
    Ok(())
}
