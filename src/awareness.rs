//! Ephemeral per-peer presence: cursor, selection, active tool.
//!
//! Awareness lives outside the replicated document. Each peer
//! periodically broadcasts its own state under a monotonically growing
//! clock; entries go away when the peer announces a null state or stops
//! refreshing for long enough. Nothing here is persisted.

use crate::config::UserInfo;
use crate::element::{Point, Viewport};
use anyhow::Result;
use bytecheck::CheckBytes;
use easel_crdt::{ActorId, Ref};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Peers without a refresh for this long are considered gone.
pub const AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// The ephemeral state one peer shares with the room.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    /// Who this peer is; entries without it are not shown.
    pub user: Option<UserInfo>,
    /// World-space cursor position, if on canvas.
    pub cursor: Option<Point>,
    /// Ids of the peer's selected elements.
    #[serde(default)]
    pub selected_ids: Vec<String>,
    /// The peer's active tool.
    pub active_tool: Option<String>,
    /// The peer's viewport, for follow-mode UIs.
    pub viewport: Option<Viewport>,
}

/// A partial update merged into the local awareness state. `None` leaves
/// a field untouched; `Some(None)` clears it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessPatch {
    /// New cursor position, or `Some(None)` when leaving the canvas.
    pub cursor: Option<Option<Point>>,
    /// New selection.
    pub selected_ids: Option<Vec<String>>,
    /// New active tool.
    pub active_tool: Option<Option<String>>,
    /// New viewport.
    pub viewport: Option<Option<Viewport>>,
}

/// A remote peer and its current state.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerState {
    /// The peer's replica identity.
    pub actor: ActorId,
    /// The peer's shared state.
    pub state: AwarenessState,
}

/// One peer's entry inside an awareness frame. The state itself is JSON
/// so dynamic-runtime peers can read it without an rkyv decoder.
#[derive(Debug, Archive, RkyvDeserialize, RkyvSerialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
struct FrameEntry {
    actor: u64,
    clock: u32,
    /// JSON-serialized [`AwarenessState`]; `None` announces departure.
    state: Option<String>,
}

/// The wire frame: a batch of peer entries.
#[derive(Debug, Archive, RkyvDeserialize, RkyvSerialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
struct Frame {
    entries: Vec<FrameEntry>,
}

struct PeerEntry {
    state: AwarenessState,
    clock: u32,
    seen: Instant,
}

type ChangeListener = Arc<dyn Fn() + Send + Sync>;
type FrameSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

struct AwarenessInner {
    actor: ActorId,
    local: AwarenessState,
    clock: u32,
    remote: FnvHashMap<u64, PeerEntry>,
    listeners: BTreeMap<u64, ChangeListener>,
    next: u64,
    sink: Option<FrameSink>,
}

/// Keeps an awareness listener registered; dropping it unsubscribes.
pub struct AwarenessSubscription {
    inner: Weak<Mutex<AwarenessInner>>,
    id: u64,
}

impl Drop for AwarenessSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().listeners.remove(&self.id);
        }
    }
}

/// Hosts the local awareness record and mirrors the remote ones.
#[derive(Clone)]
pub struct Awareness {
    inner: Arc<Mutex<AwarenessInner>>,
}

/// A non-owning awareness handle for maintenance tasks; goes dead when
/// the last [`Awareness`] is dropped.
pub struct WeakAwareness {
    inner: Weak<Mutex<AwarenessInner>>,
}

impl WeakAwareness {
    /// Recovers a full handle while the awareness is still alive.
    pub fn upgrade(&self) -> Option<Awareness> {
        self.inner.upgrade().map(|inner| Awareness { inner })
    }
}

impl Awareness {
    /// Creates an awareness host for the given replica identity.
    pub fn new(actor: ActorId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AwarenessInner {
                actor,
                local: AwarenessState::default(),
                clock: 0,
                remote: FnvHashMap::default(),
                listeners: BTreeMap::new(),
                next: 0,
                sink: None,
            })),
        }
    }

    /// Installs the sink that receives every locally produced frame.
    pub fn set_sink(&self, sink: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.inner.lock().sink = Some(Arc::new(sink));
    }

    /// Replaces the whole local state and broadcasts it.
    pub fn set_local(&self, state: AwarenessState) {
        let (frame, sink) = {
            let mut inner = self.inner.lock();
            inner.local = state;
            inner.clock += 1;
            (encode_local(&inner), inner.sink.clone())
        };
        self.notify();
        if let Some(sink) = sink {
            sink(frame);
        }
    }

    /// Merges a partial update into the local state and broadcasts it.
    pub fn update_local(&self, patch: &AwarenessPatch) {
        let (frame, sink) = {
            let mut inner = self.inner.lock();
            if let Some(cursor) = &patch.cursor {
                inner.local.cursor = *cursor;
            }
            if let Some(selected) = &patch.selected_ids {
                inner.local.selected_ids = selected.clone();
            }
            if let Some(tool) = &patch.active_tool {
                inner.local.active_tool = tool.clone();
            }
            if let Some(viewport) = &patch.viewport {
                inner.local.viewport = *viewport;
            }
            inner.clock += 1;
            (encode_local(&inner), inner.sink.clone())
        };
        self.notify();
        if let Some(sink) = sink {
            sink(frame);
        }
    }

    /// Announces departure: broadcasts a null state and resets local
    /// fields.
    pub fn clear_local(&self) {
        let (frame, sink) = {
            let mut inner = self.inner.lock();
            inner.local = AwarenessState::default();
            inner.clock += 1;
            let frame = Frame {
                entries: vec![FrameEntry {
                    actor: inner.actor.get(),
                    clock: inner.clock,
                    state: None,
                }],
            };
            (Ref::archive(&frame).into_bytes(), inner.sink.clone())
        };
        if let Some(sink) = sink {
            sink(frame);
        }
    }

    /// Rebroadcasts the local state under a fresh clock so idle peers
    /// are not aged out by remote staleness pruning.
    pub fn refresh(&self) {
        let (frame, sink) = {
            let mut inner = self.inner.lock();
            inner.clock += 1;
            (encode_local(&inner), inner.sink.clone())
        };
        if let Some(sink) = sink {
            sink(frame);
        }
    }

    /// The local state.
    pub fn local(&self) -> AwarenessState {
        self.inner.lock().local.clone()
    }

    /// Every remote peer that has announced a user, excluding ourselves.
    pub fn remote_states(&self) -> Vec<PeerState> {
        let inner = self.inner.lock();
        let mut peers: Vec<PeerState> = inner
            .remote
            .iter()
            .filter(|(_, entry)| entry.state.user.is_some())
            .map(|(&actor, entry)| PeerState {
                actor: ActorId::new(actor),
                state: entry.state.clone(),
            })
            .collect();
        peers.sort_by_key(|peer| peer.actor);
        peers
    }

    /// Ingests an awareness frame received from the transport.
    pub fn apply_frame(&self, bytes: &[u8]) -> Result<()> {
        let frame = Ref::<Frame>::checked(bytes)?.to_owned()?;
        let mut changed = false;
        {
            let mut inner = self.inner.lock();
            let local_actor = inner.actor.get();
            for entry in frame.entries {
                if entry.actor == local_actor {
                    continue;
                }
                if let Some(existing) = inner.remote.get(&entry.actor) {
                    if existing.clock >= entry.clock {
                        continue;
                    }
                }
                match entry.state {
                    Some(json) => match serde_json::from_str::<AwarenessState>(&json) {
                        Ok(state) => {
                            inner.remote.insert(
                                entry.actor,
                                PeerEntry {
                                    state,
                                    clock: entry.clock,
                                    seen: Instant::now(),
                                },
                            );
                            changed = true;
                        }
                        Err(err) => {
                            tracing::debug!("malformed awareness state: {}", err);
                        }
                    },
                    None => {
                        changed |= inner.remote.remove(&entry.actor).is_some();
                    }
                }
            }
        }
        if changed {
            self.notify();
        }
        Ok(())
    }

    /// Encodes the local state as a frame for (re)broadcast.
    pub fn local_frame(&self) -> Vec<u8> {
        encode_local(&self.inner.lock())
    }

    /// Drops peers that have not refreshed within `max_age`.
    pub fn prune(&self, max_age: Duration) {
        let changed = {
            let mut inner = self.inner.lock();
            let before = inner.remote.len();
            inner.remote.retain(|_, entry| entry.seen.elapsed() < max_age);
            inner.remote.len() != before
        };
        if changed {
            self.notify();
        }
    }

    /// Returns a non-owning handle.
    pub fn downgrade(&self) -> WeakAwareness {
        WeakAwareness {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a listener fired after every awareness change.
    pub fn on_change(&self, f: impl Fn() + Send + Sync + 'static) -> AwarenessSubscription {
        let mut inner = self.inner.lock();
        let id = inner.next;
        inner.next += 1;
        inner.listeners.insert(id, Arc::new(f));
        AwarenessSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn notify(&self) {
        let listeners: Vec<ChangeListener> =
            self.inner.lock().listeners.values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }
}

fn encode_local(inner: &AwarenessInner) -> Vec<u8> {
    let json = serde_json::to_string(&inner.local).unwrap_or_else(|_| "{}".to_owned());
    let frame = Frame {
        entries: vec![FrameEntry {
            actor: inner.actor.get(),
            clock: inner.clock,
            state: Some(json),
        }],
    };
    Ref::archive(&frame).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserInfo {
        UserInfo {
            id: name.to_owned(),
            name: name.to_owned(),
            color: "#0af".to_owned(),
            avatar: None,
        }
    }

    fn linked_pair() -> (Awareness, Awareness) {
        let a = Awareness::new(ActorId::new(1));
        let b = Awareness::new(ActorId::new(2));
        let to_b = b.clone();
        a.set_sink(move |frame| {
            to_b.apply_frame(&frame).unwrap();
        });
        let to_a = a.clone();
        b.set_sink(move |frame| {
            to_a.apply_frame(&frame).unwrap();
        });
        (a, b)
    }

    #[test]
    fn updates_reach_the_peer() {
        let (a, b) = linked_pair();
        a.set_local(AwarenessState {
            user: Some(user("ada")),
            cursor: Some(Point::new(10.0, 20.0)),
            ..AwarenessState::default()
        });
        let peers = b.remote_states();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].actor, ActorId::new(1));
        assert_eq!(peers[0].state.cursor, Some(Point::new(10.0, 20.0)));
        // the sender never lists itself
        assert!(a.remote_states().is_empty());
    }

    #[test]
    fn entries_without_user_are_hidden() {
        let (a, b) = linked_pair();
        a.update_local(&AwarenessPatch {
            cursor: Some(Some(Point::new(1.0, 1.0))),
            ..AwarenessPatch::default()
        });
        assert!(b.remote_states().is_empty());
    }

    #[test]
    fn stale_clocks_are_ignored() {
        let a = Awareness::new(ActorId::new(1));
        let b = Awareness::new(ActorId::new(2));
        a.set_local(AwarenessState {
            user: Some(user("ada")),
            ..AwarenessState::default()
        });
        let newer = a.local_frame();
        b.apply_frame(&newer).unwrap();
        // a frame from the past must not roll the entry back
        let old = Frame {
            entries: vec![FrameEntry {
                actor: 1,
                clock: 0,
                state: Some("{\"user\":null}".to_owned()),
            }],
        };
        b.apply_frame(Ref::archive(&old).as_bytes()).unwrap();
        assert_eq!(b.remote_states().len(), 1);
    }

    #[test]
    fn departure_removes_the_peer() {
        let (a, b) = linked_pair();
        a.set_local(AwarenessState {
            user: Some(user("ada")),
            ..AwarenessState::default()
        });
        assert_eq!(b.remote_states().len(), 1);
        a.clear_local();
        assert!(b.remote_states().is_empty());
    }

    #[test]
    fn patch_merges_partially() {
        let a = Awareness::new(ActorId::new(1));
        a.set_local(AwarenessState {
            user: Some(user("ada")),
            cursor: Some(Point::new(5.0, 5.0)),
            ..AwarenessState::default()
        });
        a.update_local(&AwarenessPatch {
            selected_ids: Some(vec!["e1".to_owned()]),
            ..AwarenessPatch::default()
        });
        let local = a.local();
        assert_eq!(local.cursor, Some(Point::new(5.0, 5.0)));
        assert_eq!(local.selected_ids, vec!["e1".to_owned()]);
    }
}
