//! # easel
//!
//! The core of a real-time collaborative drawing canvas: a reactive
//! element store, a replicated element collection (see [`easel_crdt`]),
//! and the echo-safe sync bridge that keeps the two converged across
//! peers, plus the provider/awareness/worker plumbing around them.
//!
//! The typical host wires things up through a [`CollaborationManager`]:
//!
//! ```no_run
//! use easel::{CollabConfig, CollaborationManager, ElementStore, UserInfo};
//! use std::time::Duration;
//!
//! let store = ElementStore::new();
//! let manager = CollaborationManager::new();
//! let user = UserInfo {
//!     id: "u1".into(),
//!     name: "ada".into(),
//!     color: "#0af".into(),
//!     avatar: None,
//! };
//! manager
//!     .connect(&CollabConfig::new("ws://localhost:4040", "sketch", user))
//!     .unwrap();
//! manager.start_sync(&store, Duration::from_millis(50));
//! ```
//!
//! Hosts that want the session off the UI thread use [`WorkerBridge`]
//! instead, which speaks the same protocol over a pair of channels.
#![deny(missing_docs)]
mod awareness;
mod bridge;
mod codec;
mod config;
mod debounce;
mod element;
mod fields;
mod manager;
mod provider;
mod store;
mod transport;
mod worker;

pub use crate::awareness::{
    Awareness, AwarenessPatch, AwarenessState, AwarenessSubscription, PeerState, WeakAwareness,
    AWARENESS_TIMEOUT,
};
pub use crate::bridge::SyncBridge;
pub use crate::codec::{decode_element, encode_element, incremental_update};
pub use crate::config::{CollabConfig, UserInfo};
pub use crate::debounce::Debouncer;
pub use crate::element::{
    compare_sort_order, Binding, ConnectorShape, Crop, Element, ElementKind, Point, Style,
    Viewport,
};
pub use crate::fields::{kind_fields, STRUCTURAL_FIELDS, STYLE_FIELDS, STYLE_PREFIX, SYNC_FIELDS};
pub use crate::manager::{global, CollaborationManager};
pub use crate::provider::Provider;
pub use crate::store::{ElementStore, StoreState, StoreSubscription};
pub use crate::transport::{
    CommandSender, Status, StatusSubscription, Transport, WireMessage,
};
pub use crate::worker::{WorkerBridge, WorkerEvent, WorkerRequest};
pub use easel_crdt::{ActorId, Delta, Doc, Origin, SortKey, Value};
