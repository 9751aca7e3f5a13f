//! # The easel replicated element map
//!
//! The shared state of a collaborative canvas is a map from element id to
//! a *record*: a flat set of named scalar registers, one per element
//! field. This crate implements that map as a delta-state CRDT.
//!
//! ## Registers
//! Every field of every record is an independent last-writer-wins
//! register. A write carries a [`Lamport`] timestamp (logical counter
//! plus actor id); between two writes to the same register the greater
//! timestamp wins, and the actor id breaks counter ties, so the order is
//! total and every replica picks the same winner. Writes to distinct
//! fields and distinct records commute trivially.
//!
//! ## Presence
//! Creation and deletion of a record go through one more register per
//! record, the presence register. A record is projected only while its
//! presence is alive; a delete is a tombstone that later creates can
//! override by timestamp. Concurrent delete/update of the same record
//! resolves the same way every other register does.
//!
//! ## Deltas and convergence
//! The unit of replication is a [`Delta`]: the ops produced by one
//! atomic transaction. Applying a delta is idempotent and commutes with
//! applying any other delta, so the transport may duplicate or reorder
//! batches without breaking convergence. A replica that was offline
//! hands its [`StateVector`] to a peer and receives exactly the ops the
//! vector does not cover, tombstones included.
//!
//! ## Ordering
//! Elements carry an optional fractional [`SortKey`]. Where keys are
//! absent, projection falls back to creation order, which is the
//! (total) presence-stamp order and therefore identical on every
//! replica.
#![warn(missing_docs)]
mod clock;
mod delta;
mod doc;
mod fraction;
mod id;
mod state;
mod util;
mod value;

pub use crate::clock::{Lamport, StateVector};
pub use crate::delta::{Delta, Op};
pub use crate::doc::{Doc, EntryChanges, FieldChanges, Origin, Subscription, Txn};
pub use crate::fraction::SortKey;
pub use crate::id::ActorId;
pub use crate::state::{Applied, MapState, RecordState, Register};
pub use crate::util::Ref;
pub use crate::value::Value;
