use crate::clock::{Lamport, StateVector};
use crate::delta::{Delta, Op};
use crate::id::ActorId;
use crate::state::{Applied, MapState};
use crate::value::Value;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Label attached to a batch of writes, used by observers to tell their
/// own replica's writes from a peer's.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Origin {
    /// The steady-state local-to-remote mirror.
    LocalSync,
    /// The one-shot seeding of an empty shared collection.
    LocalInit,
    /// A delta received from a peer.
    Remote,
    /// An untagged write.
    None,
}

impl Origin {
    /// True for the two local mirror tags.
    pub fn is_local_sync(&self) -> bool {
        matches!(self, Origin::LocalSync | Origin::LocalInit)
    }
}

/// Entry-level changes produced by one transaction or remote delta.
#[derive(Clone, Debug)]
pub struct EntryChanges {
    /// The origin tag of the batch.
    pub origin: Origin,
    /// Ids whose records became alive.
    pub added: Vec<String>,
    /// Ids whose presence was refreshed while already alive.
    pub updated: Vec<String>,
    /// Ids whose records were deleted.
    pub removed: Vec<String>,
}

impl EntryChanges {
    /// True if no entry changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Field-level changes inside records that already existed before the
/// batch; freshly added records are reported through [`EntryChanges`]
/// only.
#[derive(Clone, Debug)]
pub struct FieldChanges {
    /// The origin tag of the batch.
    pub origin: Origin,
    /// `(element id, flattened field name)` pairs.
    pub changes: Vec<(String, String)>,
}

type EntryCallback = Arc<dyn Fn(&EntryChanges) + Send + Sync>;
type FieldCallback = Arc<dyn Fn(&FieldChanges) + Send + Sync>;
type DeltaSink = Arc<dyn Fn(Delta) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next: u64,
    entry: BTreeMap<u64, EntryCallback>,
    field: BTreeMap<u64, FieldCallback>,
}

#[derive(Clone, Copy)]
enum ObserverKind {
    Entry,
    Field,
}

/// Keeps an observer registered; dropping it unsubscribes.
pub struct Subscription {
    doc: Weak<Mutex<DocInner>>,
    id: u64,
    kind: ObserverKind,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.doc.upgrade() {
            let mut inner = inner.lock();
            match self.kind {
                ObserverKind::Entry => {
                    inner.observers.entry.remove(&self.id);
                }
                ObserverKind::Field => {
                    inner.observers.field.remove(&self.id);
                }
            }
        }
    }
}

struct DocInner {
    actor: ActorId,
    counter: u64,
    state: MapState,
    sv: StateVector,
    observers: Observers,
    sink: Option<DeltaSink>,
}

/// A clonable handle to one replicated element collection.
///
/// All writes go through [`Doc::transact`], which stamps them, applies
/// them atomically, and hands the resulting [`Delta`] to the configured
/// sink for broadcast. Remote deltas enter through [`Doc::apply_delta`].
/// Observers are notified once per batch, after the write lock is
/// released, carrying the batch's [`Origin`].
#[derive(Clone)]
pub struct Doc {
    inner: Arc<Mutex<DocInner>>,
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl Doc {
    /// Creates a document with a random actor id.
    pub fn new() -> Self {
        Self::with_actor(ActorId::generate())
    }

    /// Creates a document with a fixed actor id.
    pub fn with_actor(actor: ActorId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DocInner {
                actor,
                counter: 0,
                state: MapState::new(),
                sv: StateVector::new(),
                observers: Observers::default(),
                sink: None,
            })),
        }
    }

    /// The local actor id.
    pub fn actor(&self) -> ActorId {
        self.inner.lock().actor
    }

    /// Runs a batch of writes as one atomic transaction.
    ///
    /// The closure receives a [`Txn`]; reads through it see earlier
    /// writes of the same transaction. Do not call back into the `Doc`
    /// from inside the closure. Observers and the delta sink run after
    /// the transaction commits.
    pub fn transact<R>(&self, origin: Origin, f: impl FnOnce(&mut Txn) -> R) -> R {
        let (result, delta, summary, sink) = {
            let mut inner = self.inner.lock();
            let mut txn = Txn {
                inner: &mut inner,
                delta: Delta::new(),
                changes: TxnChanges::default(),
            };
            let result = f(&mut txn);
            let Txn { delta, changes, .. } = txn;
            for op in delta.ops() {
                inner.sv.observe(op.stamp());
            }
            (result, delta, changes.into_summary(origin), inner.sink.clone())
        };
        self.notify(&summary);
        if !delta.is_empty() && !matches!(origin, Origin::Remote) {
            if let Some(sink) = sink {
                sink(delta);
            }
        }
        result
    }

    /// Applies a delta received from a peer.
    pub fn apply_delta(&self, delta: &Delta) {
        tracing::trace!("applying remote delta with {} ops", delta.len());
        let summary = {
            let mut inner = self.inner.lock();
            let mut changes = TxnChanges::default();
            for op in delta.ops() {
                let applied = inner.state.apply(op);
                changes.record(op, applied);
                inner.sv.observe(op.stamp());
                // keep local stamps ahead of everything we have seen
                if op.stamp().counter > inner.counter {
                    inner.counter = op.stamp().counter;
                }
            }
            changes.into_summary(Origin::Remote)
        };
        self.notify(&summary);
    }

    /// Validates and applies an encoded delta.
    pub fn apply_encoded(&self, bytes: &[u8]) -> Result<()> {
        let delta = Delta::decode(bytes)?;
        self.apply_delta(&delta);
        Ok(())
    }

    /// Registers an entry-level observer (record add/update/remove).
    pub fn observe(&self, f: impl Fn(&EntryChanges) + Send + Sync + 'static) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.observers.next;
        inner.observers.next += 1;
        inner.observers.entry.insert(id, Arc::new(f));
        Subscription {
            doc: Arc::downgrade(&self.inner),
            id,
            kind: ObserverKind::Entry,
        }
    }

    /// Registers a field-level observer (changes inside existing records).
    pub fn observe_deep(&self, f: impl Fn(&FieldChanges) + Send + Sync + 'static) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.observers.next;
        inner.observers.next += 1;
        inner.observers.field.insert(id, Arc::new(f));
        Subscription {
            doc: Arc::downgrade(&self.inner),
            id,
            kind: ObserverKind::Field,
        }
    }

    /// Installs the sink that receives every locally produced delta.
    pub fn set_sink(&self, sink: impl Fn(Delta) + Send + Sync + 'static) {
        self.inner.lock().sink = Some(Arc::new(sink));
    }

    /// Removes the delta sink.
    pub fn clear_sink(&self) {
        self.inner.lock().sink = None;
    }

    /// The per-actor high-water marks of everything this replica holds.
    pub fn state_vector(&self) -> StateVector {
        self.inner.lock().sv.clone()
    }

    /// The ops a peer with the given state vector is missing.
    pub fn diff(&self, sv: &StateVector) -> Delta {
        self.inner.lock().state.diff(sv)
    }

    /// Clones the fields of an alive record.
    pub fn snapshot(&self, id: &str) -> Option<BTreeMap<String, Value>> {
        let inner = self.inner.lock();
        inner.state.get(id).map(|record| record.snapshot())
    }

    /// True if the id maps to an alive record.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().state.contains(id)
    }

    /// True if no record is alive.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().state.is_empty()
    }

    /// Number of alive records.
    pub fn len(&self) -> usize {
        self.inner.lock().state.len()
    }

    /// Ids of alive records in creation order.
    pub fn ids_in_insertion_order(&self) -> Vec<String> {
        self.inner.lock().state.ids_in_insertion_order()
    }

    fn notify(&self, summary: &TxnSummary) {
        // observers run outside the lock so they may read the doc
        if !summary.entries.is_empty() {
            let callbacks: Vec<EntryCallback> = {
                let inner = self.inner.lock();
                inner.observers.entry.values().cloned().collect()
            };
            for cb in callbacks {
                cb(&summary.entries);
            }
        }
        if !summary.fields.changes.is_empty() {
            let callbacks: Vec<FieldCallback> = {
                let inner = self.inner.lock();
                inner.observers.field.values().cloned().collect()
            };
            for cb in callbacks {
                cb(&summary.fields);
            }
        }
    }
}

#[derive(Default)]
struct TxnChanges {
    added: Vec<String>,
    updated: Vec<String>,
    removed: Vec<String>,
    fields: Vec<(String, String)>,
}

impl TxnChanges {
    fn record(&mut self, op: &Op, applied: Applied) {
        match applied {
            Applied::Nothing => {}
            Applied::RecordAdded => self.added.push(op.id().to_owned()),
            Applied::RecordTouched => self.updated.push(op.id().to_owned()),
            Applied::RecordRemoved => self.removed.push(op.id().to_owned()),
            Applied::FieldChanged => {
                if let Op::PutField { id, field, .. } = op {
                    self.fields.push((id.clone(), field.clone()));
                }
            }
        }
    }

    fn into_summary(self, origin: Origin) -> TxnSummary {
        // field writes belonging to records added in this very batch are
        // not "changes inside existing records"
        let fields = self
            .fields
            .into_iter()
            .filter(|(id, _)| !self.added.contains(id))
            .collect();
        TxnSummary {
            entries: EntryChanges {
                origin,
                added: self.added,
                updated: self.updated,
                removed: self.removed,
            },
            fields: FieldChanges {
                origin,
                changes: fields,
            },
        }
    }
}

struct TxnSummary {
    entries: EntryChanges,
    fields: FieldChanges,
}

/// Write access to the document inside one transaction.
pub struct Txn<'a> {
    inner: &'a mut DocInner,
    delta: Delta,
    changes: TxnChanges,
}

impl<'a> Txn<'a> {
    fn next_stamp(&mut self) -> Lamport {
        self.inner.counter += 1;
        Lamport::new(self.inner.counter, self.inner.actor)
    }

    fn apply(&mut self, op: Op) {
        let applied = self.inner.state.apply(&op);
        self.changes.record(&op, applied);
        self.delta.push(op);
    }

    /// Creates (or revives) the record for an element id.
    pub fn put_record(&mut self, id: &str) {
        let stamp = self.next_stamp();
        self.apply(Op::PutRecord {
            id: id.to_owned(),
            stamp,
        });
    }

    /// Writes one field register.
    pub fn put_field(&mut self, id: &str, field: &str, value: impl Into<Value>) {
        let stamp = self.next_stamp();
        self.apply(Op::PutField {
            id: id.to_owned(),
            field: field.to_owned(),
            value: value.into(),
            stamp,
        });
    }

    /// Deletes the record for an element id.
    pub fn remove_record(&mut self, id: &str) {
        let stamp = self.next_stamp();
        self.apply(Op::RemoveRecord {
            id: id.to_owned(),
            stamp,
        });
    }

    /// Reads the current value of a field, seeing earlier writes of this
    /// transaction.
    pub fn field(&self, id: &str, field: &str) -> Option<Value> {
        self.inner
            .state
            .get(id)
            .and_then(|record| record.field(field))
            .cloned()
    }

    /// True if the id maps to an alive record.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.state.contains(id)
    }
}
