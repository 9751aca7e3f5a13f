//! The bidirectional, echo-safe synchronizer between the local element
//! store and the shared element collection.
//!
//! Echo safety is structural, with three independent guards:
//! the `applying_remote`/`applying_local` flags form a mutual guard
//! between the two halves, transaction origin tags short-circuit the
//! observers for the bridge's own writes, and a pointer check on the
//! last pushed element list elides identity-preserving notifications.

use crate::codec::{decode_element, encode_element, incremental_update};
use crate::debounce::Debouncer;
use crate::element::{compare_sort_order, Element};
use crate::store::{ElementStore, StoreSubscription};
use easel_crdt::{Doc, EntryChanges, FieldChanges, Origin, Subscription};
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The deep-observer coalesce window: one frame, deliberately
/// independent of the local debounce interval.
const COALESCE_WINDOW: Duration = Duration::from_millis(16);

/// Raises a flag for the current scope; clears it again on every exit
/// path, panics included.
struct Raised<'a>(&'a AtomicBool);

impl<'a> Raised<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for Raised<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct BridgeShared {
    doc: Doc,
    applying_remote: AtomicBool,
    applying_local: AtomicBool,
    last_elements: Mutex<Arc<Vec<Element>>>,
    dirty: Mutex<FnvHashSet<String>>,
    local_debounce: Debouncer,
    coalesce: Debouncer,
    store: Mutex<Option<ElementStore>>,
    debounce: Mutex<Duration>,
}

impl BridgeShared {
    fn store(&self) -> Option<ElementStore> {
        self.store.lock().clone()
    }
}

/// Couples one [`ElementStore`] to one [`Doc`] and keeps them converged.
pub struct SyncBridge {
    shared: Arc<BridgeShared>,
    doc_subs: Mutex<Vec<Subscription>>,
    store_sub: Mutex<Option<StoreSubscription>>,
    running: AtomicBool,
}

impl SyncBridge {
    /// Creates a bridge over a document; no syncing happens until
    /// [`SyncBridge::start`].
    pub fn new(doc: Doc) -> Self {
        Self {
            shared: Arc::new(BridgeShared {
                doc,
                applying_remote: AtomicBool::new(false),
                applying_local: AtomicBool::new(false),
                last_elements: Mutex::new(Arc::new(Vec::new())),
                dirty: Mutex::new(FnvHashSet::default()),
                local_debounce: Debouncer::new(),
                coalesce: Debouncer::new(),
                store: Mutex::new(None),
                debounce: Mutex::new(Duration::from_millis(50)),
            }),
            doc_subs: Mutex::new(Vec::new()),
            store_sub: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Begins bidirectional sync against a store. Restarts cleanly when
    /// already running.
    pub fn start(&self, store: &ElementStore, debounce: Duration) {
        if self.running.load(Ordering::SeqCst) {
            self.stop();
        }
        self.running.store(true, Ordering::SeqCst);
        *self.shared.store.lock() = Some(store.clone());
        *self.shared.debounce.lock() = debounce;

        // initial reconciliation: a non-empty shared collection wins;
        // otherwise a non-empty local list seeds it
        if !self.shared.doc.is_empty() {
            let working = project(&self.shared.doc);
            push_to_store(&self.shared, store, working);
        } else {
            let elements = store.state().elements;
            if !elements.is_empty() {
                let _guard = Raised::new(&self.shared.applying_local);
                *self.shared.last_elements.lock() = elements.clone();
                self.shared.doc.transact(Origin::LocalInit, |txn| {
                    for element in elements.iter() {
                        encode_element(txn, element);
                    }
                });
            }
        }

        // remote -> local: whole-entry changes
        let shared = self.shared.clone();
        let entry_sub = self
            .shared
            .doc
            .observe(move |changes| on_entry_changes(&shared, changes));

        // remote -> local: field-level changes, coalesced one frame
        let shared = self.shared.clone();
        let field_sub = self
            .shared
            .doc
            .observe_deep(move |changes| on_field_changes(&shared, changes));
        self.doc_subs.lock().extend([entry_sub, field_sub]);

        // local -> remote: debounced store subscription
        let shared = self.shared.clone();
        let sub = store.subscribe(move |current, _previous| {
            if shared.applying_remote.load(Ordering::SeqCst) {
                return;
            }
            if Arc::ptr_eq(&current.elements, &shared.last_elements.lock()) {
                return;
            }
            let delay = *shared.debounce.lock();
            let inner = shared.clone();
            shared
                .local_debounce
                .arm(delay, move || sync_local_to_remote(&inner));
        });
        *self.store_sub.lock() = Some(sub);
        tracing::debug!("sync bridge started");
    }

    /// Detaches observers, cancels pending timers and clears state.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.doc_subs.lock().clear();
        *self.store_sub.lock() = None;
        self.shared.local_debounce.cancel();
        self.shared.coalesce.cancel();
        self.shared.dirty.lock().clear();
        *self.shared.store.lock() = None;
        self.shared.applying_remote.store(false, Ordering::SeqCst);
        self.shared.applying_local.store(false, Ordering::SeqCst);
        *self.shared.last_elements.lock() = Arc::new(Vec::new());
        tracing::debug!("sync bridge stopped");
    }

    /// True between [`SyncBridge::start`] and [`SyncBridge::stop`].
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True while the bridge is pushing a remote change into the store.
    /// Store listeners use this to tell remote-driven updates from local
    /// ones.
    pub fn is_applying_remote(&self) -> bool {
        self.shared.applying_remote.load(Ordering::SeqCst)
    }

    /// The element list the bridge last exchanged with the store.
    pub fn last_elements(&self) -> Arc<Vec<Element>> {
        self.shared.last_elements.lock().clone()
    }

    /// Runs the pending local flush immediately instead of waiting for
    /// the debounce window.
    pub fn flush_local(&self) {
        self.shared.local_debounce.cancel();
        sync_local_to_remote(&self.shared);
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Projects the whole shared collection into an ordered element list.
fn project(doc: &Doc) -> Vec<Element> {
    let mut elements: Vec<Element> = doc
        .ids_in_insertion_order()
        .iter()
        .filter_map(|id| doc.snapshot(id))
        .filter_map(|record| decode_element(&record))
        .collect();
    elements.sort_by(compare_sort_order);
    elements
}

/// Re-sorts, records, and pushes a working list into the store with the
/// remote flag raised.
fn push_to_store(shared: &Arc<BridgeShared>, store: &ElementStore, mut working: Vec<Element>) {
    working.sort_by(compare_sort_order);
    let elements = Arc::new(working);
    *shared.last_elements.lock() = elements.clone();
    let _guard = Raised::new(&shared.applying_remote);
    store.set_elements(elements);
}

fn on_entry_changes(shared: &Arc<BridgeShared>, changes: &EntryChanges) {
    if changes.origin.is_local_sync() || shared.applying_local.load(Ordering::SeqCst) {
        return;
    }
    let Some(store) = shared.store() else { return };
    let previous = shared.last_elements.lock().clone();
    let mut by_id: FnvHashMap<String, Element> = previous
        .iter()
        .map(|element| (element.id.clone(), element.clone()))
        .collect();
    for id in changes.added.iter().chain(changes.updated.iter()) {
        let Some(record) = shared.doc.snapshot(id) else {
            continue;
        };
        let Some(element) = decode_element(&record) else {
            continue;
        };
        by_id.insert(id.clone(), element);
    }
    for id in changes.removed.iter() {
        by_id.remove(id);
    }
    // rebuild in the collection's creation order so every replica
    // projects the same sequence for elements without a sort key
    let mut working = Vec::with_capacity(by_id.len());
    for id in shared.doc.ids_in_insertion_order() {
        if let Some(element) = by_id.remove(&id) {
            working.push(element);
        }
    }
    // local elements still waiting on the debounce keep their place
    for element in previous.iter() {
        if let Some(element) = by_id.remove(&element.id) {
            working.push(element);
        }
    }
    working.sort_by(compare_sort_order);
    if working != *previous {
        push_to_store(shared, &store, working);
    }
}

fn on_field_changes(shared: &Arc<BridgeShared>, changes: &FieldChanges) {
    if changes.origin.is_local_sync() || shared.applying_local.load(Ordering::SeqCst) {
        return;
    }
    shared
        .dirty
        .lock()
        .extend(changes.changes.iter().map(|(id, _)| id.clone()));
    let inner = shared.clone();
    shared
        .coalesce
        .arm(COALESCE_WINDOW, move || flush_dirty(&inner));
}

/// Re-decodes every dirty record and replaces it in the working list.
fn flush_dirty(shared: &Arc<BridgeShared>) {
    let dirty: Vec<String> = shared.dirty.lock().drain().collect();
    if dirty.is_empty() {
        return;
    }
    let Some(store) = shared.store() else { return };
    let mut working: Vec<Element> = (**shared.last_elements.lock()).clone();
    let mut changed = false;
    for id in dirty {
        let Some(element) = shared
            .doc
            .snapshot(&id)
            .and_then(|record| decode_element(&record))
        else {
            continue;
        };
        if let Some(slot) = working.iter_mut().find(|e| e.id == id) {
            if *slot != element {
                *slot = element;
                changed = true;
            }
        }
    }
    if changed {
        push_to_store(shared, &store, working);
    }
}

/// Mirrors the store's element list into the shared collection in one
/// atomic transaction: deletes records of vanished elements, encodes new
/// ones in full, and diffs existing ones field by field.
fn sync_local_to_remote(shared: &Arc<BridgeShared>) {
    let Some(store) = shared.store() else { return };
    let elements = store.state().elements;
    let _guard = Raised::new(&shared.applying_local);
    *shared.last_elements.lock() = elements.clone();
    let existing = shared.doc.ids_in_insertion_order();
    shared.doc.transact(Origin::LocalSync, |txn| {
        let keep: FnvHashSet<&str> = elements.iter().map(|e| e.id.as_str()).collect();
        for id in existing.iter() {
            if !keep.contains(id.as_str()) {
                txn.remove_record(id);
            }
        }
        for element in elements.iter() {
            if txn.contains(&element.id) {
                incremental_update(txn, element);
            } else {
                encode_element(txn, element);
            }
        }
    });
}
