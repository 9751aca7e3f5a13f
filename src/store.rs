use crate::element::Element;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// A snapshot of the local canvas state.
///
/// The element list is shared behind an `Arc`: consumers compare list
/// identity by pointer to skip work when a notification carries the
/// list they already know.
#[derive(Clone, Debug, Default)]
pub struct StoreState {
    /// The ordered element list.
    pub elements: Arc<Vec<Element>>,
    /// Ids of currently selected elements.
    pub selected_ids: Vec<String>,
    /// The active tool name, if any.
    pub active_tool: Option<String>,
}

type StoreListener = Arc<dyn Fn(&StoreState, &StoreState) + Send + Sync>;

struct StoreInner {
    state: StoreState,
    listeners: BTreeMap<u64, StoreListener>,
    next: u64,
}

/// Keeps a store listener registered; dropping it unsubscribes.
pub struct StoreSubscription {
    store: Weak<Mutex<StoreInner>>,
    id: u64,
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            inner.lock().listeners.remove(&self.id);
        }
    }
}

/// The reactive element store: the single writer of local element state.
///
/// Tools mutate the canvas through [`ElementStore::set_elements`]; the
/// sync bridge both subscribes to it (local changes out) and writes to
/// it (remote changes in). Handles are clonable and share one state.
#[derive(Clone)]
pub struct ElementStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for ElementStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                state: StoreState::default(),
                listeners: BTreeMap::new(),
                next: 0,
            })),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> StoreState {
        self.inner.lock().state.clone()
    }

    /// Replaces the element list and notifies subscribers.
    pub fn set_elements(&self, elements: Arc<Vec<Element>>) {
        self.update(|state| state.elements = elements);
    }

    /// Replaces the selection and notifies subscribers.
    pub fn set_selected(&self, selected_ids: Vec<String>) {
        self.update(|state| state.selected_ids = selected_ids);
    }

    /// Replaces the active tool and notifies subscribers.
    pub fn set_active_tool(&self, tool: Option<String>) {
        self.update(|state| state.active_tool = tool);
    }

    /// Registers a listener invoked with `(current, previous)` after
    /// every state change.
    pub fn subscribe(
        &self,
        listener: impl Fn(&StoreState, &StoreState) + Send + Sync + 'static,
    ) -> StoreSubscription {
        let mut inner = self.inner.lock();
        let id = inner.next;
        inner.next += 1;
        inner.listeners.insert(id, Arc::new(listener));
        StoreSubscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn update(&self, f: impl FnOnce(&mut StoreState)) {
        let (current, previous, listeners) = {
            let mut inner = self.inner.lock();
            let previous = inner.state.clone();
            f(&mut inner.state);
            let current = inner.state.clone();
            let listeners: Vec<StoreListener> = inner.listeners.values().cloned().collect();
            (current, previous, listeners)
        };
        // listeners run unlocked so they may read or write the store
        for listener in listeners {
            listener(&current, &previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listener_sees_current_and_previous() {
        let store = ElementStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _sub = store.subscribe(move |current, previous| {
            assert_eq!(current.elements.len(), previous.elements.len() + 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.set_elements(Arc::new(vec![Element::new(ElementKind::Ellipse)]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_subscription_goes_quiet() {
        let store = ElementStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = store.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.set_selected(vec!["e1".to_owned()]);
        drop(sub);
        store.set_selected(vec![]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_state() {
        let store = ElementStore::new();
        let other = store.clone();
        other.set_active_tool(Some("rectangle".to_owned()));
        assert_eq!(store.state().active_tool.as_deref(), Some("rectangle"));
    }
}
