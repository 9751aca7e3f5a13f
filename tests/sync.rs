//! End-to-end scenarios for the sync bridge: two replicas, each with its
//! own store and bridge, exchanging deltas doc-to-doc the way the
//! transport would deliver them.

use easel::{
    compare_sort_order, Element, ElementKind, ElementStore, SortKey, Style, SyncBridge,
};
use easel_crdt::{ActorId, Doc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEBOUNCE: Duration = Duration::from_millis(30);

async fn settle() {
    // debounce + coalesce + scheduling slack
    async_std::task::sleep(Duration::from_millis(250)).await;
}

/// Wires a's local deltas into b, counting the transactions that flow.
fn wire(a: &Doc, b: &Doc) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let peer = b.clone();
    a.set_sink(move |delta| {
        counter.fetch_add(1, Ordering::SeqCst);
        peer.apply_delta(&delta);
    });
    count
}

struct Client {
    doc: Doc,
    store: ElementStore,
    bridge: Arc<SyncBridge>,
}

impl Client {
    fn new(actor: u64) -> Self {
        let doc = Doc::with_actor(ActorId::new(actor));
        let store = ElementStore::new();
        let bridge = Arc::new(SyncBridge::new(doc.clone()));
        Self { doc, store, bridge }
    }

    fn start(&self) {
        self.bridge.start(&self.store, DEBOUNCE);
    }

    fn elements(&self) -> Vec<Element> {
        (*self.store.state().elements).clone()
    }
}

fn pair() -> (Client, Client, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let a = Client::new(1);
    let b = Client::new(2);
    let a_sent = wire(&a.doc, &b.doc);
    let b_sent = wire(&b.doc, &a.doc);
    a.start();
    b.start();
    (a, b, a_sent, b_sent)
}

fn rectangle(id: &str) -> Element {
    let mut e = Element::new(ElementKind::Rectangle { corner_radius: 0.0 })
        .with_rect(10.0, 20.0, 100.0, 50.0);
    e.id = id.to_owned();
    e.style = Style {
        fill_color: "#f00".to_owned(),
        ..Style::default()
    };
    e
}

#[async_std::test]
async fn two_client_add() {
    let (a, b, _, _) = pair();
    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    settle().await;

    let seen = b.elements();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], rectangle("e1"));
    // the receiving bridge's last-known list matches what it pushed
    assert_eq!(*b.bridge.last_elements(), seen);
}

#[async_std::test]
async fn echo_safety() {
    let (a, b, _, _) = pair();

    // count every store notification on the originating side, and how
    // many of them were pushed by the bridge itself
    let notifications = Arc::new(AtomicUsize::new(0));
    let bridge_pushes = Arc::new(AtomicUsize::new(0));
    let all = notifications.clone();
    let from_bridge = bridge_pushes.clone();
    let bridge = a.bridge.clone();
    let _sub = a.store.subscribe(move |_, _| {
        all.fetch_add(1, Ordering::SeqCst);
        // bridge pushes happen synchronously under the remote flag
        if bridge.is_applying_remote() {
            from_bridge.fetch_add(1, Ordering::SeqCst);
        }
    });

    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    settle().await;

    // exactly the one local notification; nothing echoed back
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(bridge_pushes.load(Ordering::SeqCst), 0);
    assert_eq!(b.elements().len(), 1);
}

#[async_std::test]
async fn concurrent_style_edit_resolves_last_writer() {
    let (a, b, _, _) = pair();
    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    settle().await;

    // a writes 4.0 first; b, having observed it, writes 7.0
    let mut from_a = a.elements();
    from_a[0].style.stroke_width = 4.0;
    a.store.set_elements(Arc::new(from_a));
    settle().await;

    let mut from_b = b.elements();
    assert_eq!(from_b[0].style.stroke_width, 4.0);
    from_b[0].style.stroke_width = 7.0;
    b.store.set_elements(Arc::new(from_b));
    settle().await;

    assert_eq!(a.elements()[0].style.stroke_width, 7.0);
    assert_eq!(b.elements()[0].style.stroke_width, 7.0);
    // untouched fields stay intact on both sides
    assert_eq!(a.elements()[0].style.fill_color, "#f00");
    assert_eq!(a.elements()[0].width, 100.0);
}

#[async_std::test]
async fn concurrent_adds_union_and_agree_on_order() {
    let (a, b, _, _) = pair();
    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    settle().await;

    let mut on_a = a.elements();
    on_a.push(rectangle("e2"));
    a.store.set_elements(Arc::new(on_a));
    let mut on_b = b.elements();
    on_b.push(rectangle("e3"));
    b.store.set_elements(Arc::new(on_b));
    settle().await;

    let ids = |elements: &[Element]| {
        elements
            .iter()
            .map(|e| e.id.clone())
            .collect::<Vec<String>>()
    };
    let a_ids = ids(&a.elements());
    let b_ids = ids(&b.elements());
    assert_eq!(a_ids.len(), 3);
    assert_eq!(a_ids, b_ids, "replicas must agree on projection order");
    for id in ["e1", "e2", "e3"] {
        assert!(a_ids.iter().any(|x| x == id));
    }
}

#[async_std::test]
async fn delete_propagates() {
    let (a, b, _, _) = pair();
    a.store
        .set_elements(Arc::new(vec![rectangle("e1"), rectangle("e2")]));
    settle().await;
    assert_eq!(b.elements().len(), 2);

    let kept: Vec<Element> = a.elements().into_iter().filter(|e| e.id != "e1").collect();
    a.store.set_elements(Arc::new(kept));
    settle().await;

    let ids: Vec<String> = b.elements().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["e2".to_owned()]);
    assert!(b.doc.snapshot("e1").is_none(), "record must be gone");
}

#[async_std::test]
async fn rapid_updates_are_batched() {
    let (a, b, a_sent, _) = pair();
    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    settle().await;
    let before = a_sent.load(Ordering::SeqCst);

    // ~40 updates in quick succession, far faster than the debounce;
    // each replaces the single in-progress stroke with one more point
    let mut points = Vec::new();
    for i in 0..40u32 {
        points.extend_from_slice(&[10.0 + i as f64, 20.0 + (i * 2) as f64]);
        let mut stroke = Element::new(ElementKind::Freedraw {
            points: points.clone(),
            pressures: None,
            is_complete: false,
        });
        stroke.id = "stroke".to_owned();
        a.store
            .set_elements(Arc::new(vec![rectangle("e1"), stroke]));
        async_std::task::sleep(Duration::from_millis(2)).await;
    }
    // finish the stroke
    let mut list = a.elements();
    for e in list.iter_mut() {
        e.complete_freedraw();
    }
    a.store.set_elements(Arc::new(list));
    settle().await;

    let transactions = a_sent.load(Ordering::SeqCst) - before;
    assert!(
        transactions <= 5,
        "40 updates must coalesce into a few transactions, got {}",
        transactions
    );

    let on_b = b.elements();
    let stroke = on_b.iter().find(|e| e.id == "stroke").unwrap();
    match &stroke.kind {
        ElementKind::Freedraw {
            is_complete,
            points,
            ..
        } => {
            assert!(*is_complete);
            // completed strokes carry element-local points
            assert_eq!(points[0], 0.0);
            assert_eq!(points[1], 0.0);
        }
        _ => unreachable!(),
    }
}

#[async_std::test]
async fn sort_keys_order_the_projection() {
    let (a, b, _, _) = pair();
    let first = SortKey::half();
    let second = first.succ();
    let mut e1 = rectangle("e1");
    e1.sort_order = Some(second.clone());
    let mut e2 = rectangle("e2");
    e2.sort_order = Some(first.clone());
    a.store.set_elements(Arc::new(vec![e1, e2]));
    settle().await;

    let ids: Vec<String> = b.elements().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["e2".to_owned(), "e1".to_owned()]);
}

#[async_std::test]
async fn unkeyed_elements_keep_insertion_order() {
    let (a, b, _, _) = pair();
    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    settle().await;
    let mut list = a.elements();
    list.push(rectangle("e2"));
    a.store.set_elements(Arc::new(list));
    settle().await;

    let ids: Vec<String> = b.elements().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["e1".to_owned(), "e2".to_owned()]);
}

#[async_std::test]
async fn local_init_seeds_an_empty_collection() {
    let a = Client::new(1);
    let b = Client::new(2);
    let _ = wire(&a.doc, &b.doc);
    let _ = wire(&b.doc, &a.doc);

    // the local store already has content when sync starts
    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    a.start();
    settle().await;
    assert!(a.doc.contains("e1"), "local-init must seed the collection");

    // a late joiner pulls the seeded state through a diff exchange
    b.doc.apply_delta(&a.doc.diff(&b.doc.state_vector()));
    b.start();
    settle().await;
    assert_eq!(b.elements().len(), 1);
}

#[async_std::test]
async fn remote_field_update_lands_without_rebuild() {
    let (a, b, _, _) = pair();
    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    settle().await;

    // mutate one field on a; b's deep observer path must apply it
    let mut list = a.elements();
    list[0].x = 99.0;
    a.store.set_elements(Arc::new(list));
    settle().await;

    assert_eq!(b.elements()[0].x, 99.0);
    assert_eq!(b.elements()[0].style.fill_color, "#f00");
}

#[async_std::test]
async fn restart_is_idempotent() {
    let (a, b, _, _) = pair();
    a.store.set_elements(Arc::new(vec![rectangle("e1")]));
    settle().await;

    // starting again while running restarts cleanly
    a.bridge.start(&a.store, DEBOUNCE);
    let mut list = a.elements();
    list[0].y = 77.0;
    a.store.set_elements(Arc::new(list));
    settle().await;
    assert_eq!(b.elements()[0].y, 77.0);

    // after stop, local changes stay local
    a.bridge.stop();
    let mut list = a.elements();
    list[0].y = 123.0;
    a.store.set_elements(Arc::new(list));
    settle().await;
    assert_eq!(b.elements()[0].y, 77.0);
}

#[test]
fn projection_sort_is_stable() {
    let mut elements = vec![rectangle("a"), rectangle("b"), rectangle("c")];
    elements[1].sort_order = Some(SortKey::half());
    let mut sorted = elements.clone();
    sorted.sort_by(compare_sort_order);
    let ids: Vec<&str> = sorted.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}
