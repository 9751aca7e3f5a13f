//! The WebSocket session carrying sync and awareness traffic.
//!
//! The relay is a dumb per-room fan-out: every frame a client sends is
//! delivered to every other client in the room. Convergence does not
//! depend on the relay understanding the frames. On (re)connect a client
//! announces its state vector; peers answer with the ops it is missing,
//! so nothing needs to be buffered across disconnects.

use crate::awareness::Awareness;
use crate::config::CollabConfig;
use anyhow::{anyhow, Result};
use async_tungstenite::async_std::connect_async;
use async_tungstenite::tungstenite::Message as WsMessage;
use bytecheck::CheckBytes;
use easel_crdt::{Delta, Doc, Lamport, Ref, StateVector};
use futures::channel::mpsc;
use futures::prelude::*;
use futures_timer::Delay;
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Connection state as reported to subscribers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// No session.
    Disconnected,
    /// Dialing the relay.
    Connecting,
    /// Session established.
    Connected,
    /// The last attempt or session failed; a retry is pending.
    Error,
}

/// A frame exchanged between room members.
#[derive(Debug, Archive, Deserialize, Serialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
pub enum WireMessage {
    /// "Here is what I have" -- sent on join; peers answer with step 2.
    SyncStep1(Vec<Lamport>),
    /// The ops the requester was missing.
    SyncStep2(Delta),
    /// An incremental update produced by one local transaction.
    Update(Delta),
    /// An awareness frame, opaque at this layer.
    Awareness(Vec<u8>),
}

enum Command {
    Send(WireMessage),
    Close,
}

type StatusListener = Arc<dyn Fn(Status) + Send + Sync>;

struct TransportShared {
    status: Mutex<Status>,
    listeners: Mutex<BTreeMap<u64, StatusListener>>,
    next: Mutex<u64>,
    closed: AtomicBool,
}

impl TransportShared {
    fn new() -> Self {
        Self {
            status: Mutex::new(Status::Disconnected),
            listeners: Mutex::new(BTreeMap::new()),
            next: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn set_status(&self, status: Status) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        let listeners: Vec<StatusListener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Keeps a status listener registered; dropping it unsubscribes.
pub struct StatusSubscription {
    shared: Weak<TransportShared>,
    id: u64,
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.lock().remove(&self.id);
        }
    }
}

/// One WebSocket session keyed on `(server_url, room_name)`.
///
/// The session runs as a detached task fed through a command channel;
/// it reconnects on its own with capped backoff until [`Transport::close`].
pub struct Transport {
    cmd: mpsc::UnboundedSender<Command>,
    shared: Arc<TransportShared>,
}

impl Transport {
    /// Opens a session and starts the background pump.
    pub fn connect(config: &CollabConfig, doc: Doc, awareness: Awareness) -> Result<Transport> {
        let url = session_url(
            &config.server_url,
            &config.room_name,
            config.auth_token.as_deref(),
        )?;
        let (tx, rx) = mpsc::unbounded();
        let shared = Arc::new(TransportShared::new());
        let task_shared = shared.clone();
        async_global_executor::spawn(run_session(url, doc, awareness, rx, task_shared)).detach();
        Ok(Transport { cmd: tx, shared })
    }

    /// Queues an incremental update for broadcast.
    pub fn send_update(&self, delta: Delta) {
        self.cmd
            .unbounded_send(Command::Send(WireMessage::Update(delta)))
            .ok();
    }

    /// Queues an awareness frame for broadcast.
    pub fn send_awareness(&self, frame: Vec<u8>) {
        self.cmd
            .unbounded_send(Command::Send(WireMessage::Awareness(frame)))
            .ok();
    }

    /// The current connection status.
    pub fn status(&self) -> Status {
        *self.shared.status.lock()
    }

    /// True while the session is established.
    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Registers a listener fired on every status transition.
    pub fn on_status_change(
        &self,
        f: impl Fn(Status) + Send + Sync + 'static,
    ) -> StatusSubscription {
        let mut next = self.shared.next.lock();
        let id = *next;
        *next += 1;
        self.shared.listeners.lock().insert(id, Arc::new(f));
        StatusSubscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Ends the session; no reconnection happens afterwards.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.cmd.unbounded_send(Command::Close).ok();
    }

    /// A clonable send-only handle, for wiring sinks to the session.
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            cmd: self.cmd.clone(),
        }
    }
}

/// Feeds frames into the session without owning it.
#[derive(Clone)]
pub struct CommandSender {
    cmd: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    /// Queues an incremental update for broadcast.
    pub fn send_update(&self, delta: Delta) {
        self.cmd
            .unbounded_send(Command::Send(WireMessage::Update(delta)))
            .ok();
    }

    /// Queues an awareness frame for broadcast.
    pub fn send_awareness(&self, frame: Vec<u8>) {
        self.cmd
            .unbounded_send(Command::Send(WireMessage::Awareness(frame)))
            .ok();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds `<server_url>/<room>?token=...`.
fn session_url(server_url: &str, room: &str, token: Option<&str>) -> Result<url::Url> {
    let mut url = url::Url::parse(server_url)?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("invalid server url {:?}", server_url))?
        .pop_if_empty()
        .push(room);
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

async fn run_session(
    url: url::Url,
    doc: Doc,
    awareness: Awareness,
    mut rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<TransportShared>,
) {
    let mut backoff = Duration::from_millis(500);
    loop {
        if shared.is_closed() {
            break;
        }
        shared.set_status(Status::Connecting);
        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                tracing::debug!("connected to {}", url);
                shared.set_status(Status::Connected);
                backoff = Duration::from_millis(500);
                let (mut sink, mut stream) = ws.split();
                // announce what we have and who we are
                let step1 = WireMessage::SyncStep1(doc.state_vector().iter().collect());
                send_msg(&mut sink, &step1).await.ok();
                send_msg(&mut sink, &WireMessage::Awareness(awareness.local_frame()))
                    .await
                    .ok();

                loop {
                    futures::select! {
                        cmd = rx.next() => match cmd {
                            Some(Command::Send(msg)) => {
                                if send_msg(&mut sink, &msg).await.is_err() {
                                    shared.set_status(Status::Error);
                                    break;
                                }
                            }
                            Some(Command::Close) | None => {
                                shared.closed.store(true, Ordering::SeqCst);
                                sink.close().await.ok();
                                break;
                            }
                        },
                        frame = stream.next().fuse() => match frame {
                            Some(Ok(WsMessage::Binary(bytes))) => {
                                if let Some(reply) = handle_frame(&doc, &awareness, &bytes) {
                                    if send_msg(&mut sink, &reply).await.is_err() {
                                        shared.set_status(Status::Error);
                                        break;
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Ping(payload))) => {
                                sink.send(WsMessage::Pong(payload)).await.ok();
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                tracing::debug!("websocket error: {}", err);
                                shared.set_status(Status::Error);
                                break;
                            }
                        },
                    }
                }
            }
            Err(err) => {
                tracing::debug!("connect to {} failed: {}", url, err);
                shared.set_status(Status::Error);
            }
        }
        if shared.is_closed() {
            break;
        }
        // the transport owns retry; nothing above it buffers
        let mut delay = Delay::new(backoff).fuse();
        futures::select! {
            _ = delay => {}
            cmd = rx.next() => {
                if matches!(cmd, Some(Command::Close) | None) {
                    shared.closed.store(true, Ordering::SeqCst);
                }
            }
        }
        backoff = (backoff * 2).min(Duration::from_secs(10));
    }
    shared.set_status(Status::Disconnected);
}

async fn send_msg<S>(sink: &mut S, msg: &WireMessage) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(WsMessage::Binary(Ref::archive(msg).into_bytes()))
        .await
        .map_err(|err| anyhow!("send failed: {}", err))
}

/// Dispatches one inbound frame; returns the reply frame, if any.
fn handle_frame(doc: &Doc, awareness: &Awareness, bytes: &[u8]) -> Option<WireMessage> {
    let msg = match Ref::<WireMessage>::checked(bytes).and_then(|msg| msg.to_owned()) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::debug!("dropping malformed frame: {}", err);
            return None;
        }
    };
    match msg {
        WireMessage::SyncStep1(entries) => {
            let sv: StateVector = entries.into_iter().collect();
            let diff = doc.diff(&sv);
            if diff.is_empty() {
                None
            } else {
                Some(WireMessage::SyncStep2(diff))
            }
        }
        WireMessage::SyncStep2(delta) | WireMessage::Update(delta) => {
            doc.apply_delta(&delta);
            None
        }
        WireMessage::Awareness(frame) => {
            if let Err(err) = awareness.apply_frame(&frame) {
                tracing::debug!("dropping awareness frame: {}", err);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_crdt::ActorId;

    #[test]
    fn urls_carry_room_and_token() {
        let url = session_url("ws://localhost:4040", "sketch", Some("s3cret")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:4040/sketch?token=s3cret");
        let url = session_url("wss://relay.example/ws/", "a b", None).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example/ws/a%20b");
    }

    #[test]
    fn wire_messages_round_trip() {
        let delta = {
            let doc = Doc::with_actor(ActorId::new(9));
            doc.transact(easel_crdt::Origin::LocalSync, |txn| {
                txn.put_record("e1");
                txn.put_field("e1", "x", 4.0);
            });
            doc.diff(&StateVector::new())
        };
        let msg = WireMessage::Update(delta.clone());
        let bytes = Ref::archive(&msg).into_bytes();
        match Ref::<WireMessage>::checked(&bytes).unwrap().to_owned().unwrap() {
            WireMessage::Update(decoded) => assert_eq!(decoded, delta),
            _ => unreachable!(),
        }
    }

    #[test]
    fn sync_step1_is_answered_with_missing_ops() {
        let doc = Doc::with_actor(ActorId::new(1));
        doc.transact(easel_crdt::Origin::LocalSync, |txn| {
            txn.put_record("e1");
        });
        let awareness = Awareness::new(ActorId::new(1));
        let ask = WireMessage::SyncStep1(Vec::new());
        let reply = handle_frame(&doc, &awareness, Ref::archive(&ask).as_bytes());
        match reply {
            Some(WireMessage::SyncStep2(delta)) => assert!(!delta.is_empty()),
            other => panic!("expected step2, got {:?}", other.is_some()),
        }
        // a peer that has everything gets no reply
        let ask = WireMessage::SyncStep1(doc.state_vector().iter().collect());
        assert!(handle_frame(&doc, &awareness, Ref::archive(&ask).as_bytes()).is_none());
    }
}
