use crate::awareness::{Awareness, AwarenessState, AWARENESS_TIMEOUT};
use crate::config::CollabConfig;
use crate::transport::{Status, StatusSubscription, Transport};
use anyhow::Result;
use easel_crdt::Doc;
use futures_timer::Delay;
use std::time::Duration;

/// Owns one shared document and the transport session carrying it.
///
/// Connecting wires the document's delta sink and the awareness frame
/// sink into the transport and seeds the local awareness record with the
/// configured user. Disposal tears all of it down; a disposed provider
/// is finished, a new session means a new provider.
pub struct Provider {
    doc: Doc,
    awareness: Awareness,
    transport: Transport,
    server_url: String,
    room_name: String,
}

impl Provider {
    /// Connects a fresh document to a room.
    pub fn connect(config: &CollabConfig) -> Result<Provider> {
        let doc = Doc::new();
        let awareness = Awareness::new(doc.actor());
        let transport = Transport::connect(config, doc.clone(), awareness.clone())?;

        let sender = transport.sender();
        doc.set_sink(move |delta| sender.send_update(delta));
        let sender = transport.sender();
        awareness.set_sink(move |frame| sender.send_awareness(frame));

        awareness.set_local(AwarenessState {
            user: Some(config.user.clone()),
            cursor: None,
            selected_ids: Vec::new(),
            active_tool: None,
            viewport: None,
        });

        // keep our own entry alive at peers and age out silent ones;
        // the task dies with the awareness
        let weak = awareness.downgrade();
        async_global_executor::spawn(async move {
            loop {
                Delay::new(Duration::from_secs(10)).await;
                match weak.upgrade() {
                    Some(awareness) => {
                        awareness.refresh();
                        awareness.prune(AWARENESS_TIMEOUT);
                    }
                    None => break,
                }
            }
        })
        .detach();

        tracing::info!(
            "joining room {:?} at {}",
            config.room_name,
            config.server_url
        );
        Ok(Provider {
            doc,
            awareness,
            transport,
            server_url: config.server_url.clone(),
            room_name: config.room_name.clone(),
        })
    }

    /// The session key: `(server_url, room_name)`.
    pub fn session_key(&self) -> (&str, &str) {
        (&self.server_url, &self.room_name)
    }

    /// The shared document; it doubles as the handle to the element
    /// collection (the document's single top-level map).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// A clonable handle to the element collection.
    pub fn elements(&self) -> Doc {
        self.doc.clone()
    }

    /// The awareness host for this session.
    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    /// Current transport status.
    pub fn status(&self) -> Status {
        self.transport.status()
    }

    /// True while a session exists and the transport is connected.
    pub fn is_active(&self) -> bool {
        self.transport.is_connected()
    }

    /// Registers a transport status listener.
    pub fn on_status_change(
        &self,
        f: impl Fn(Status) + Send + Sync + 'static,
    ) -> StatusSubscription {
        self.transport.on_status_change(f)
    }

    /// Announces departure, closes the transport and drops the document
    /// sink.
    pub fn dispose(&self) {
        self.awareness.clear_local();
        self.transport.close();
        self.doc.clear_sink();
        tracing::info!("left room {:?}", self.room_name);
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.dispose();
    }
}
