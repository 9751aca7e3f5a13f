//! A y-websocket-style relay: one room per URL path, every frame fanned
//! out verbatim to the other members of the room. The relay never looks
//! inside a frame; convergence is entirely the clients' business.

use anyhow::{Context as _, Result};
use clap::Parser;
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use tracing_subscriber::fmt;

#[derive(Parser)]
struct Opts {
    /// Address to listen on.
    #[clap(long, default_value = "0.0.0.0:4040")]
    listen: SocketAddr,
    /// When set, clients must present this value as `?token=`.
    #[clap(long)]
    token: Option<String>,
}

type ClientId = u64;
type Members = FnvHashMap<ClientId, mpsc::UnboundedSender<Message>>;
type Rooms = Arc<Mutex<FnvHashMap<String, Members>>>;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    fmt::init();
    let rooms: Rooms = Default::default();
    let token = Arc::new(opts.token);
    let listener = TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("binding {}", opts.listen))?;
    info!("listening on {}", opts.listen);
    let mut next_id: ClientId = 0;
    loop {
        let (stream, addr) = listener.accept().await?;
        next_id += 1;
        let id = next_id;
        let rooms = rooms.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(stream, id, rooms, token).await {
                debug!("client {} ({}): {}", id, addr, err);
            }
        });
    }
}

async fn serve(
    stream: TcpStream,
    id: ClientId,
    rooms: Rooms,
    token: Arc<Option<String>>,
) -> Result<()> {
    let mut room = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        room = req.uri().path().trim_start_matches('/').to_owned();
        if room.is_empty() {
            return Err(bad_request("missing room"));
        }
        if let Some(expected) = token.as_deref() {
            let presented = req
                .uri()
                .query()
                .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("token=")));
            if presented != Some(expected) {
                return Err(unauthorized());
            }
        }
        Ok(resp)
    })
    .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let own_tx = tx.clone();
    rooms
        .lock()
        .await
        .entry(room.clone())
        .or_default()
        .insert(id, tx);
    info!("client {} joined room {:?}", id, room);

    let (mut sink, mut source) = ws.split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Binary(bytes)) => {
                let lock = rooms.lock().await;
                if let Some(members) = lock.get(&room) {
                    for (peer, sender) in members.iter() {
                        if *peer != id {
                            sender.send(Message::Binary(bytes.clone())).ok();
                        }
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                own_tx.send(Message::Pong(payload)).ok();
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let mut lock = rooms.lock().await;
    if let Some(members) = lock.get_mut(&room) {
        members.remove(&id);
        if members.is_empty() {
            lock.remove(&room);
        }
    }
    writer.abort();
    info!("client {} left room {:?}", id, room);
    Ok(())
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_owned()));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

fn unauthorized() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("bad token".to_owned()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}
